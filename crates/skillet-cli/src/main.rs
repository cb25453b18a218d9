//! Skillet - skill evaluation and tuning
//!
//! The `skillet` command measures how reliably a skill steers an agent.
//!
//! ## Commands
//!
//! - `eval`: Run eval cases against the baseline or a skill
//! - `compare`: Compare cached baseline and skill results
//! - `tune`: Rewrite a skill toward a target pass rate

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Level};

use skillet_core::compare::format_delta;
use skillet_core::metrics::METRICS;
use skillet_core::progress::final_summary;
use skillet_core::reporting::render_tune_summary_md;
use skillet_core::{
    evaluate_gate, load_evals, sample_cases, AnthropicConfig, AnthropicModelCaller,
    DriverImprover, EvalCase, EvalRunner, EvalSchedule, FileSkillStore, FsSampleStore, GateInput,
    GateRule, Grader, ModelCaller, ModelProposer, OptimizationDriver, OptimizerConfig,
    ProgressOptions, ProgressReporter, RetryPolicy, RunConfig, RunnerEvaluator, RunnerProbe,
    SampleCache, SkillStore, Target, TrialCallbacks, TuneCallbacks, TuneConfig, TuneOrchestrator,
};

const DEFAULT_CACHE_DIR: &str = ".skillet/cache";
const DEFAULT_TUNE_DIR: &str = ".skillet/tunes";

#[derive(Parser)]
#[command(name = "skillet")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluate and tune agent skills", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Sample cache directory
    #[arg(long, global = true, env = "SKILLET_CACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Model name
    #[arg(long, env = "SKILLET_MODEL")]
    model: Option<String>,

    /// Messages API base URL
    #[arg(long, env = "SKILLET_API_URL")]
    api_url: Option<String>,

    /// API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    /// Eval file or directory of eval files
    evals: PathBuf,

    /// Evaluate at most this many randomly chosen evals
    #[arg(long)]
    max_evals: Option<usize>,

    /// Seed for eval selection and minibatch sampling
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run evals against the baseline, or against a skill when one is given
    Eval {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Skill file or directory containing SKILL.md
        skill: Option<PathBuf>,

        /// Samples per eval
        #[arg(short, long, default_value = "3")]
        samples: usize,

        /// Maximum samples in flight
        #[arg(short, long, default_value = "3")]
        parallel: usize,

        /// Abort the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Ignore cached results
        #[arg(long)]
        skip_cache: bool,

        /// Exit non-zero when the pass rate (percent) is below this
        #[arg(long)]
        min_pass_rate: Option<f64>,

        /// Write run metrics as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Compare cached baseline and skill results without calling a model
    Compare {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Skill file or directory containing SKILL.md
        skill: PathBuf,

        /// Sample indices to look up per eval
        #[arg(short, long, default_value = "3")]
        samples: usize,

        /// Exit non-zero when the skill regresses more than this many points
        #[arg(long)]
        max_regression: Option<f64>,
    },

    /// Tune a skill toward a target pass rate
    Tune {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Skill file or directory containing SKILL.md
        skill: PathBuf,

        /// Maximum tune rounds
        #[arg(short = 'r', long, default_value = "5")]
        max_rounds: usize,

        /// Stop once a round reaches this pass rate (percent)
        #[arg(short, long, default_value = "100")]
        target: f64,

        /// Samples per eval
        #[arg(short, long, default_value = "1")]
        samples: usize,

        /// Maximum samples in flight
        #[arg(short, long, default_value = "3")]
        parallel: usize,

        /// Candidate instructions proposed per round
        #[arg(long, default_value = "10")]
        candidates: usize,

        /// Evals per minibatch trial (0 evaluates every trial on all evals)
        #[arg(long, default_value = "5")]
        minibatch: usize,

        /// Run a full evaluation every N trials
        #[arg(long, default_value = "5")]
        full_eval_every: usize,

        /// Tune artifact path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the full tune report here
        #[arg(long)]
        report: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    skillet_core::telemetry::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Eval {
            selection,
            skill,
            samples,
            parallel,
            timeout,
            skip_cache,
            min_pass_rate,
            output,
            model,
        } => {
            let config = RunConfig {
                samples_per_eval: samples.max(1),
                parallelism: parallel.max(1),
                retry: RetryPolicy::default(),
                timeout: timeout.map(Duration::from_secs),
                bypass_cache: skip_cache,
            };
            cmd_eval(
                &cli.cache_dir,
                &selection,
                skill.as_deref(),
                config,
                min_pass_rate,
                output.as_deref(),
                &model,
            )
            .await
        }
        Commands::Compare {
            selection,
            skill,
            samples,
            max_regression,
        } => cmd_compare(&cli.cache_dir, &selection, &skill, samples, max_regression),
        Commands::Tune {
            selection,
            skill,
            max_rounds,
            target,
            samples,
            parallel,
            candidates,
            minibatch,
            full_eval_every,
            output,
            report,
            model,
        } => {
            let config = TuneConfig {
                max_rounds,
                target_pass_rate: target,
                samples: samples.max(1),
                parallel: parallel.max(1),
            };
            let schedule = if minibatch == 0 {
                EvalSchedule::full(candidates + 1)
            } else {
                EvalSchedule::for_candidates(candidates, minibatch, full_eval_every)
            };
            cmd_tune(
                &cli.cache_dir,
                &selection,
                &skill,
                config,
                schedule,
                output.as_deref(),
                report.as_deref(),
                &model,
            )
            .await
        }
    };

    METRICS.flush();
    result
}

fn use_color() -> bool {
    std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
}

fn open_cache(dir: &Path) -> Result<Arc<SampleCache>> {
    let store = FsSampleStore::new(dir)
        .with_context(|| format!("Failed to open sample cache at {}", dir.display()))?;
    Ok(Arc::new(SampleCache::with_store(Arc::new(store))))
}

fn model_caller(args: &ModelArgs) -> Result<Arc<dyn ModelCaller>> {
    let mut config = AnthropicConfig::from_env();
    if let Some(model) = &args.model {
        config = config.with_model(model);
    }
    if let Some(url) = &args.api_url {
        config = config.with_base_url(url);
    }
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key);
    }
    let caller = AnthropicModelCaller::new(config).context("Failed to configure model caller")?;
    Ok(Arc::new(caller))
}

fn load_selection(selection: &SelectionArgs) -> Result<Vec<EvalCase>> {
    let cases = load_evals(&selection.evals)
        .with_context(|| format!("Failed to load evals from {}", selection.evals.display()))?;
    Ok(sample_cases(cases, selection.max_evals, selection.seed))
}

fn read_skill(path: &Path) -> Result<(FileSkillStore, String)> {
    let store = FileSkillStore::open(path)
        .with_context(|| format!("Skill not found at {}", path.display()))?;
    let text = store.read().context("Failed to read skill")?;
    Ok((store, text))
}

/// Name of an eval set: the directory or file stem.
fn eval_set_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "evals".to_string())
}

fn default_artifact_path(eval_set: &str, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
    PathBuf::from(DEFAULT_TUNE_DIR).join(format!("{}-{}.json", eval_set, now.format("%Y%m%d-%H%M%S")))
}

fn percent_or_dash(rate: Option<f64>) -> String {
    rate.map(|r| format!("{r:.0}%")).unwrap_or_else(|| "-".to_string())
}

async fn cmd_eval(
    cache_dir: &Path,
    selection: &SelectionArgs,
    skill: Option<&Path>,
    config: RunConfig,
    min_pass_rate: Option<f64>,
    output: Option<&Path>,
    model: &ModelArgs,
) -> Result<()> {
    let cases = load_selection(selection)?;
    let target = match skill {
        Some(path) => Target::skill(read_skill(path)?.1),
        None => Target::Baseline,
    };
    let caller = model_caller(model)?;
    let runner = EvalRunner::new(
        Arc::clone(&caller),
        Grader::new(caller),
        open_cache(cache_dir)?,
        config,
    );

    println!(
        "Evaluating {} evals x {} samples against {}",
        cases.len(),
        runner.config().samples_per_eval,
        target.id()
    );
    let color = use_color();
    let board = runner.prepare(&cases, &target);
    let reporter = ProgressReporter::spawn(
        Arc::clone(&board),
        ProgressOptions {
            color,
            ..ProgressOptions::default()
        },
    );
    let result = runner.execute(board).await;
    reporter.finish().await;

    println!();
    println!("{}", final_summary(&result.metrics, &result.snapshot, result.timed_out, color));

    if let Some(path) = output {
        let content =
            serde_json::to_string_pretty(&result.metrics).context("serialize run metrics")?;
        std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
        info!(path = %path.display(), "wrote run metrics");
    }

    let rules: Vec<GateRule> = min_pass_rate
        .map(|min| GateRule::MinPassRate { min })
        .into_iter()
        .collect();
    let verdict = evaluate_gate(&rules, &GateInput::new(result.pass_rate()));
    if verdict.passed() {
        Ok(())
    } else {
        for v in &verdict.violations {
            println!("  - {}", v.reason);
        }
        anyhow::bail!("Eval gate failed")
    }
}

fn cmd_compare(
    cache_dir: &Path,
    selection: &SelectionArgs,
    skill: &Path,
    samples: usize,
    max_regression: Option<f64>,
) -> Result<()> {
    let cases = load_selection(selection)?;
    let (_, skill_text) = read_skill(skill)?;
    let cache = open_cache(cache_dir)?;
    let report = skillet_core::compare(&cache, &cases, &skill_text, samples.max(1));
    let name = eval_set_name(&selection.evals);

    if !report.missing_baseline.is_empty() {
        println!("Warning: No baseline cache for: {}", report.missing_baseline.join(", "));
        println!("Run: skillet eval {}", selection.evals.display());
        println!();
    }
    if !report.missing_skill.is_empty() {
        println!("Warning: No skill cache for: {}", report.missing_skill.join(", "));
        println!(
            "Run: skillet eval {} {}",
            selection.evals.display(),
            skill.display()
        );
        println!();
    }

    let width = report
        .results
        .iter()
        .map(|r| r.eval_id.chars().count())
        .chain(std::iter::once("Overall".len()))
        .max()
        .unwrap_or(0);
    println!("Comparison: {name}");
    println!("{:<width$}  {:>8}  {:>8}  {:>6}", "Eval", "Baseline", "Skill", "Δ");
    for r in &report.results {
        println!(
            "{:<width$}  {:>8}  {:>8}  {:>6}",
            r.eval_id,
            percent_or_dash(r.baseline),
            percent_or_dash(r.skill),
            format_delta(r.delta())
        );
    }
    println!(
        "{:<width$}  {:>8}  {:>8}  {:>6}",
        "Overall",
        percent_or_dash(report.overall_baseline()),
        percent_or_dash(report.overall_skill()),
        format_delta(report.overall_delta())
    );

    let (Some(max), Some(skill_rate)) = (max_regression, report.overall_skill()) else {
        if max_regression.is_some() {
            warn!("no cached skill results; regression gate skipped");
        }
        return Ok(());
    };
    let mut input = GateInput::new(skill_rate);
    if let Some(baseline) = report.overall_baseline() {
        input = input.with_baseline(baseline);
    }
    let verdict = evaluate_gate(&[GateRule::MaxRegression { max }], &input);
    if verdict.passed() {
        Ok(())
    } else {
        for v in &verdict.violations {
            println!("  - {}", v.reason);
        }
        anyhow::bail!("Regression gate failed")
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_tune(
    cache_dir: &Path,
    selection: &SelectionArgs,
    skill: &Path,
    config: TuneConfig,
    schedule: EvalSchedule,
    output: Option<&Path>,
    report_path: Option<&Path>,
    model: &ModelArgs,
) -> Result<()> {
    let cases: Arc<[EvalCase]> = load_selection(selection)?.into();
    let store = FileSkillStore::open(skill)
        .with_context(|| format!("Skill not found at {}", skill.display()))?;
    let caller = model_caller(model)?;
    let runner = EvalRunner::new(
        Arc::clone(&caller),
        Grader::new(Arc::clone(&caller)),
        open_cache(cache_dir)?,
        RunConfig {
            samples_per_eval: config.samples,
            parallelism: config.parallel,
            ..RunConfig::default()
        },
    );

    let driver = OptimizationDriver::new(
        RunnerEvaluator::new(runner.clone(), Arc::clone(&cases)),
        ModelProposer::new(Arc::clone(&caller)),
        OptimizerConfig {
            schedule,
            seed: selection.seed.unwrap_or_default(),
        },
    );
    let trial_callbacks = TrialCallbacks::default()
        .on_trial_start(|trial, total| eprintln!("  trial {trial}/{total}"))
        .on_new_best(|t| eprintln!("  new best: {:.0}% (trial {})", t.score, t.trial_num));
    let improver = DriverImprover::new(driver).with_callbacks(trial_callbacks);
    let orchestrator = TuneOrchestrator::new(improver, RunnerProbe::new(runner, cases), config);

    let callbacks = TuneCallbacks::default()
        .on_round_start(|round, total| eprintln!("Round {round}/{total}: optimizing skill"))
        .on_round_complete(|round, report| {
            eprintln!(
                "Round {}: {:.0}% (best {:.0}%)",
                round.round_num, round.pass_rate, report.best_pass_rate
            )
        });

    let eval_set = eval_set_name(&selection.evals);
    let report = match orchestrator.run(&store, &eval_set, &callbacks).await {
        Ok(report) => report,
        Err(e) => {
            if !e.partial.rounds.is_empty() {
                let path = default_artifact_path(&eval_set, chrono::Utc::now());
                skillet_core::write_tune_report(&path, &e.partial)?;
                warn!(path = %path.display(), "saved partial tune report");
            }
            return Err(e).context("Tune failed");
        }
    };

    let artifact = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_artifact_path(&eval_set, chrono::Utc::now()));
    skillet_core::write_tune_artifact(&artifact, &report)?;
    if let Some(path) = report_path {
        skillet_core::write_tune_report(path, &report)?;
    }

    println!("{}", render_tune_summary_md(&report));
    println!("Skill written to {}", store.path().display());
    println!("Tune artifact: {}", artifact.display());
    if report.success {
        println!("\n✓ Target pass rate reached");
    } else {
        println!("\n✗ Target pass rate not reached; kept the best skill");
    }
    Ok(())
}
