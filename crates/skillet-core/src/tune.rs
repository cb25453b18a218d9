//! Round-based skill tuning.
//!
//! Each round asks a [`SkillImprover`] for a better skill text, seeded from
//! the best text so far, then measures it with a [`PassRateProbe`] on the
//! full eval set. The loop stops once a round reaches the target pass rate or
//! the round budget runs out. Only then is the best text written back to its
//! [`SkillStore`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::domain::{EvalCase, Result, SkilletError, Target};
use crate::loader::resolve_skill_file;
use crate::obs;
use crate::optimize::{
    InstructionProposer, OptimizationDriver, TrialCallbacks, TrialEvaluator,
};
use crate::runner::EvalRunner;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    pub max_rounds: usize,
    /// Percentage in `[0, 100]`.
    pub target_pass_rate: f64,
    pub samples: usize,
    pub parallel: usize,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            target_pass_rate: 100.0,
            samples: 1,
            parallel: 3,
        }
    }
}

/// Produces an improved skill text for one round.
#[async_trait]
pub trait SkillImprover: Send + Sync {
    async fn improve(&self, seed_text: &str, round: usize) -> Result<String>;
}

/// Measures the pass rate of a skill text on the full eval set.
#[async_trait]
pub trait PassRateProbe: Send + Sync {
    async fn measure(&self, skill_text: &str) -> Result<f64>;
}

/// Where the skill text comes from and where the tuned text goes.
pub trait SkillStore: Send + Sync {
    fn read(&self) -> Result<String>;
    fn write(&self, text: &str) -> Result<()>;
    /// Human-readable location, recorded in the report.
    fn location(&self) -> String;
}

/// [`SkillImprover`] backed by an optimization driver.
pub struct DriverImprover<E, P> {
    driver: OptimizationDriver<E, P>,
    callbacks: TrialCallbacks,
}

impl<E, P> DriverImprover<E, P>
where
    E: TrialEvaluator,
    P: InstructionProposer,
{
    pub fn new(driver: OptimizationDriver<E, P>) -> Self {
        Self {
            driver,
            callbacks: TrialCallbacks::default(),
        }
    }

    /// Trial hooks forwarded to every driver run.
    pub fn with_callbacks(mut self, callbacks: TrialCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[async_trait]
impl<E, P> SkillImprover for DriverImprover<E, P>
where
    E: TrialEvaluator,
    P: InstructionProposer,
{
    async fn improve(&self, seed_text: &str, round: usize) -> Result<String> {
        let outcome = self.driver.run(seed_text, &self.callbacks).await?;
        info!(
            round,
            trials = outcome.trials.len(),
            best_score = outcome.best_score,
            "optimizer finished"
        );
        Ok(outcome.best_program)
    }
}

/// [`PassRateProbe`] that runs every eval case through the runner.
pub struct RunnerProbe {
    runner: EvalRunner,
    cases: Arc<[EvalCase]>,
}

impl RunnerProbe {
    pub fn new(runner: EvalRunner, cases: Arc<[EvalCase]>) -> Self {
        Self { runner, cases }
    }
}

#[async_trait]
impl PassRateProbe for RunnerProbe {
    async fn measure(&self, skill_text: &str) -> Result<f64> {
        let result = self.runner.run(&self.cases, &Target::skill(skill_text)).await;
        Ok(result.pass_rate())
    }
}

/// Skill file on disk. A directory path resolves to its `SKILL.md`.
#[derive(Debug, Clone)]
pub struct FileSkillStore {
    path: PathBuf,
}

impl FileSkillStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: resolve_skill_file(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SkillStore for FileSkillStore {
    fn read(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Replace the file atomically: write a sibling temp file, then rename it
    /// over the skill. A failed write leaves the old text in place.
    fn write(&self, text: &str) -> Result<()> {
        // Follow a symlinked SKILL.md so the link itself survives.
        let target = fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let dir = target.parent().unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        if let Ok(meta) = fs::metadata(&target) {
            tmp.as_file().set_permissions(meta.permissions())?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRound {
    pub round_num: usize,
    pub pass_rate: f64,
    pub skill_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneMetadata {
    pub skillet_version: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub eval_set: String,
    pub original_skill_path: String,
}

/// Round history and best result of a tune run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneReport {
    pub metadata: TuneMetadata,
    pub config: TuneConfig,
    pub success: bool,
    pub original_skill: String,
    pub best_skill_text: String,
    pub best_pass_rate: f64,
    /// 0 until a round completes.
    pub best_round: usize,
    pub rounds: Vec<TuneRound>,
}

impl TuneReport {
    pub fn new(original_skill: &str, config: TuneConfig, eval_set: &str, skill_path: &str) -> Self {
        Self {
            metadata: TuneMetadata {
                skillet_version: crate::VERSION.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                eval_set: eval_set.to_string(),
                original_skill_path: skill_path.to_string(),
            },
            config,
            success: false,
            original_skill: original_skill.to_string(),
            best_skill_text: original_skill.to_string(),
            best_pass_rate: 0.0,
            best_round: 0,
            rounds: Vec::new(),
        }
    }

    /// Append a round. The best only moves on a strictly higher rate, so ties
    /// keep the earlier round.
    pub fn add_round(&mut self, round: TuneRound) -> bool {
        let improved = self.best_round == 0 || round.pass_rate > self.best_pass_rate;
        if improved {
            self.best_pass_rate = round.pass_rate;
            self.best_round = round.round_num;
            self.best_skill_text = round.skill_text.clone();
        }
        self.rounds.push(round);
        improved
    }

    pub fn rounds_completed(&self) -> usize {
        self.rounds.len()
    }

    /// Pass rate of the last completed round.
    pub fn final_pass_rate(&self) -> Option<f64> {
        self.rounds.last().map(|r| r.pass_rate)
    }

    fn finalize(&mut self, success: bool) {
        self.success = success;
        self.metadata.completed_at = Some(Utc::now());
    }
}

/// A tune run that stopped early. `partial` keeps every completed round.
#[derive(Debug, thiserror::Error)]
#[error("tune failed in round {round}: {source}")]
pub struct TuneError {
    pub round: usize,
    #[source]
    pub source: SkilletError,
    pub partial: Box<TuneReport>,
}

type RoundStartHook = Box<dyn Fn(usize, usize) + Send + Sync>;
type RoundCompleteHook = Box<dyn Fn(&TuneRound, &TuneReport) + Send + Sync>;

#[derive(Default)]
pub struct TuneCallbacks {
    pub on_round_start: Option<RoundStartHook>,
    pub on_round_complete: Option<RoundCompleteHook>,
}

impl TuneCallbacks {
    pub fn on_round_start(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_round_start = Some(Box::new(f));
        self
    }

    pub fn on_round_complete(
        mut self,
        f: impl Fn(&TuneRound, &TuneReport) + Send + Sync + 'static,
    ) -> Self {
        self.on_round_complete = Some(Box::new(f));
        self
    }
}

pub struct TuneOrchestrator<I, Q> {
    improver: I,
    probe: Q,
    config: TuneConfig,
}

impl<I, Q> TuneOrchestrator<I, Q>
where
    I: SkillImprover,
    Q: PassRateProbe,
{
    pub fn new(improver: I, probe: Q, config: TuneConfig) -> Self {
        Self {
            improver,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    /// Tune the skill held by `store` against `eval_set`.
    pub async fn run(
        &self,
        store: &dyn SkillStore,
        eval_set: &str,
        callbacks: &TuneCallbacks,
    ) -> std::result::Result<TuneReport, TuneError> {
        let original = match store.read() {
            Ok(text) => text,
            Err(source) => {
                return Err(TuneError {
                    round: 0,
                    source,
                    partial: Box::new(TuneReport::new(
                        "",
                        self.config,
                        eval_set,
                        &store.location(),
                    )),
                })
            }
        };
        let mut report = TuneReport::new(&original, self.config, eval_set, &store.location());
        let total = self.config.max_rounds;
        let mut reached = false;

        for round_num in 1..=total {
            if let Some(f) = &callbacks.on_round_start {
                f(round_num, total);
            }
            let round = match self.play_round(&report.best_skill_text, round_num).await {
                Ok(round) => round,
                Err(source) => {
                    warn!(round = round_num, error = %source, "tune round failed");
                    report.metadata.completed_at = Some(Utc::now());
                    return Err(TuneError {
                        round: round_num,
                        source,
                        partial: Box::new(report),
                    });
                }
            };

            report.add_round(round.clone());
            obs::emit_round_completed(round_num, round.pass_rate, report.best_pass_rate);
            if let Some(f) = &callbacks.on_round_complete {
                f(&round, &report);
            }

            if round.pass_rate >= self.config.target_pass_rate {
                reached = true;
                break;
            }
        }

        report.finalize(reached);
        if let Err(source) = store.write(&report.best_skill_text) {
            return Err(TuneError {
                round: report.rounds_completed(),
                source,
                partial: Box::new(report),
            });
        }
        info!(
            success = reached,
            rounds = report.rounds_completed(),
            best_round = report.best_round,
            best_pass_rate = report.best_pass_rate,
            "tune finished"
        );
        Ok(report)
    }

    async fn play_round(&self, seed_text: &str, round_num: usize) -> Result<TuneRound> {
        let skill_text = self.improver.improve(seed_text, round_num).await?;
        let pass_rate = self.probe.measure(&skill_text).await?;
        Ok(TuneRound {
            round_num,
            pass_rate,
            skill_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RoundImprover;

    #[async_trait]
    impl SkillImprover for RoundImprover {
        async fn improve(&self, _seed_text: &str, round: usize) -> Result<String> {
            Ok(format!("skill v{round}"))
        }
    }

    struct FixedProbe(Vec<f64>);

    #[async_trait]
    impl PassRateProbe for FixedProbe {
        async fn measure(&self, skill_text: &str) -> Result<f64> {
            let round: usize = skill_text.trim_start_matches("skill v").parse().unwrap();
            Ok(self.0[round - 1])
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        text: Mutex<String>,
        writes: Mutex<usize>,
    }

    impl SkillStore for MemoryStore {
        fn read(&self) -> Result<String> {
            Ok(self.text.lock().unwrap().clone())
        }

        fn write(&self, text: &str) -> Result<()> {
            *self.text.lock().unwrap() = text.to_string();
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn config(max_rounds: usize, target: f64) -> TuneConfig {
        TuneConfig {
            max_rounds,
            target_pass_rate: target,
            ..TuneConfig::default()
        }
    }

    #[test]
    fn ties_keep_the_earliest_round() {
        let mut report = TuneReport::new("orig", TuneConfig::default(), "evals", "memory");
        assert_eq!(report.best_skill_text, "orig");
        for (n, rate) in [(1, 40.0), (2, 40.0), (3, 30.0)] {
            report.add_round(TuneRound {
                round_num: n,
                pass_rate: rate,
                skill_text: format!("v{n}"),
            });
        }
        assert_eq!(report.best_round, 1);
        assert_eq!(report.best_skill_text, "v1");
        assert_eq!(report.final_pass_rate(), Some(30.0));
    }

    #[tokio::test]
    async fn exhausting_rounds_writes_the_best_text() {
        let store = MemoryStore::default();
        *store.text.lock().unwrap() = "orig".to_string();
        let orchestrator =
            TuneOrchestrator::new(RoundImprover, FixedProbe(vec![20.0, 50.0, 40.0]), config(3, 90.0));

        let report = orchestrator
            .run(&store, "evals", &TuneCallbacks::default())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.rounds_completed(), 3);
        assert_eq!(report.best_round, 2);
        assert_eq!(*store.text.lock().unwrap(), "skill v2");
        assert_eq!(*store.writes.lock().unwrap(), 1);
        assert!(report.metadata.completed_at.is_some());
    }

    struct FailingImprover;

    #[async_trait]
    impl SkillImprover for FailingImprover {
        async fn improve(&self, _seed_text: &str, round: usize) -> Result<String> {
            if round == 2 {
                return Err(SkilletError::Search("proposer gave up".to_string()));
            }
            Ok(format!("skill v{round}"))
        }
    }

    #[tokio::test]
    async fn failed_round_keeps_history_and_skips_write_back() {
        let store = MemoryStore::default();
        *store.text.lock().unwrap() = "orig".to_string();
        let orchestrator =
            TuneOrchestrator::new(FailingImprover, FixedProbe(vec![10.0, 20.0]), config(5, 100.0));

        let err = orchestrator
            .run(&store, "evals", &TuneCallbacks::default())
            .await
            .unwrap_err();
        assert_eq!(err.round, 2);
        assert!(matches!(err.source, SkilletError::Search(_)));
        assert_eq!(err.partial.rounds.len(), 1);
        assert_eq!(*store.text.lock().unwrap(), "orig");
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[test]
    fn file_store_resolves_skill_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SKILL.md"), "# Skill\n").unwrap();
        let store = FileSkillStore::open(dir.path()).unwrap();
        assert_eq!(store.read().unwrap(), "# Skill\n");
        store.write("# Better\n").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("SKILL.md")).unwrap(), "# Better\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn failed_file_write_keeps_the_old_skill() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("SKILL.md");
        fs::write(&skill, "# Skill\n").unwrap();
        let store = FileSkillStore::open(dir.path()).unwrap();

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).unwrap();
        // Permission bits do not bind a privileged user.
        let enforced = fs::write(dir.path().join("write-check"), "").is_err();
        let result = store.write("# Better\n");
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        if !enforced {
            return;
        }

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&skill).unwrap(), "# Skill\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
