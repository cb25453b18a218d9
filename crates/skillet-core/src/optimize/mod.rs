//! Trial-based search over instruction variants.
//!
//! Each trial proposes an instruction, evaluates it on a batch of validation
//! items, scores it, and promotes it to best only when it was scored on the
//! full validation set and beats the current best. Trial 1 evaluates the
//! starting instruction and always seeds the best.

pub mod evaluator;
pub mod proposer;
pub mod schedule;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::domain::{EvalCase, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::runner::FailureNote;

pub use evaluator::RunnerEvaluator;
pub use proposer::ModelProposer;
pub use schedule::EvalSchedule;

/// How many failures, attempts and examples a proposer sees.
pub const CONTEXT_FAILURES: usize = 3;
pub const CONTEXT_ATTEMPTS: usize = 3;
pub const CONTEXT_EXAMPLES: usize = 3;

/// Score and failures of one evaluated instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialScore {
    /// Pass rate in `[0, 100]`.
    pub score: f64,
    pub failures: Vec<FailureNote>,
}

/// A previously evaluated instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub instruction: String,
    pub score: f64,
}

/// What a proposer is shown when asked for a new instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalContext {
    /// The best instruction so far, which the proposal should improve.
    pub current: String,
    pub failures: Vec<FailureNote>,
    pub history: Vec<AttemptRecord>,
    pub examples: Vec<EvalCase>,
    /// Number of proposals made before this one.
    pub proposal_index: usize,
}

impl ProposalContext {
    /// Keep the first failures, the most recent attempts and the first examples.
    pub fn new(
        current: &str,
        failures: &[FailureNote],
        history: &[AttemptRecord],
        examples: &[EvalCase],
        proposal_index: usize,
    ) -> Self {
        let recent = history.len().saturating_sub(CONTEXT_ATTEMPTS);
        Self {
            current: current.to_string(),
            failures: failures.iter().take(CONTEXT_FAILURES).cloned().collect(),
            history: history[recent..].to_vec(),
            examples: examples.iter().take(CONTEXT_EXAMPLES).cloned().collect(),
            proposal_index,
        }
    }
}

/// Scores an instruction on a subset of the validation set.
#[async_trait]
pub trait TrialEvaluator: Send + Sync {
    /// Number of validation items.
    fn validation_size(&self) -> usize;

    /// Examples shown to the proposer.
    fn examples(&self) -> Vec<EvalCase> {
        Vec::new()
    }

    /// Evaluate `instruction` on the validation items at `batch`.
    async fn evaluate(&self, instruction: &str, batch: &[usize]) -> Result<TrialScore>;
}

/// Produces a new candidate instruction from search history.
#[async_trait]
pub trait InstructionProposer: Send + Sync {
    async fn propose(&self, context: &ProposalContext) -> Result<String>;
}

/// One entry in the trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_num: usize,
    pub score: f64,
    pub is_best: bool,
    pub instruction_text: String,
    pub is_full_eval: bool,
}

type TrialStartHook = Box<dyn Fn(usize, usize) + Send + Sync>;
type TrialResultHook = Box<dyn Fn(&TrialResult) + Send + Sync>;

/// Optional lifecycle hooks, called synchronously in this order per trial:
/// `on_trial_start`, `on_trial_complete`, then `on_new_best` if promoted.
#[derive(Default)]
pub struct TrialCallbacks {
    pub on_trial_start: Option<TrialStartHook>,
    pub on_trial_complete: Option<TrialResultHook>,
    pub on_new_best: Option<TrialResultHook>,
}

impl TrialCallbacks {
    pub fn on_trial_start(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.on_trial_start = Some(Box::new(f));
        self
    }

    pub fn on_trial_complete(mut self, f: impl Fn(&TrialResult) + Send + Sync + 'static) -> Self {
        self.on_trial_complete = Some(Box::new(f));
        self
    }

    pub fn on_new_best(mut self, f: impl Fn(&TrialResult) + Send + Sync + 'static) -> Self {
        self.on_new_best = Some(Box::new(f));
        self
    }

    fn trial_start(&self, trial: usize, total: usize) {
        if let Some(f) = &self.on_trial_start {
            f(trial, total);
        }
    }

    fn trial_complete(&self, result: &TrialResult) {
        if let Some(f) = &self.on_trial_complete {
            f(result);
        }
        if result.is_best {
            if let Some(f) = &self.on_new_best {
                f(result);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub schedule: EvalSchedule,
    /// Seed for minibatch sampling.
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            schedule: EvalSchedule::default(),
            seed: 0,
        }
    }
}

/// Result of an optimization call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best_program: String,
    pub best_score: f64,
    pub trials: Vec<TrialResult>,
}

/// Trial loop over an evaluator and a proposer.
pub struct OptimizationDriver<E, P> {
    evaluator: E,
    proposer: P,
    config: OptimizerConfig,
}

impl<E, P> OptimizationDriver<E, P>
where
    E: TrialEvaluator,
    P: InstructionProposer,
{
    pub fn new(evaluator: E, proposer: P, config: OptimizerConfig) -> Self {
        Self {
            evaluator,
            proposer,
            config,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Run the configured number of trials starting from `initial`.
    ///
    /// Any evaluator or proposer error ends the call.
    #[instrument(skip_all, fields(trials = self.config.schedule.total_trials))]
    pub async fn run(&self, initial: &str, callbacks: &TrialCallbacks) -> Result<OptimizationOutcome> {
        let schedule = self.config.schedule;
        let total = schedule.total_trials.max(1);
        let validation_len = self.evaluator.validation_size();
        let examples = self.evaluator.examples();
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut trials: Vec<TrialResult> = Vec::with_capacity(total);
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut proposals = 0usize;

        // Trial 1: the starting instruction on the full set.
        callbacks.trial_start(1, total);
        let full_batch: Vec<usize> = (0..validation_len).collect();
        let first = self.evaluator.evaluate(initial, &full_batch).await?;
        let mut best_program = initial.to_string();
        let mut best_score = first.score;
        let mut last_failures = first.failures;
        history.push(AttemptRecord {
            instruction: initial.to_string(),
            score: first.score,
        });
        self.record(
            &mut trials,
            callbacks,
            TrialResult {
                trial_num: 1,
                score: first.score,
                is_best: true,
                instruction_text: initial.to_string(),
                is_full_eval: true,
            },
        );

        // Best minibatch candidate since the last full evaluation.
        let mut pending: Option<AttemptRecord> = None;

        for trial in 2..=total {
            callbacks.trial_start(trial, total);
            let is_full = schedule.is_full(trial, validation_len);

            let carried = if is_full { pending.take() } else { None };
            let instruction = match carried {
                Some(candidate) => candidate.instruction,
                None => {
                    let context = ProposalContext::new(
                        &best_program,
                        &last_failures,
                        &history,
                        &examples,
                        proposals,
                    );
                    proposals += 1;
                    self.proposer.propose(&context).await?
                }
            };

            let batch = schedule.batch(trial, validation_len, &mut rng);
            debug!(trial, batch = batch.len(), full = is_full, "evaluating candidate");
            let scored = self.evaluator.evaluate(&instruction, &batch).await?;

            let is_best = is_full && scored.score > best_score;
            if is_best {
                best_score = scored.score;
                best_program = instruction.clone();
                info!(trial, score = best_score, "new best instruction");
            }
            if !is_full && pending.as_ref().map_or(true, |p| scored.score > p.score) {
                pending = Some(AttemptRecord {
                    instruction: instruction.clone(),
                    score: scored.score,
                });
            }

            last_failures = scored.failures;
            history.push(AttemptRecord {
                instruction: instruction.clone(),
                score: scored.score,
            });
            self.record(
                &mut trials,
                callbacks,
                TrialResult {
                    trial_num: trial,
                    score: scored.score,
                    is_best,
                    instruction_text: instruction,
                    is_full_eval: is_full,
                },
            );
        }

        Ok(OptimizationOutcome {
            best_program,
            best_score,
            trials,
        })
    }

    fn record(&self, trials: &mut Vec<TrialResult>, callbacks: &TrialCallbacks, result: TrialResult) {
        METRICS.inc_trials();
        obs::emit_trial_completed(result.trial_num, result.score, result.is_full_eval, result.is_best);
        callbacks.trial_complete(&result);
        trials.push(result);
    }
}
