//! Skillet Core Library
//!
//! Evaluates how reliably a skill (a system-prompt text) steers an agent
//! toward expected behavior, and tunes the skill toward a target pass rate.

pub mod assertions;
pub mod cache;
pub mod compare;
pub mod domain;
pub mod gate;
pub mod grader;
pub mod loader;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod optimize;
pub mod progress;
pub mod reporting;
pub mod runner;
pub mod stats;
pub mod telemetry;
pub mod tune;

pub use domain::{
    Assertion, AssertionKind, EvalCase, GradeResult, GradingMode, Prompt, Result, SampleTask,
    SkilletError, Target, TargetId, TaskState, ToolCall, ValidationError,
};

pub use assertions::{run_assertions, AssertionOutcome};
pub use cache::fs::FsSampleStore;
pub use cache::{CacheError, CacheOutcome, Fingerprint, SampleCache, SampleStore};
pub use compare::{compare, ComparisonReport, EvalComparison};
pub use gate::{evaluate_gate, GateInput, GateRule, GateVerdict, Violation};
pub use grader::{Grader, JUDGE_PARSE_FAILURE};
pub use loader::{load_evals, parse_eval, resolve_skill_file, sample_cases};
pub use model::{
    AgentReply, AnthropicConfig, AnthropicModelCaller, CallOptions, ModelCaller, ModelError,
    ScriptedModelCaller,
};
pub use optimize::{
    EvalSchedule, InstructionProposer, ModelProposer, OptimizationDriver, OptimizationOutcome,
    OptimizerConfig, RunnerEvaluator, TrialCallbacks, TrialEvaluator, TrialResult,
};
pub use progress::{ProgressOptions, ProgressReporter};
pub use reporting::{write_tune_artifact, write_tune_report, TuneArtifact};
pub use runner::{EvalRunner, FailureNote, RetryPolicy, RunConfig, RunResult, TaskBoard};
pub use stats::{pass_at_k, pass_pow_k, EvalCaseMetrics, EvalMetrics};
pub use tune::{
    DriverImprover, FileSkillStore, PassRateProbe, RunnerProbe, SkillImprover, SkillStore,
    TuneCallbacks, TuneConfig, TuneError, TuneOrchestrator, TuneReport, TuneRound,
};

/// Skillet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
