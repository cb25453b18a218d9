//! Structured lifecycle events for runs, trials and tune rounds.
//!
//! Every event carries an `event = "<noun>.<verb>"` field so log pipelines can
//! filter without parsing messages.

use tracing::{info, warn, Span};

/// Span that scopes every log line of one evaluation run.
///
/// ```ignore
/// runner_future.instrument(run_span(&run_id, "skill:3f2a9c")).await;
/// ```
pub fn run_span(run_id: &str, target: &str) -> Span {
    tracing::info_span!("skillet.run", run_id = %run_id, target = %target)
}

pub fn emit_run_started(run_id: &str, target: &str, evals: usize, samples: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        target = %target,
        evals = evals,
        samples_per_eval = samples,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, pass_rate: f64, timed_out: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        pass_rate = pass_rate,
        timed_out = timed_out,
    );
}

/// A transient model failure is about to be retried.
pub fn emit_sample_retry(eval_id: &str, sample_idx: usize, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "sample.retry",
        eval = %eval_id,
        sample = sample_idx,
        attempt = attempt,
        error = %error,
    );
}

/// A sample exhausted its retries or hit a fatal error.
pub fn emit_sample_failed(eval_id: &str, sample_idx: usize, error: &dyn std::fmt::Display) {
    warn!(event = "sample.failed", eval = %eval_id, sample = sample_idx, error = %error);
}

pub fn emit_trial_completed(trial: usize, score: f64, full_eval: bool, is_best: bool) {
    info!(
        event = "trial.completed",
        trial = trial,
        score = score,
        full_eval = full_eval,
        is_best = is_best,
    );
}

pub fn emit_round_completed(round: usize, pass_rate: f64, best_pass_rate: f64) {
    info!(
        event = "tune.round_completed",
        round = round,
        pass_rate = pass_rate,
        best_pass_rate = best_pass_rate,
    );
}

pub fn emit_gate_evaluated(pass_rate: f64, passed: bool) {
    info!(event = "gate.evaluated", pass_rate = pass_rate, passed = passed);
}
