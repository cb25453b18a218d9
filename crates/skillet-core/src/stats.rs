//! Pass-rate statistics derived from task state snapshots.
//!
//! Nothing here is counted incrementally: every figure is recomputed from a
//! [`TaskSnapshot`], so metrics cannot drift from task state.

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;
use crate::runner::TaskSnapshot;

/// Ratio `C(a, k) / C(n, k)` as a stable running product.
fn comb_ratio(a: usize, n: usize, k: usize) -> f64 {
    if k > a {
        return 0.0;
    }
    (0..k).fold(1.0, |acc, i| acc * (a - i) as f64 / (n - i) as f64)
}

/// Probability that at least one of `k` draws from `n` samples (with `c`
/// passing) passes. `None` when `n == 0` or `k > n`.
pub fn pass_at_k(n: usize, c: usize, k: usize) -> Option<f64> {
    if n == 0 || k > n {
        return None;
    }
    if c == 0 {
        return Some(0.0);
    }
    Some(1.0 - comb_ratio(n - c.min(n), n, k))
}

/// Probability that all `k` draws from `n` samples (with `c` passing) pass.
/// `None` when `n == 0` or `k > n`.
pub fn pass_pow_k(n: usize, c: usize, k: usize) -> Option<f64> {
    if n == 0 || k > n {
        return None;
    }
    if c < k {
        return Some(0.0);
    }
    Some(comb_ratio(c.min(n), n, k))
}

/// `part / whole` as a percentage; zero when `whole` is zero.
pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Per-eval figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCaseMetrics {
    pub eval_idx: usize,
    pub eval_id: String,
    /// Samples scheduled for this eval (`n`).
    pub total: usize,
    /// Samples that passed (`c`).
    pub passed: usize,
    pub cached: usize,
    /// Samples still pending or running; counted as failed.
    pub unresolved: usize,
    /// Percentage in `[0, 100]`.
    pub pass_rate: f64,
    pub k: usize,
    pub pass_at_k: Option<f64>,
    pub pass_pow_k: Option<f64>,
}

impl EvalCaseMetrics {
    pub fn is_complete(&self) -> bool {
        self.unresolved == 0
    }
}

/// Aggregate figures for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub per_eval: Vec<EvalCaseMetrics>,
    pub total_runs: usize,
    pub total_pass: usize,
    pub cached_count: usize,
    pub fresh_count: usize,
    pub unresolved_count: usize,
    /// Percentage in `[0, 100]`.
    pub pass_rate: f64,
}

impl EvalMetrics {
    /// Compute metrics from a snapshot with `k` set to the samples per eval.
    pub fn from_snapshot(snapshot: &TaskSnapshot) -> Self {
        let k = snapshot.samples_per_eval;
        let mut per_eval: Vec<EvalCaseMetrics> = snapshot
            .eval_ids
            .iter()
            .enumerate()
            .map(|(eval_idx, eval_id)| EvalCaseMetrics {
                eval_idx,
                eval_id: eval_id.clone(),
                total: 0,
                passed: 0,
                cached: 0,
                unresolved: 0,
                pass_rate: 0.0,
                k,
                pass_at_k: None,
                pass_pow_k: None,
            })
            .collect();

        for (task, state) in snapshot.iter() {
            let m = &mut per_eval[task.eval_idx];
            m.total += 1;
            match state {
                TaskState::Pending | TaskState::Running => m.unresolved += 1,
                TaskState::Cached(_) => m.cached += 1,
                TaskState::Done(_) => {}
            }
            if state.passed() {
                m.passed += 1;
            }
        }

        for m in &mut per_eval {
            m.pass_rate = percent(m.passed, m.total);
            m.pass_at_k = pass_at_k(m.total, m.passed, k);
            m.pass_pow_k = pass_pow_k(m.total, m.passed, k);
        }

        let total_runs: usize = per_eval.iter().map(|m| m.total).sum();
        let total_pass: usize = per_eval.iter().map(|m| m.passed).sum();
        let cached_count: usize = per_eval.iter().map(|m| m.cached).sum();
        let unresolved_count: usize = per_eval.iter().map(|m| m.unresolved).sum();

        Self {
            per_eval,
            total_runs,
            total_pass,
            cached_count,
            fresh_count: total_runs - cached_count - unresolved_count,
            unresolved_count,
            pass_rate: percent(total_pass, total_runs),
        }
    }
}
