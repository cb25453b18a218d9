//! Exit gate for eval and compare runs.
//!
//! A [`GateVerdict`] decides whether a run's aggregate pass rate is good
//! enough for the process to exit cleanly. All rates are percentages in
//! `[0, 100]`.

use serde::{Deserialize, Serialize};

use crate::obs;

/// Aggregate numbers the gate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateInput {
    pub pass_rate: f64,
    /// Baseline pass rate for regression checks.
    pub baseline_pass_rate: Option<f64>,
}

impl GateInput {
    pub fn new(pass_rate: f64) -> Self {
        Self {
            pass_rate,
            baseline_pass_rate: None,
        }
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline_pass_rate = Some(baseline);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// Pass rate must be at least `min`.
    MinPassRate { min: f64 },
    /// Baseline minus current must not exceed `max`. Ignored without a baseline.
    MaxRegression { max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: GateRule,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub violations: Vec<Violation>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check `input` against every rule. An empty rule list always passes.
pub fn evaluate_gate(rules: &[GateRule], input: &GateInput) -> GateVerdict {
    let violations: Vec<Violation> = rules
        .iter()
        .filter_map(|rule| check_rule(rule, input))
        .collect();
    let verdict = GateVerdict { violations };
    obs::emit_gate_evaluated(input.pass_rate, verdict.passed());
    verdict
}

fn check_rule(rule: &GateRule, input: &GateInput) -> Option<Violation> {
    match *rule {
        GateRule::MinPassRate { min } => (input.pass_rate < min).then(|| Violation {
            rule: *rule,
            reason: format!(
                "pass rate {:.1}% < required {:.1}%",
                input.pass_rate, min
            ),
        }),
        GateRule::MaxRegression { max } => {
            let baseline = input.baseline_pass_rate?;
            let regression = baseline - input.pass_rate;
            (regression > max).then(|| Violation {
                rule: *rule,
                reason: format!(
                    "regression {regression:.1}% > allowed {max:.1}% (baseline {baseline:.1}% -> current {:.1}%)",
                    input.pass_rate
                ),
            })
        }
    }
}
