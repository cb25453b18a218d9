//! Baseline versus skill comparison from cached results only.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{Fingerprint, SampleCache};
use crate::domain::{EvalCase, GradeResult, Target, TargetId};
use crate::grader::grading_mode;
use crate::stats::percent;

/// Cached pass rates for one eval. `None` means nothing is cached for that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalComparison {
    pub eval_id: String,
    pub baseline: Option<f64>,
    pub skill: Option<f64>,
}

impl EvalComparison {
    /// Skill minus baseline, when both sides have results.
    pub fn delta(&self) -> Option<f64> {
        Some(self.skill? - self.baseline?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideTotals {
    pub total: usize,
    pub passed: usize,
}

impl SideTotals {
    pub fn pass_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| percent(self.passed, self.total))
    }

    fn add(&mut self, grades: &[GradeResult]) {
        self.total += grades.len();
        self.passed += grades.iter().filter(|g| g.passed).count();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub results: Vec<EvalComparison>,
    pub baseline: SideTotals,
    pub skill: SideTotals,
    pub missing_baseline: Vec<String>,
    pub missing_skill: Vec<String>,
}

impl ComparisonReport {
    pub fn overall_baseline(&self) -> Option<f64> {
        self.baseline.pass_rate()
    }

    pub fn overall_skill(&self) -> Option<f64> {
        self.skill.pass_rate()
    }

    pub fn overall_delta(&self) -> Option<f64> {
        Some(self.overall_skill()? - self.overall_baseline()?)
    }
}

fn cached_grades(
    cache: &SampleCache,
    case: &EvalCase,
    target: &TargetId,
    samples: usize,
) -> Vec<GradeResult> {
    let mode = grading_mode(case);
    (0..samples)
        .filter_map(|i| cache.peek(&Fingerprint::for_sample(case, i, target, mode)))
        .collect()
}

/// Compare cached baseline and skill results for `cases`, looking at sample
/// indices `0..samples`. Never calls a model.
pub fn compare(
    cache: &SampleCache,
    cases: &[EvalCase],
    skill_text: &str,
    samples: usize,
) -> ComparisonReport {
    let skill_id = Target::skill(skill_text).id();
    let mut report = ComparisonReport {
        results: Vec::with_capacity(cases.len()),
        baseline: SideTotals::default(),
        skill: SideTotals::default(),
        missing_baseline: Vec::new(),
        missing_skill: Vec::new(),
    };

    for case in cases {
        let base = cached_grades(cache, case, &TargetId::Baseline, samples);
        let with_skill = cached_grades(cache, case, &skill_id, samples);

        let side_rate = |grades: &[GradeResult]| {
            (!grades.is_empty())
                .then(|| percent(grades.iter().filter(|g| g.passed).count(), grades.len()))
        };
        let baseline = side_rate(&base);
        let skill = side_rate(&with_skill);

        if baseline.is_none() {
            report.missing_baseline.push(case.id.clone());
        }
        if skill.is_none() {
            report.missing_skill.push(case.id.clone());
        }
        report.baseline.add(&base);
        report.skill.add(&with_skill);
        report.results.push(EvalComparison {
            eval_id: case.id.clone(),
            baseline,
            skill,
        });
    }

    info!(
        event = "compare.completed",
        evals = cases.len(),
        missing_baseline = report.missing_baseline.len(),
        missing_skill = report.missing_skill.len(),
        "comparison built from cache"
    );
    report
}

/// `+12%`, `-5%`, `0%`, or `-` when either side is missing.
pub fn format_delta(delta: Option<f64>) -> String {
    match delta {
        None => "-".to_string(),
        Some(d) if d.round() > 0.0 => format!("+{d:.0}%"),
        Some(d) if d.round() < 0.0 => format!("{d:.0}%"),
        Some(_) => "0%".to_string(),
    }
}
