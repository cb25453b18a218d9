use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::tune::TuneReport;

/// One round in the persisted tune artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundArtifact {
    pub round_num: usize,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuneOutcomeArtifact {
    pub final_pass_rate: f64,
    pub best_skill: String,
}

/// Stable tune artifact: `{rounds: [{round_num, pass_rate}], result: {final_pass_rate, best_skill}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TuneArtifact {
    pub rounds: Vec<RoundArtifact>,
    pub result: TuneOutcomeArtifact,
}

impl TuneArtifact {
    /// `final_pass_rate` is the best measured rate, matching `best_skill`.
    pub fn from_report(report: &TuneReport) -> Self {
        Self {
            rounds: report
                .rounds
                .iter()
                .map(|r| RoundArtifact {
                    round_num: r.round_num,
                    pass_rate: r.pass_rate,
                })
                .collect(),
            result: TuneOutcomeArtifact {
                final_pass_rate: report.best_pass_rate,
                best_skill: report.best_skill_text.clone(),
            },
        }
    }
}

fn write_pretty<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(value).with_context(|| format!("serialize {what}"))?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write the stable tune artifact as pretty JSON.
pub fn write_tune_artifact(path: &Path, report: &TuneReport) -> Result<()> {
    write_pretty(path, &TuneArtifact::from_report(report), "tune artifact")
}

/// Write the full tune report, metadata and round texts included.
pub fn write_tune_report(path: &Path, report: &TuneReport) -> Result<()> {
    write_pretty(path, report, "tune report")
}

/// Markdown summary of a tune run for terminals and PR comments.
pub fn render_tune_summary_md(report: &TuneReport) -> String {
    let mut out = String::new();
    out.push_str("# Tune Summary\n\n");
    out.push_str(&format!(
        "- eval set: `{}`\n- success: {}\n- rounds: {}\n- best round: {}\n- best pass rate: {:.1}%\n\n",
        report.metadata.eval_set,
        report.success,
        report.rounds_completed(),
        report.best_round,
        report.best_pass_rate,
    ));
    if !report.rounds.is_empty() {
        out.push_str("| Round | Pass rate |\n|---|---|\n");
        for r in &report.rounds {
            let marker = if r.round_num == report.best_round { " (best)" } else { "" };
            out.push_str(&format!("| {} | {:.1}%{} |\n", r.round_num, r.pass_rate, marker));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tune::{TuneConfig, TuneRound};

    fn report() -> TuneReport {
        let mut report = TuneReport::new("orig", TuneConfig::default(), "evals/x", "SKILL.md");
        for (n, rate) in [(1, 30.0), (2, 85.0)] {
            report.add_round(TuneRound {
                round_num: n,
                pass_rate: rate,
                skill_text: format!("v{n}"),
            });
        }
        report
    }

    #[test]
    fn artifact_field_names_are_stable() {
        let value = serde_json::to_value(TuneArtifact::from_report(&report())).unwrap();
        assert_eq!(value["rounds"][1]["round_num"], 2);
        assert_eq!(value["rounds"][0]["pass_rate"], 30.0);
        assert_eq!(value["result"]["final_pass_rate"], 85.0);
        assert_eq!(value["result"]["best_skill"], "v2");
    }

    #[test]
    fn writes_into_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/tune.json");
        write_tune_artifact(&path, &report()).unwrap();
        let back: TuneArtifact =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.rounds.len(), 2);

        let full = dir.path().join("report.json");
        write_tune_report(&full, &report()).unwrap();
        let back: TuneReport = serde_json::from_str(&std::fs::read_to_string(full).unwrap()).unwrap();
        assert_eq!(back.original_skill, "orig");
    }

    #[test]
    fn summary_marks_best_round() {
        let md = render_tune_summary_md(&report());
        assert!(md.contains("| 2 | 85.0% (best) |"));
        assert!(md.contains("- rounds: 2"));
    }
}
