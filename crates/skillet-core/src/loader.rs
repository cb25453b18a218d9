//! Eval case source and skill path resolution.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::{Assertion, EvalCase, Prompt, Result, SkilletError, ValidationError};

/// File name looked up when a skill path is a directory.
pub const SKILL_FILE: &str = "SKILL.md";

const REQUIRED_FIELDS: [&str; 2] = ["prompt", "expected"];

/// Environment scripts for local agents. Model calls here have no local side
/// effects, so these fields are accepted and skipped.
const IGNORED_SCRIPT_FIELDS: [&str; 2] = ["setup", "teardown"];

#[derive(Debug, Deserialize)]
struct EvalFile {
    prompt: Prompt,
    expected: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    assertions: Vec<Assertion>,
    #[serde(default, alias = "allowed_tools")]
    tools: Vec<String>,
}

fn is_eval_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse one eval file body. `source_id` names it in errors.
pub fn parse_eval(source_id: &str, content: &str) -> Result<EvalCase> {
    let malformed = |reason: String| ValidationError::Malformed {
        source_id: source_id.to_string(),
        reason,
    };

    let value: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| malformed(e.to_string()))?;
    let mapping = value
        .as_mapping()
        .ok_or_else(|| malformed("not a YAML mapping".to_string()))?;

    for field in IGNORED_SCRIPT_FIELDS {
        if mapping.contains_key(field) {
            warn!(eval = %source_id, field, "eval scripts are not run; ignoring field");
        }
    }

    for field in REQUIRED_FIELDS {
        if !mapping.contains_key(field) {
            return Err(ValidationError::MissingField {
                source_id: source_id.to_string(),
                field: field.to_string(),
            }
            .into());
        }
    }

    let file: EvalFile = serde_yaml::from_value(value).map_err(|e| malformed(e.to_string()))?;
    Ok(EvalCase {
        id: source_id.to_string(),
        name: file.name,
        prompt: file.prompt,
        expected: file.expected,
        assertions: file.assertions,
        tools: file.tools,
    })
}

/// Load eval cases from a single YAML file or a directory searched recursively.
///
/// Cases are ordered by path. Each case id is its path relative to the
/// directory (or the file name for a single file).
pub fn load_evals(path: &Path) -> Result<Vec<EvalCase>> {
    if path.is_file() {
        if !is_eval_file(path) {
            return Err(ValidationError::Malformed {
                source_id: path.display().to_string(),
                reason: "expected a .yaml or .yml file".to_string(),
            }
            .into());
        }
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content = fs::read_to_string(path)?;
        return Ok(vec![parse_eval(&id, &content)?]);
    }

    if !path.is_dir() {
        return Err(SkilletError::NoEvals(format!(
            "{} does not exist",
            path.display()
        )));
    }

    let mut cases = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| SkilletError::Io(e.into()))?;
        if !entry.file_type().is_file() || !is_eval_file(entry.path()) {
            continue;
        }
        let id = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(entry.path())?;
        debug!(eval = %id, "loaded eval");
        cases.push(parse_eval(&id, &content)?);
    }

    if cases.is_empty() {
        return Err(SkilletError::NoEvals(format!(
            "no eval files in {}",
            path.display()
        )));
    }
    info!(count = cases.len(), dir = %path.display(), "loaded evals");
    Ok(cases)
}

/// Keep at most `max` cases, chosen at random. The kept cases stay in their
/// original order. A fixed `seed` makes the choice reproducible.
pub fn sample_cases(cases: Vec<EvalCase>, max: Option<usize>, seed: Option<u64>) -> Vec<EvalCase> {
    let Some(max) = max.filter(|&m| m < cases.len()) else {
        return cases;
    };
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let indices: Vec<usize> = (0..cases.len()).collect();
    let mut chosen: Vec<usize> = indices.choose_multiple(&mut rng, max).copied().collect();
    chosen.sort_unstable();

    let mut keep = vec![false; cases.len()];
    for i in chosen {
        keep[i] = true;
    }
    cases
        .into_iter()
        .zip(keep)
        .filter_map(|(case, k)| k.then_some(case))
        .collect()
}

/// Resolve a skill path: a file is used as is, a directory must contain `SKILL.md`.
pub fn resolve_skill_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        let file = path.join(SKILL_FILE);
        if file.is_file() {
            return Ok(file);
        }
        return Err(SkilletError::SkillNotFound(file));
    }
    Err(SkilletError::SkillNotFound(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssertionKind;

    const ADD: &str = "name: addition\nprompt: What is 2+2?\nexpected: Says 4\n";

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn parses_assertions_and_turns() {
        let body = "prompt:\n  - open the file\n  - now save it\nexpected: saves\nassertions:\n  - type: tool_called\n    value: Write\n";
        let case = parse_eval("multi.yaml", body).unwrap();
        assert_eq!(case.prompt.turns(), vec!["open the file", "now save it"]);
        assert_eq!(case.assertions[0].kind, AssertionKind::ToolCalled);
        assert_eq!(case.id, "multi.yaml");
    }

    #[test]
    fn allowed_tools_are_loaded_and_scripts_skipped() {
        let body = "prompt: save it
expected: saves
allowed_tools: [Read, Write]
setup: touch a.txt
";
        let case = parse_eval("tools.yaml", body).unwrap();
        assert_eq!(case.tools, vec!["Read".to_string(), "Write".to_string()]);
    }

    #[test]
    fn missing_expected_is_reported() {
        let err = parse_eval("bad.yaml", "prompt: hi\n").unwrap_err();
        match err {
            SkilletError::Validation(ValidationError::MissingField { field, .. }) => {
                assert_eq!(field, "expected")
            }
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn unknown_assertion_type_is_malformed() {
        let body = "prompt: hi\nexpected: x\nassertions:\n  - type: vibes\n    value: good\n";
        assert!(matches!(
            parse_eval("a.yaml", body),
            Err(SkilletError::Validation(ValidationError::Malformed { .. }))
        ));
    }

    #[test]
    fn list_is_not_an_eval() {
        assert!(parse_eval("a.yaml", "- 1\n- 2\n").is_err());
    }

    #[test]
    fn loads_directory_recursively_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.yaml", ADD);
        write(dir.path(), "a/nested.yml", ADD);
        write(dir.path(), "notes.txt", "ignored");

        let cases = load_evals(dir.path()).unwrap();
        let ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a/nested.yml", "b.yaml"]);
    }

    #[test]
    fn loads_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "one.yaml", ADD);
        let cases = load_evals(&dir.path().join("one.yaml")).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].label(), "addition");
    }

    #[test]
    fn empty_or_missing_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_evals(dir.path()), Err(SkilletError::NoEvals(_))));
        assert!(matches!(
            load_evals(&dir.path().join("nope")),
            Err(SkilletError::NoEvals(_))
        ));
    }

    #[test]
    fn sampling_is_seeded_and_order_preserving() {
        let cases: Vec<EvalCase> = (0..10)
            .map(|i| EvalCase::new(format!("{i:02}.yaml"), "q", "a"))
            .collect();
        let a = sample_cases(cases.clone(), Some(4), Some(7));
        let b = sample_cases(cases.clone(), Some(4), Some(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert!(a.windows(2).all(|w| w[0].id < w[1].id));

        assert_eq!(sample_cases(cases.clone(), Some(50), None).len(), 10);
        assert_eq!(sample_cases(cases, None, None).len(), 10);
    }

    #[test]
    fn skill_directory_needs_skill_md() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_skill_file(dir.path()),
            Err(SkilletError::SkillNotFound(_))
        ));
        write(dir.path(), SKILL_FILE, "# Skill\n");
        assert_eq!(
            resolve_skill_file(dir.path()).unwrap(),
            dir.path().join(SKILL_FILE)
        );
    }
}
