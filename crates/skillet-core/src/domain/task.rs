//! Sample tasks, evaluation targets, and the task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::Fingerprint;
use crate::domain::grade::GradeResult;

/// What the agent runs with: no skill at all, or a skill text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Target {
    Baseline,
    Skill(String),
}

impl Target {
    pub fn skill(text: impl Into<String>) -> Self {
        Target::Skill(text.into())
    }

    pub fn id(&self) -> TargetId {
        match self {
            Target::Baseline => TargetId::Baseline,
            Target::Skill(text) => TargetId::Skill(Fingerprint::compute(text.as_bytes())),
        }
    }

    /// System prompt handed to the agent, if any.
    pub fn system_prompt(&self) -> Option<&str> {
        match self {
            Target::Baseline => None,
            Target::Skill(text) => Some(text),
        }
    }
}

/// Content identity of a [`Target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetId {
    Baseline,
    Skill(Fingerprint),
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Baseline => f.write_str("baseline"),
            TargetId::Skill(fp) => write!(f, "skill:{}", fp.short()),
        }
    }
}

/// One (eval, sample, target) unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleTask {
    pub eval_idx: usize,
    pub sample_idx: usize,
    pub target_id: TargetId,
}

/// Lifecycle of a [`SampleTask`]: `Pending → Running → {Cached | Done}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Cached(GradeResult),
    Done(GradeResult),
}

impl TaskState {
    fn rank(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Cached(_) | TaskState::Done(_) => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` is a legal single step.
    pub fn can_advance_to(&self, next: &TaskState) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn grade(&self) -> Option<&GradeResult> {
        match self {
            TaskState::Cached(g) | TaskState::Done(g) => Some(g),
            _ => None,
        }
    }

    /// True only for a terminal state whose grade passed.
    pub fn passed(&self) -> bool {
        self.grade().is_some_and(|g| g.passed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Cached(_) => "cached",
            TaskState::Done(_) => "done",
        }
    }
}
