//! Domain models for skillet.
//!
//! Canonical definitions for the core entities:
//! - `EvalCase`: a test scenario with optional deterministic assertions
//! - `GradeResult`: the verdict for one sample
//! - `SampleTask` / `TaskState`: one unit of runner work and its lifecycle
//! - `Target`: baseline agent or agent steered by a skill text

pub mod error;
pub mod eval;
pub mod grade;
pub mod task;

pub use error::{Result, SkilletError, ValidationError};
pub use eval::{Assertion, AssertionKind, EvalCase, Prompt};
pub use grade::{preview, GradeResult, GradingMode, ToolCall};
pub use task::{SampleTask, Target, TargetId, TaskState};
