//! Concurrent evaluation of eval cases against a target.
//!
//! Every (eval, sample) pair becomes a [`SampleTask`] on a [`TaskBoard`]. A
//! semaphore bounds how many tasks talk to the model at once; each task checks
//! the [`SampleCache`] first and otherwise runs the agent and grades the reply.
//! A sample that keeps failing is recorded as a failed grade and never aborts
//! the run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CacheOutcome, Fingerprint, SampleCache};
use crate::domain::{EvalCase, GradeResult, SampleTask, Target, TargetId, TaskState};
use crate::grader::{grading_mode, Grader};
use crate::metrics::METRICS;
use crate::model::{CallOptions, ModelCaller, ModelError};
use crate::obs;
use crate::stats::EvalMetrics;

const EVENT_CAPACITY: usize = 1024;

/// Retry behaviour for transient model failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff * retry
    }
}

/// Configuration for one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub samples_per_eval: usize,
    /// Maximum number of samples in flight.
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Run-level deadline. Unfinished samples count as failed.
    pub timeout: Option<Duration>,
    /// Recompute every sample instead of reading the cache.
    pub bypass_cache: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            samples_per_eval: 3,
            parallelism: 3,
            retry: RetryPolicy::default(),
            timeout: None,
            bypass_cache: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no task at index {0}")]
    UnknownTask(usize),

    #[error("illegal transition for task {index}: {from} -> {to}")]
    Illegal {
        index: usize,
        from: &'static str,
        to: &'static str,
    },
}

/// A state change published by the board.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub index: usize,
    pub task: SampleTask,
    pub state: TaskState,
}

/// Consistent copy of every task and its state.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub eval_ids: Arc<[String]>,
    pub eval_labels: Arc<[String]>,
    pub samples_per_eval: usize,
    pub tasks: Arc<[SampleTask]>,
    pub states: Vec<TaskState>,
}

impl TaskSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&SampleTask, &TaskState)> {
        self.tasks.iter().zip(self.states.iter())
    }

    pub fn eval_count(&self) -> usize {
        self.eval_ids.len()
    }

    /// States grouped by eval index, in sample order.
    pub fn by_eval(&self) -> Vec<Vec<&TaskState>> {
        let mut grouped = vec![Vec::with_capacity(self.samples_per_eval); self.eval_count()];
        for (task, state) in self.iter() {
            grouped[task.eval_idx].push(state);
        }
        grouped
    }

    pub fn is_settled(&self) -> bool {
        self.states.iter().all(TaskState::is_terminal)
    }
}

/// Owner of every task state in a run.
///
/// All transitions go through [`TaskBoard::advance`], which only allows
/// `Pending → Running → {Cached | Done}`.
pub struct TaskBoard {
    cases: Arc<[EvalCase]>,
    target: Target,
    eval_ids: Arc<[String]>,
    eval_labels: Arc<[String]>,
    samples_per_eval: usize,
    tasks: Arc<[SampleTask]>,
    states: Mutex<Vec<TaskState>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskBoard {
    pub fn new(cases: Arc<[EvalCase]>, samples_per_eval: usize, target: Target) -> Self {
        let target_id = target.id();
        let tasks: Arc<[SampleTask]> = (0..cases.len())
            .flat_map(|eval_idx| {
                (0..samples_per_eval).map(move |sample_idx| SampleTask {
                    eval_idx,
                    sample_idx,
                    target_id,
                })
            })
            .collect();
        let eval_ids = cases.iter().map(|c| c.id.clone()).collect();
        let eval_labels = cases.iter().map(|c| c.label().to_string()).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            states: Mutex::new(vec![TaskState::Pending; tasks.len()]),
            cases,
            target,
            eval_ids,
            eval_labels,
            samples_per_eval,
            tasks,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_id(&self) -> TargetId {
        self.target.id()
    }

    pub fn cases(&self) -> &Arc<[EvalCase]> {
        &self.cases
    }

    pub fn task(&self, index: usize) -> Option<SampleTask> {
        self.tasks.get(index).copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Move task `index` one step forward and publish the change.
    pub fn advance(&self, index: usize, next: TaskState) -> Result<(), TransitionError> {
        let task = self.task(index).ok_or(TransitionError::UnknownTask(index))?;
        {
            let mut states = self.states.lock().expect("task board lock poisoned");
            let current = &mut states[index];
            if !current.can_advance_to(&next) {
                return Err(TransitionError::Illegal {
                    index,
                    from: current.name(),
                    to: next.name(),
                });
            }
            *current = next.clone();
        }
        // No subscribers is fine.
        let _ = self.events.send(TaskEvent {
            index,
            task,
            state: next,
        });
        Ok(())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let states = self.states.lock().expect("task board lock poisoned").clone();
        TaskSnapshot {
            eval_ids: Arc::clone(&self.eval_ids),
            eval_labels: Arc::clone(&self.eval_labels),
            samples_per_eval: self.samples_per_eval,
            tasks: Arc::clone(&self.tasks),
            states,
        }
    }
}

/// A failed or unfinished sample, as context for proposing a better skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub eval_id: String,
    pub prompt: String,
    pub expected: String,
    pub response_preview: String,
    pub reasoning: String,
}

/// Outcome of an evaluation run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub target_id: TargetId,
    pub metrics: EvalMetrics,
    pub snapshot: TaskSnapshot,
    pub timed_out: bool,
    pub failures: Vec<FailureNote>,
    pub duration: Duration,
}

impl RunResult {
    /// Overall pass rate as a percentage.
    pub fn pass_rate(&self) -> f64 {
        self.metrics.pass_rate
    }
}

fn failure_notes(cases: &[EvalCase], snapshot: &TaskSnapshot) -> Vec<FailureNote> {
    snapshot
        .iter()
        .filter(|(_, state)| !state.passed())
        .map(|(task, state)| {
            let case = &cases[task.eval_idx];
            let (response_preview, reasoning) = match state.grade() {
                Some(g) => (g.response_preview.clone(), g.reasoning.clone()),
                None => (
                    String::new(),
                    "sample did not finish before the run timeout".to_string(),
                ),
            };
            FailureNote {
                eval_id: case.id.clone(),
                prompt: case.prompt.render(),
                expected: case.expected.clone(),
                response_preview,
                reasoning,
            }
        })
        .collect()
}

struct SampleContext {
    board: Arc<TaskBoard>,
    agent: Arc<dyn ModelCaller>,
    grader: Grader,
    cache: Arc<SampleCache>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    bypass_cache: bool,
}

impl SampleContext {
    async fn attempt(&self, case: &EvalCase) -> Result<GradeResult, ModelError> {
        let options = CallOptions::with_system_prompt(self.board.target().system_prompt())
            .with_tools(&case.tools);
        let reply = self.agent.call(&case.prompt, &options).await?;
        self.grader.grade(case, &reply).await
    }

    async fn attempt_with_retries(
        &self,
        case: &EvalCase,
        sample_idx: usize,
    ) -> Result<GradeResult, ModelError> {
        let mut retries = 0;
        loop {
            match self.attempt(case).await {
                Ok(grade) => return Ok(grade),
                Err(e) if e.is_transient() && retries < self.retry.max_retries => {
                    retries += 1;
                    METRICS.inc_model_retries();
                    obs::emit_sample_retry(&case.id, sample_idx, retries, &e);
                    tokio::time::sleep(self.retry.delay(retries)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_sample(self: Arc<Self>, index: usize) {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };
        let Some(task) = self.board.task(index) else {
            return;
        };
        if let Err(e) = self.board.advance(index, TaskState::Running) {
            warn!(error = %e, "task board rejected transition");
            return;
        }

        let case = &self.board.cases()[task.eval_idx];
        let fp = Fingerprint::for_sample(case, task.sample_idx, &task.target_id, grading_mode(case));

        let outcome = self
            .cache
            .get_or_compute(&fp, self.bypass_cache, || {
                self.attempt_with_retries(case, task.sample_idx)
            })
            .await;

        let next = match outcome {
            Ok(CacheOutcome::Hit(grade)) => {
                METRICS.inc_cache_hits();
                TaskState::Cached(grade)
            }
            Ok(CacheOutcome::Computed(grade)) => TaskState::Done(grade),
            Err(e) => {
                obs::emit_sample_failed(&case.id, task.sample_idx, &e);
                TaskState::Done(GradeResult::failed(format!("sample failed: {e}")))
            }
        };
        debug!(eval = %case.id, sample = task.sample_idx, state = next.name(), "sample settled");
        METRICS.inc_samples_graded();

        if let Err(e) = self.board.advance(index, next) {
            warn!(error = %e, "task board rejected transition");
        }
    }
}

/// Runs eval cases against a target with bounded concurrency.
#[derive(Clone)]
pub struct EvalRunner {
    agent: Arc<dyn ModelCaller>,
    grader: Grader,
    cache: Arc<SampleCache>,
    config: RunConfig,
}

impl EvalRunner {
    pub fn new(
        agent: Arc<dyn ModelCaller>,
        grader: Grader,
        cache: Arc<SampleCache>,
        config: RunConfig,
    ) -> Self {
        Self {
            agent,
            grader,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    /// Build the task board for a run without starting it, so a progress
    /// reporter can observe it from the first task.
    pub fn prepare(&self, cases: &[EvalCase], target: &Target) -> Arc<TaskBoard> {
        Arc::new(TaskBoard::new(
            cases.to_vec().into(),
            self.config.samples_per_eval,
            target.clone(),
        ))
    }

    /// Evaluate `cases` against `target`.
    pub async fn run(&self, cases: &[EvalCase], target: &Target) -> RunResult {
        let board = self.prepare(cases, target);
        self.execute(board).await
    }

    /// Execute every task on a prepared board and aggregate the results.
    pub async fn execute(&self, board: Arc<TaskBoard>) -> RunResult {
        let run_id = Uuid::new_v4();
        let target_label = board.target_id().to_string();
        let span = obs::run_span(&run_id.to_string(), &target_label);
        self.execute_inner(board, run_id, target_label)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        board: Arc<TaskBoard>,
        run_id: Uuid,
        target_label: String,
    ) -> RunResult {
        let started = Instant::now();
        let run_id_str = run_id.to_string();
        obs::emit_run_started(
            &run_id_str,
            &target_label,
            board.cases().len(),
            self.config.samples_per_eval,
        );

        let ctx = Arc::new(SampleContext {
            board: Arc::clone(&board),
            agent: Arc::clone(&self.agent),
            grader: self.grader.clone(),
            cache: Arc::clone(&self.cache),
            semaphore: Arc::new(Semaphore::new(self.config.parallelism.max(1))),
            retry: self.config.retry,
            bypass_cache: self.config.bypass_cache,
        });

        let mut set = JoinSet::new();
        for index in 0..board.len() {
            set.spawn(Arc::clone(&ctx).run_sample(index).in_current_span());
        }

        let deadline = self.config.timeout.map(|t| started + t);
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        warn!(run_id = %run_id_str, "run timed out; aborting outstanding samples");
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        break;
                    }
                },
                None => set.join_next().await,
            };
            match next {
                None => break,
                Some(Err(e)) if e.is_panic() => warn!(error = %e, "sample task panicked"),
                Some(_) => {}
            }
        }

        let snapshot = board.snapshot();
        let metrics = EvalMetrics::from_snapshot(&snapshot);
        let failures = failure_notes(board.cases(), &snapshot);
        let duration = started.elapsed();
        obs::emit_run_finished(
            &run_id_str,
            duration.as_millis() as u64,
            metrics.pass_rate,
            timed_out,
        );

        RunResult {
            run_id,
            target_id: board.target_id(),
            metrics,
            snapshot,
            timed_out,
            failures,
            duration,
        }
    }
}
