//! End-to-end evaluation runs against scripted models.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skillet_core::model::AgentReply;
use skillet_core::{
    Assertion, AssertionKind, EvalCase, EvalRunner, FsSampleStore, Grader, ModelError,
    RetryPolicy, RunConfig, SampleCache, ScriptedModelCaller, Target, TaskState, ToolCall,
    JUDGE_PARSE_FAILURE,
};

fn contains(value: &str) -> Assertion {
    Assertion::new(AssertionKind::Contains, value)
}

fn arithmetic(id: &str, expect: &str) -> EvalCase {
    EvalCase::new(id, "What is 2+2?", "Says 4").with_assertion(contains(expect))
}

fn runner_with(agent: Arc<ScriptedModelCaller>, cache: Arc<SampleCache>, config: RunConfig) -> EvalRunner {
    EvalRunner::new(agent.clone(), Grader::new(agent), cache, config)
}

fn config(samples: usize) -> RunConfig {
    RunConfig {
        samples_per_eval: samples,
        parallelism: 2,
        retry: RetryPolicy::no_retries(),
        ..RunConfig::default()
    }
}

#[tokio::test]
async fn contains_assertion_decides_each_eval() {
    let agent = Arc::new(
        ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("The answer is 4"))),
    );
    let runner = runner_with(agent, Arc::new(SampleCache::new()), config(1));

    let cases = vec![arithmetic("four.yaml", "4"), arithmetic("forty-two.yaml", "42")];
    let result = runner.run(&cases, &Target::Baseline).await;

    assert_eq!(result.metrics.per_eval[0].pass_rate, 100.0);
    assert_eq!(result.metrics.per_eval[1].pass_rate, 0.0);
    assert_eq!(result.pass_rate(), 50.0);
    assert_eq!(result.failures.len(), 1);
    assert!(result.failures[0].reasoning.contains("contains"));
    assert!(!result.timed_out);
}

#[tokio::test]
async fn one_pass_one_fail_gives_pass_at_k_but_not_pass_pow_k() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(move |_, _| {
        let reply = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            "4"
        } else {
            "no idea"
        };
        Ok(AgentReply::text(reply))
    }));
    let runner = runner_with(agent, Arc::new(SampleCache::new()), config(2));

    let result = runner.run(&[arithmetic("add.yaml", "4")], &Target::Baseline).await;
    let eval = &result.metrics.per_eval[0];
    assert_eq!(eval.k, 2);
    assert_eq!(eval.pass_rate, 50.0);
    assert_eq!(eval.pass_at_k, Some(1.0));
    assert_eq!(eval.pass_pow_k, Some(0.0));
}

#[tokio::test]
async fn unparseable_judge_reply_fails_the_sample() {
    let agent = Arc::new(
        ScriptedModelCaller::new()
            .with_responder(|_, _| Ok(AgentReply::text("hello")))
            .with_structured_responder(|_| Ok("I think it passed".to_string())),
    );
    let runner = runner_with(agent, Arc::new(SampleCache::new()), config(1));

    let case = EvalCase::new("greet.yaml", "Say hi", "A greeting");
    let result = runner.run(&[case], &Target::Baseline).await;
    let grade = result.snapshot.states[0].grade().unwrap();
    assert!(!grade.passed);
    assert_eq!(grade.reasoning, JUDGE_PARSE_FAILURE);
}

#[tokio::test]
async fn eval_tools_are_offered_to_the_agent() {
    // The agent only reaches for a tool it was offered.
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, options| {
        let reply = AgentReply::text("Opened it.");
        Ok(match options.tools.iter().find(|t| *t == "Read") {
            Some(tool) => reply.with_tool_call(ToolCall::new(tool.clone(), serde_json::json!({}))),
            None => reply,
        })
    }));
    let runner = runner_with(agent, Arc::new(SampleCache::new()), config(1));

    let called = Assertion::new(AssertionKind::ToolCalled, "Read");
    let offered = EvalCase::new("offered.yaml", "Open a.rs", "Reads it")
        .with_tool("Read")
        .with_assertion(called.clone());
    let withheld = EvalCase::new("withheld.yaml", "Open a.rs", "Reads it").with_assertion(called);

    let result = runner.run(&[offered, withheld], &Target::Baseline).await;
    assert_eq!(result.metrics.per_eval[0].pass_rate, 100.0);
    assert_eq!(result.metrics.per_eval[1].pass_rate, 0.0);
}

#[tokio::test]
async fn concurrent_runs_share_one_model_call_per_sample() {
    let agent = Arc::new(
        ScriptedModelCaller::new()
            .with_latency(Duration::from_millis(20))
            .with_responder(|_, _| Ok(AgentReply::text("4"))),
    );
    let cache = Arc::new(SampleCache::new());
    let runner = runner_with(Arc::clone(&agent), Arc::clone(&cache), config(1));
    let cases = vec![arithmetic("add.yaml", "4")];

    let (a, b) = tokio::join!(
        runner.run(&cases, &Target::Baseline),
        runner.run(&cases, &Target::Baseline)
    );
    assert_eq!(agent.calls(), 1);
    assert_eq!(a.snapshot.states[0].grade(), b.snapshot.states[0].grade());
    assert_eq!(a.metrics.cached_count + b.metrics.cached_count, 1);

    let again = runner.run(&cases, &Target::Baseline).await;
    assert_eq!(agent.calls(), 1);
    assert!(matches!(again.snapshot.states[0], TaskState::Cached(_)));
}

#[tokio::test]
async fn skill_and_baseline_are_cached_separately() {
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("4"))));
    let runner = runner_with(Arc::clone(&agent), Arc::new(SampleCache::new()), config(1));
    let cases = vec![arithmetic("add.yaml", "4")];

    runner.run(&cases, &Target::Baseline).await;
    runner.run(&cases, &Target::skill("Answer with digits.")).await;
    assert_eq!(agent.calls(), 2);
    assert_eq!(
        agent.system_prompts(),
        vec![None, Some("Answer with digits.".to_string())]
    );
}

#[tokio::test]
async fn bypass_recomputes_every_sample() {
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("4"))));
    let cache = Arc::new(SampleCache::new());
    let cases = vec![arithmetic("add.yaml", "4")];

    runner_with(Arc::clone(&agent), Arc::clone(&cache), config(1))
        .run(&cases, &Target::Baseline)
        .await;
    let bypass = RunConfig {
        bypass_cache: true,
        ..config(1)
    };
    let result = runner_with(Arc::clone(&agent), cache, bypass)
        .run(&cases, &Target::Baseline)
        .await;
    assert_eq!(agent.calls(), 2);
    assert_eq!(result.metrics.cached_count, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let agent = Arc::new(ScriptedModelCaller::new());
    agent.push_reply(Err(ModelError::Overloaded { status: 529 }));
    agent.push_reply(Err(ModelError::EmptyResult));
    agent.push_reply(Ok(AgentReply::text("4")));

    let config = RunConfig {
        samples_per_eval: 1,
        parallelism: 1,
        retry: RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_secs(1),
        },
        ..RunConfig::default()
    };
    let result = runner_with(Arc::clone(&agent), Arc::new(SampleCache::new()), config)
        .run(&[arithmetic("add.yaml", "4")], &Target::Baseline)
        .await;
    assert_eq!(agent.calls(), 3);
    assert_eq!(result.pass_rate(), 100.0);
}

fn judged(id: &str) -> EvalCase {
    EvalCase::new(id, "Say hi", "A greeting")
}

fn one_retry() -> RunConfig {
    RunConfig {
        samples_per_eval: 1,
        parallelism: 1,
        retry: RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_secs(1),
        },
        ..RunConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn overloaded_judge_is_retried() {
    let agent = Arc::new(
        ScriptedModelCaller::new()
            .with_responder(|_, _| Ok(AgentReply::text("hello")))
            .with_structured_responder(|_| Ok(r#"{"pass": true, "reasoning": "greets"}"#.to_string())),
    );
    agent.push_structured(Err(ModelError::Overloaded { status: 529 }));

    let result = runner_with(Arc::clone(&agent), Arc::new(SampleCache::new()), one_retry())
        .run(&[judged("greet.yaml")], &Target::Baseline)
        .await;
    assert_eq!(agent.structured_calls(), 2);
    assert_eq!(agent.calls(), 2);
    assert_eq!(result.pass_rate(), 100.0);
}

#[tokio::test(start_paused = true)]
async fn judge_that_keeps_failing_is_recorded_and_not_cached() {
    let agent = Arc::new(
        ScriptedModelCaller::new()
            .with_responder(|_, _| Ok(AgentReply::text("hello")))
            .with_structured_responder(|_| Err(ModelError::Transport("connection reset".to_string()))),
    );
    let runner = runner_with(Arc::clone(&agent), Arc::new(SampleCache::new()), one_retry());
    let cases = vec![judged("greet.yaml")];

    let first = runner.run(&cases, &Target::Baseline).await;
    assert_eq!(agent.structured_calls(), 2);
    match &first.snapshot.states[0] {
        TaskState::Done(grade) => {
            assert!(!grade.passed);
            assert!(grade.reasoning.starts_with("sample failed:"));
            assert!(grade.reasoning.contains("connection reset"));
        }
        other => panic!("expected a finished sample, got {other:?}"),
    }

    runner.run(&cases, &Target::Baseline).await;
    assert_eq!(agent.structured_calls(), 4);
}

#[tokio::test]
async fn fatal_failures_are_recorded_and_not_cached() {
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("4"))));
    agent.push_reply(Err(ModelError::Api {
        status: 400,
        message: "bad request".to_string(),
    }));
    let config = RunConfig {
        retry: RetryPolicy::default(),
        ..config(1)
    };
    let runner = runner_with(Arc::clone(&agent), Arc::new(SampleCache::new()), config);
    let cases = vec![arithmetic("add.yaml", "4")];

    let first = runner.run(&cases, &Target::Baseline).await;
    assert_eq!(agent.calls(), 1);
    assert_eq!(first.pass_rate(), 0.0);
    let grade = first.snapshot.states[0].grade().unwrap();
    assert!(grade.reasoning.starts_with("sample failed:"));

    let second = runner.run(&cases, &Target::Baseline).await;
    assert_eq!(agent.calls(), 2);
    assert_eq!(second.pass_rate(), 100.0);
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_unfinished_samples_as_failed() {
    let agent = Arc::new(
        ScriptedModelCaller::new()
            .with_latency(Duration::from_secs(60))
            .with_responder(|_, _| Ok(AgentReply::text("4"))),
    );
    let config = RunConfig {
        timeout: Some(Duration::from_secs(1)),
        ..config(2)
    };
    let result = runner_with(agent, Arc::new(SampleCache::new()), config)
        .run(&[arithmetic("add.yaml", "4")], &Target::Baseline)
        .await;

    assert!(result.timed_out);
    assert_eq!(result.pass_rate(), 0.0);
    assert_eq!(result.metrics.unresolved_count, 2);
    assert!(result
        .failures
        .iter()
        .all(|f| f.reasoning == "sample did not finish before the run timeout"));
}

#[tokio::test]
async fn persisted_results_survive_a_new_cache() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("4"))));
    let cases = vec![arithmetic("add.yaml", "4")];

    for _ in 0..2 {
        let store = Arc::new(FsSampleStore::new(dir.path()).unwrap());
        let cache = Arc::new(SampleCache::with_store(store));
        let result = runner_with(Arc::clone(&agent), cache, config(1))
            .run(&cases, &Target::Baseline)
            .await;
        assert_eq!(result.pass_rate(), 100.0);
    }
    assert_eq!(agent.calls(), 1);
}
