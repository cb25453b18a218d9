//! Trial evaluation through the eval runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{TrialEvaluator, TrialScore, CONTEXT_EXAMPLES};
use crate::domain::{EvalCase, Result, Target};
use crate::runner::EvalRunner;

/// Scores an instruction by running it as the skill on a subset of eval cases.
pub struct RunnerEvaluator {
    runner: EvalRunner,
    cases: Arc<[EvalCase]>,
}

impl RunnerEvaluator {
    pub fn new(runner: EvalRunner, cases: Arc<[EvalCase]>) -> Self {
        Self { runner, cases }
    }
}

#[async_trait]
impl TrialEvaluator for RunnerEvaluator {
    fn validation_size(&self) -> usize {
        self.cases.len()
    }

    fn examples(&self) -> Vec<EvalCase> {
        self.cases.iter().take(CONTEXT_EXAMPLES).cloned().collect()
    }

    async fn evaluate(&self, instruction: &str, batch: &[usize]) -> Result<TrialScore> {
        let subset: Vec<EvalCase> = batch
            .iter()
            .filter_map(|&i| self.cases.get(i).cloned())
            .collect();
        let result = self.runner.run(&subset, &Target::skill(instruction)).await;
        if result.timed_out {
            warn!(batch = batch.len(), "trial evaluation timed out; unfinished samples count as failed");
        }
        Ok(TrialScore {
            score: result.pass_rate(),
            failures: result.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SampleCache;
    use crate::domain::{Assertion, AssertionKind};
    use crate::grader::Grader;
    use crate::model::{AgentReply, ScriptedModelCaller};
    use crate::runner::{RetryPolicy, RunConfig};

    #[tokio::test]
    async fn scores_the_batch_with_the_instruction_as_skill() {
        let agent = Arc::new(ScriptedModelCaller::new().with_responder(|_, opts| {
            let skill = opts.system_prompt.clone().unwrap_or_default();
            Ok(AgentReply::text(format!("following: {skill}")))
        }));
        let cases: Arc<[EvalCase]> = vec![
            EvalCase::new("a.yaml", "q", "x")
                .with_assertion(Assertion::new(AssertionKind::Contains, "be brief")),
            EvalCase::new("b.yaml", "q", "x")
                .with_assertion(Assertion::new(AssertionKind::Contains, "never")),
        ]
        .into();
        let runner = EvalRunner::new(
            agent.clone(),
            Grader::new(agent.clone()),
            Arc::new(SampleCache::new()),
            RunConfig {
                samples_per_eval: 1,
                parallelism: 2,
                retry: RetryPolicy::no_retries(),
                ..RunConfig::default()
            },
        );
        let evaluator = RunnerEvaluator::new(runner, cases);

        let full = evaluator.evaluate("be brief", &[0, 1]).await.unwrap();
        assert_eq!(full.score, 50.0);
        assert_eq!(full.failures.len(), 1);
        assert_eq!(full.failures[0].eval_id, "b.yaml");

        let one = evaluator.evaluate("be brief", &[0]).await.unwrap();
        assert_eq!(one.score, 100.0);
        assert_eq!(evaluator.examples().len(), 2);
    }
}
