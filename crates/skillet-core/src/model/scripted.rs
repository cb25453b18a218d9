//! Scripted model caller for tests and dry runs.
//!
//! Replies come from queued results first, then from an optional responder
//! closure. Every call is counted and the system prompt it carried recorded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{AgentReply, CallOptions, ModelCaller, ModelError};
use crate::domain::Prompt;

type Responder = Box<dyn Fn(&Prompt, &CallOptions) -> Result<AgentReply, ModelError> + Send + Sync>;
type StructuredResponder = Box<dyn Fn(&str) -> Result<String, ModelError> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedModelCaller {
    replies: Mutex<VecDeque<Result<AgentReply, ModelError>>>,
    structured: Mutex<VecDeque<Result<String, ModelError>>>,
    responder: Option<Responder>,
    structured_responder: Option<StructuredResponder>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    structured_calls: AtomicUsize,
    system_prompts: Mutex<Vec<Option<String>>>,
}

impl ScriptedModelCaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful agent reply.
    pub fn with_reply(self, text: &str) -> Self {
        self.push_reply(Ok(AgentReply::text(text)));
        self
    }

    /// Queue an agent result, success or failure.
    pub fn push_reply(&self, reply: Result<AgentReply, ModelError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Queue a raw structured reply body.
    pub fn with_structured(self, body: &str) -> Self {
        self.push_structured(Ok(body.to_string()));
        self
    }

    pub fn push_structured(&self, body: Result<String, ModelError>) {
        self.structured.lock().unwrap().push_back(body);
    }

    /// Answer agent calls once the queue is empty.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&Prompt, &CallOptions) -> Result<AgentReply, ModelError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Answer structured calls once the queue is empty.
    pub fn with_structured_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        self.structured_responder = Some(Box::new(f));
        self
    }

    /// Sleep before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of agent calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of structured calls made so far.
    pub fn structured_calls(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
    }

    /// System prompts seen by agent calls, in call order.
    pub fn system_prompts(&self) -> Vec<Option<String>> {
        self.system_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelCaller for ScriptedModelCaller {
    async fn call(&self, prompt: &Prompt, options: &CallOptions) -> Result<AgentReply, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.system_prompts
            .lock()
            .unwrap()
            .push(options.system_prompt.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self.replies.lock().unwrap().pop_front();
        match (queued, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(prompt, options),
            (None, None) => Err(ModelError::EmptyResult),
        }
    }

    async fn call_structured(
        &self,
        prompt: &str,
        _schema: &serde_json::Value,
    ) -> Result<String, ModelError> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self.structured.lock().unwrap().pop_front();
        match (queued, &self.structured_responder) {
            (Some(body), _) => body,
            (None, Some(responder)) => responder(prompt),
            (None, None) => Err(ModelError::EmptyResult),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_then_responder() {
        let caller = ScriptedModelCaller::new()
            .with_reply("first")
            .with_responder(|_, _| Ok(AgentReply::text("fallback")));
        let prompt = Prompt::from("hi");
        let opts = CallOptions::default();

        assert_eq!(caller.call(&prompt, &opts).await.unwrap().text, "first");
        assert_eq!(caller.call(&prompt, &opts).await.unwrap().text, "fallback");
        assert_eq!(caller.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_reports_empty_result() {
        let caller = ScriptedModelCaller::new();
        let err = caller
            .call(&Prompt::from("hi"), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::EmptyResult));
    }

    #[tokio::test]
    async fn records_system_prompts() {
        let caller = ScriptedModelCaller::new().with_responder(|_, _| Ok(AgentReply::text("ok")));
        let prompt = Prompt::from("hi");
        caller
            .call(&prompt, &CallOptions::with_system_prompt(Some("skill")))
            .await
            .unwrap();
        caller.call(&prompt, &CallOptions::default()).await.unwrap();
        assert_eq!(
            caller.system_prompts(),
            vec![Some("skill".to_string()), None]
        );
    }
}
