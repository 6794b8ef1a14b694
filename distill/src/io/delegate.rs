//! Delegation channel: worker calls made on behalf of executing code.

use std::future::Future;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::{Message, Usage};
use crate::io::model::ModelClient;
use crate::io::run_log::RunLogger;

/// Abstraction over the worker capability handed to the execution environment.
pub trait Delegate {
    /// Send one prompt and return the worker's reply.
    fn delegate(&mut self, prompt: &str) -> impl Future<Output = Result<String>>;

    /// Send every prompt concurrently. Replies are aligned with `prompts`.
    fn delegate_batch(&mut self, prompts: &[String]) -> impl Future<Output = Result<Vec<String>>>;

    /// Iteration index recorded with subsequent calls.
    fn set_step(&mut self, step: usize);

    /// Worker usage accumulated so far.
    fn usage(&self) -> Usage;
}

/// [`Delegate`] backed by a worker [`ModelClient`].
///
/// Each prompt is sent as a single user message. Usage is merged once per
/// call, after the call (or the whole batch) resolves.
pub struct WorkerChannel<'a, C> {
    client: &'a C,
    logger: Option<&'a RunLogger>,
    usage: Usage,
    step: usize,
}

impl<'a, C: ModelClient> WorkerChannel<'a, C> {
    pub fn new(client: &'a C, logger: Option<&'a RunLogger>) -> Self {
        Self {
            client,
            logger,
            usage: Usage::default(),
            step: 0,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

impl<C: ModelClient> Delegate for WorkerChannel<'_, C> {
    #[instrument(skip_all, fields(step = self.step, prompt_chars = prompt.len()))]
    async fn delegate(&mut self, prompt: &str) -> Result<String> {
        let messages = [Message::user(prompt)];
        let completion = self
            .client
            .chat(&messages)
            .await
            .with_context(|| format!("worker call at step {}", self.step))?;
        self.usage += completion.usage;
        if let Some(logger) = self.logger {
            logger.log_worker(self.step, prompt, &completion)?;
        }
        Ok(completion.text)
    }

    #[instrument(skip_all, fields(step = self.step, prompts = prompts.len()))]
    async fn delegate_batch(&mut self, prompts: &[String]) -> Result<Vec<String>> {
        let conversations: Vec<Vec<Message>> = prompts
            .iter()
            .map(|prompt| vec![Message::user(prompt.as_str())])
            .collect();
        let completions = self
            .client
            .chat_batch(&conversations)
            .await
            .with_context(|| format!("worker batch of {} at step {}", prompts.len(), self.step))?;
        let batch_usage: Usage = completions.iter().map(|c| c.usage).sum();
        self.usage += batch_usage;
        debug!(
            input_tokens = batch_usage.input_tokens,
            output_tokens = batch_usage.output_tokens,
            "worker batch finished"
        );
        if let Some(logger) = self.logger {
            for (prompt, completion) in prompts.iter().zip(&completions) {
                logger.log_worker(self.step, prompt, completion)?;
            }
        }
        Ok(completions.into_iter().map(|c| c.text).collect())
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    fn usage(&self) -> Usage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::run_log::WORKER_LOG;
    use crate::test_support::ScriptedModel;
    use std::time::Duration;

    #[tokio::test]
    async fn single_call_merges_usage_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logger = RunLogger::create(temp.path()).expect("logger");
        let model = ScriptedModel::echo("worker");
        let mut channel = WorkerChannel::new(&model, Some(&logger));
        channel.set_step(4);

        let reply = channel.delegate("hello there").await.expect("delegate");
        assert_eq!(reply, "echo: hello there");
        assert_eq!(channel.usage(), ScriptedModel::usage_for("hello there"));
        assert_eq!(channel.step(), 4);

        let log = std::fs::read_to_string(temp.path().join(WORKER_LOG)).expect("read");
        let entry: serde_json::Value =
            serde_json::from_str(log.lines().next().expect("line")).expect("json");
        assert_eq!(entry["step"], 4);
        assert_eq!(entry["prompt"], "hello there");
        assert_eq!(entry["response"], "echo: hello there");
    }

    /// Verifies replies stay aligned with prompts when calls finish out of order.
    #[tokio::test]
    async fn batch_preserves_positional_alignment() {
        let model = ScriptedModel::echo("worker").with_delays([
            ("a", Duration::from_millis(60)),
            ("b", Duration::from_millis(5)),
            ("c", Duration::from_millis(30)),
        ]);
        let mut channel = WorkerChannel::new(&model, None);
        let prompts = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let replies = channel.delegate_batch(&prompts).await.expect("batch");

        assert_eq!(replies, vec!["echo: a", "echo: b", "echo: c"]);
        assert_eq!(model.completion_order(), vec!["b", "c", "a"]);
        let expected: Usage = prompts.iter().map(|p| ScriptedModel::usage_for(p)).sum();
        assert_eq!(channel.usage(), expected);
    }

    #[tokio::test]
    async fn batch_logs_one_entry_per_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logger = RunLogger::create(temp.path()).expect("logger");
        let model = ScriptedModel::echo("worker");
        let mut channel = WorkerChannel::new(&model, Some(&logger));
        channel.set_step(2);
        let prompts = vec!["x".to_string(), "y".to_string()];

        channel.delegate_batch(&prompts).await.expect("batch");

        let log = std::fs::read_to_string(temp.path().join(WORKER_LOG)).expect("read");
        let entries: Vec<serde_json::Value> = log
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["prompt"], "x");
        assert_eq!(entries[1]["prompt"], "y");
        assert!(entries.iter().all(|e| e["step"] == 2));
    }

    #[tokio::test]
    async fn one_failing_prompt_fails_the_batch() {
        let model = ScriptedModel::echo("worker").failing_on("bad");
        let mut channel = WorkerChannel::new(&model, None);
        let prompts = vec!["ok".to_string(), "bad".to_string()];

        let err = channel.delegate_batch(&prompts).await.unwrap_err();
        assert!(format!("{err:#}").contains("scripted failure"));
        assert_eq!(channel.usage(), Usage::default());
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let model = ScriptedModel::echo("worker");
        let mut channel = WorkerChannel::new(&model, None);
        assert!(channel.delegate_batch(&[]).await.expect("batch").is_empty());
    }
}
