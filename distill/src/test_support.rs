//! Scripted collaborators for controller, delegation and sandbox tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::core::output::{ExecOutcome, ExecStatus};
use crate::core::types::{Completion, Message, Usage};
use crate::io::delegate::Delegate;
use crate::io::model::ModelClient;
use crate::io::sandbox::ExecutionEnv;

/// Deterministic usage for one exchange: characters in, characters out.
pub fn usage_between(prompt: &str, reply: &str) -> Usage {
    Usage::new(prompt.chars().count() as u64, reply.chars().count() as u64)
}

/// Whether a usable `python3` is on `PATH`. Interpreter-backed tests skip otherwise.
pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// [`ModelClient`] that replays canned replies or echoes the last message.
pub struct ScriptedModel {
    model: String,
    echo: bool,
    replies: Mutex<VecDeque<String>>,
    delays: HashMap<String, Duration>,
    fail_on: Option<String>,
    calls: Mutex<Vec<Vec<Message>>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedModel {
    /// Reply with `echo: <last message>` to every call.
    pub fn echo(model: &str) -> Self {
        Self::build(model, true, VecDeque::new())
    }

    /// Reply with `replies` in order; calling past the end is an error.
    pub fn replies<I, S>(model: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(model, false, replies.into_iter().map(Into::into).collect())
    }

    fn build(model: &str, echo: bool, replies: VecDeque<String>) -> Self {
        Self {
            model: model.to_string(),
            echo,
            replies: Mutex::new(replies),
            delays: HashMap::new(),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering the given prompts.
    pub fn with_delays<I, S>(mut self, delays: I) -> Self
    where
        I: IntoIterator<Item = (S, Duration)>,
        S: Into<String>,
    {
        self.delays
            .extend(delays.into_iter().map(|(prompt, delay)| (prompt.into(), delay)));
        self
    }

    /// Fail any call whose last message is exactly `prompt`.
    pub fn failing_on(mut self, prompt: &str) -> Self {
        self.fail_on = Some(prompt.to_string());
        self
    }

    /// Usage an echo model reports for `prompt`.
    pub fn usage_for(prompt: &str) -> Usage {
        usage_between(prompt, &format!("echo: {prompt}"))
    }

    /// Every message history the model was called with, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Last-message text of each finished call, in completion order.
    pub fn completion_order(&self) -> Vec<String> {
        self.completed.lock().expect("completed lock").clone()
    }
}

impl ModelClient for ScriptedModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message]) -> Result<Completion> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if self.fail_on.as_deref() == Some(prompt.as_str()) {
            bail!("scripted failure for `{prompt}`");
        }
        if let Some(delay) = self.delays.get(&prompt) {
            tokio::time::sleep(*delay).await;
        }
        let text = if self.echo {
            format!("echo: {prompt}")
        } else {
            match self.replies.lock().expect("replies lock").pop_front() {
                Some(text) => text,
                None => bail!("scripted model `{}` ran out of replies", self.model),
            }
        };
        self.completed
            .lock()
            .expect("completed lock")
            .push(prompt.clone());
        Ok(Completion {
            usage: usage_between(&prompt, &text),
            text,
            model: self.model.clone(),
            elapsed: Duration::from_millis(1),
        })
    }
}

/// [`Delegate`] that records prompts and answers `echo: <prompt>`.
#[derive(Debug, Default)]
pub struct EchoDelegate {
    pub prompts: Vec<(usize, String)>,
    step: usize,
    usage: Usage,
}

impl EchoDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn answer(&mut self, prompt: &str) -> String {
        let reply = format!("echo: {prompt}");
        self.prompts.push((self.step, prompt.to_string()));
        self.usage += usage_between(prompt, &reply);
        reply
    }
}

impl Delegate for EchoDelegate {
    async fn delegate(&mut self, prompt: &str) -> Result<String> {
        Ok(self.answer(prompt))
    }

    async fn delegate_batch(&mut self, prompts: &[String]) -> Result<Vec<String>> {
        Ok(prompts.iter().map(|p| self.answer(p)).collect())
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    fn usage(&self) -> Usage {
        self.usage
    }
}

/// [`ExecutionEnv`] that interprets a tiny line language instead of Python.
///
/// Each line of a code unit is one of:
/// - `print(<text>)` appends `<text>\n` to stdout
/// - `warn(<text>)` appends `<text>\n` to stderr
/// - `raise <text>` faults with `<text>` as the error
/// - `FINAL(<payload>)` terminates; surrounding quotes are stripped
///
/// Anything else is ignored. Execution stops at the first `raise` or `FINAL`.
#[derive(Debug)]
pub struct ScriptedEnv {
    output_limit: usize,
    final_answer: Option<String>,
    /// `(step, code)` for every executed unit.
    pub executed: Vec<(usize, String)>,
}

impl ScriptedEnv {
    pub fn new(output_limit: usize) -> Self {
        Self {
            output_limit,
            final_answer: None,
            executed: Vec::new(),
        }
    }
}

impl ExecutionEnv for ScriptedEnv {
    async fn execute(&mut self, step: usize, code: &str) -> Result<ExecOutcome> {
        self.executed.push((step, code.to_string()));
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut status = ExecStatus::Normal;
        for line in code.lines().map(str::trim) {
            if let Some(text) = call_arg(line, "print") {
                stdout.push_str(text);
                stdout.push('\n');
            } else if let Some(text) = call_arg(line, "warn") {
                stderr.push_str(text);
                stderr.push('\n');
            } else if let Some(error) = line.strip_prefix("raise ") {
                stderr.push_str(&format!("Traceback (most recent call last):\n{error}\n"));
                status = ExecStatus::Faulted {
                    error: error.to_string(),
                };
                break;
            } else if let Some(payload) = call_arg(line, "FINAL") {
                let answer = payload.trim_matches(['"', '\'']).to_string();
                self.final_answer = Some(answer.clone());
                status = ExecStatus::Terminated { answer };
                break;
            }
        }
        Ok(ExecOutcome {
            stdout,
            stderr,
            elapsed: Duration::from_millis(1),
            variables: BTreeMap::new(),
            status,
        })
    }

    fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    fn output_limit(&self) -> usize {
        self.output_limit
    }
}

fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}
