//! Execution environment: a persistent Python namespace driven over JSON lines.
//!
//! The [`ExecutionEnv`] trait decouples the iteration controller from the
//! interpreter. [`PythonSandbox`] keeps one `python3` child per run; code units
//! run against the same namespace, and calls to `worker`, `worker_batch` and
//! the chunking helpers come back to the host as `call` messages.
//!
//! The builtin blocklist (`eval`, `exec`, `compile`, `input`) is hygiene only.
//! It is not an isolation boundary.

use std::collections::BTreeMap;
use std::future::Future;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

use crate::core::chunking::{
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_MIN_PARAGRAPH_LEN, chunk_by_paragraph,
    chunk_by_section, chunk_by_tokens,
};
use crate::core::features::FeatureFlags;
use crate::core::output::{ExecOutcome, ExecStatus, truncate_output};
use crate::io::delegate::Delegate;
use crate::logging::PYTHON_TARGET;

const RUNNER_SCRIPT: &str = include_str!("repl_runner.py");

/// Appended to every delegated prompt when structured worker output is on.
pub const STRUCTURED_OUTPUT_SUFFIX: &str = "\n\nRespond in this exact format:\n\
explanation: <1-2 sentence reasoning>\n\
citation: <direct quote from the text>\n\
answer: <concise answer>";

const WORKER_TOOLS: [&str; 2] = ["worker", "worker_batch"];
const CHUNKING_TOOLS: [&str; 3] = ["chunk_by_section", "chunk_by_paragraph", "chunk_by_tokens"];

/// Abstraction over code-unit execution backends.
pub trait ExecutionEnv {
    /// Run one code unit at iteration `step` against the persistent namespace.
    ///
    /// Faults in the code itself come back as [`ExecStatus::Faulted`]. `Err`
    /// means the environment itself failed and the run cannot continue.
    fn execute(&mut self, step: usize, code: &str) -> impl Future<Output = Result<ExecOutcome>>;

    /// Payload of the termination call, once made.
    fn final_answer(&self) -> Option<&str>;

    fn output_limit(&self) -> usize;

    /// Combined output as shown to the supervisor.
    fn truncate_output(&self, outcome: &ExecOutcome) -> String {
        truncate_output(outcome, self.output_limit())
    }
}

/// Construction parameters for [`PythonSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Interpreter command, split on whitespace (e.g. `python3` or `uv run python`).
    pub python_command: String,
    pub output_limit: usize,
    pub features: FeatureFlags,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Init {
        context: &'a str,
        query: &'a str,
        tools: Vec<&'static str>,
    },
    Exec {
        code: &'a str,
    },
    Reply {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RunnerStatus {
    Normal,
    Terminated,
    Faulted,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunnerMessage {
    Ready,
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Result {
        status: RunnerStatus,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
    Error {
        error: String,
    },
}

/// Outcome of a host call requested by running code. `Err` is reported back
/// to the code as an exception.
type CallReply = std::result::Result<Value, String>;

/// [`ExecutionEnv`] backed by a persistent `python3` child process.
pub struct PythonSandbox<D> {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    delegate: D,
    features: FeatureFlags,
    output_limit: usize,
    final_answer: Option<String>,
}

impl<D: Delegate> PythonSandbox<D> {
    /// Start the interpreter and seed its namespace.
    #[instrument(skip_all, fields(python = %options.python_command, context_chars = context.len()))]
    pub async fn spawn(
        options: &SandboxOptions,
        context: &str,
        query: &str,
        delegate: D,
    ) -> Result<Self> {
        let mut parts = options.python_command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("python_command must not be empty"))?;
        let mut command = Command::new(program);
        command
            .args(parts)
            .arg("-u")
            .arg("-c")
            .arg(RUNNER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawn python interpreter `{}`", options.python_command))?;
        let stdin = child.stdin.take().context("capture python stdin")?;
        let stdout = child.stdout.take().context("capture python stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let mut sandbox = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            delegate,
            features: options.features,
            output_limit: options.output_limit,
            final_answer: None,
        };

        let mut tools: Vec<&'static str> = WORKER_TOOLS.to_vec();
        if options.features.builtin_chunking {
            tools.extend(CHUNKING_TOOLS);
        }
        sandbox
            .send(&HostMessage::Init {
                context,
                query,
                tools,
            })
            .await?;
        match sandbox.recv().await? {
            RunnerMessage::Ready => {}
            RunnerMessage::Error { error } => bail!("python runner rejected init: {error}"),
            other => bail!("unexpected message from python runner during init: {other:?}"),
        }
        debug!("python sandbox ready");
        Ok(sandbox)
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Ask the interpreter to exit and hand back the delegate.
    pub async fn shutdown(mut self) -> Result<D> {
        if let Err(err) = self.send(&HostMessage::Shutdown).await {
            warn!(error = %err, "python runner gone before shutdown");
        }
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await {
            Ok(status) => {
                let status = status.context("wait for python runner")?;
                debug!(%status, "python runner exited");
            }
            Err(_) => {
                warn!("python runner did not exit; killing");
                self.child.kill().await.context("kill python runner")?;
            }
        }
        Ok(self.delegate)
    }

    async fn send(&mut self, message: &HostMessage<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("encode sandbox message")?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .context("write to python runner")?;
        self.stdin.flush().await.context("flush python runner stdin")
    }

    async fn recv(&mut self) -> Result<RunnerMessage> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .context("read from python runner")?;
        if read == 0 {
            let status = self.child.try_wait().ok().flatten();
            return Err(anyhow!(
                "python runner exited unexpectedly (status: {})",
                status.map_or_else(|| "unknown".to_string(), |s| s.to_string())
            ));
        }
        serde_json::from_str(line.trim())
            .with_context(|| format!("invalid message from python runner: {}", line.trim()))
    }

    /// Serve one host call. The outer `Err` aborts the run; the inner one is
    /// raised inside the running code.
    async fn dispatch(&mut self, name: &str, args: &[Value]) -> Result<CallReply> {
        match name {
            "worker" => {
                let prompt = match string_arg(args, 0, "prompt") {
                    Ok(prompt) => self.wrap_prompt(prompt),
                    Err(err) => return Ok(Err(err)),
                };
                let reply = self.delegate.delegate(&prompt).await?;
                Ok(Ok(Value::String(reply)))
            }
            "worker_batch" => {
                let prompts = match string_list_arg(args, 0, "prompts") {
                    Ok(prompts) => prompts
                        .into_iter()
                        .map(|p| self.wrap_prompt(&p))
                        .collect::<Vec<_>>(),
                    Err(err) => return Ok(Err(err)),
                };
                let replies = self.delegate.delegate_batch(&prompts).await?;
                Ok(Ok(Value::from(replies)))
            }
            name if self.features.builtin_chunking && CHUNKING_TOOLS.contains(&name) => {
                Ok(chunking_call(name, args))
            }
            other => Ok(Err(format!("unknown host function `{other}`"))),
        }
    }

    fn wrap_prompt(&self, prompt: &str) -> String {
        if self.features.structured_output {
            format!("{prompt}{STRUCTURED_OUTPUT_SUFFIX}")
        } else {
            prompt.to_string()
        }
    }
}

impl<D: Delegate> ExecutionEnv for PythonSandbox<D> {
    #[instrument(skip_all, fields(step = step, code_chars = code.len()))]
    async fn execute(&mut self, step: usize, code: &str) -> Result<ExecOutcome> {
        self.delegate.set_step(step);
        let started = Instant::now();
        self.send(&HostMessage::Exec { code }).await?;
        loop {
            match self.recv().await? {
                RunnerMessage::Call { name, args } => {
                    debug!(%name, "host call");
                    let reply = self
                        .dispatch(&name, &args)
                        .await
                        .with_context(|| format!("host call `{name}`"))?;
                    let message = match reply {
                        Ok(value) => HostMessage::Reply {
                            ok: true,
                            value: Some(value),
                            error: None,
                        },
                        Err(error) => HostMessage::Reply {
                            ok: false,
                            value: None,
                            error: Some(error),
                        },
                    };
                    self.send(&message).await?;
                }
                RunnerMessage::Result {
                    status,
                    stdout,
                    stderr,
                    answer,
                    error,
                    variables,
                } => {
                    let status = match status {
                        RunnerStatus::Normal => ExecStatus::Normal,
                        RunnerStatus::Terminated => {
                            let answer = answer.unwrap_or_default();
                            self.final_answer = Some(answer.clone());
                            ExecStatus::Terminated { answer }
                        }
                        RunnerStatus::Faulted => ExecStatus::Faulted {
                            error: error.unwrap_or_default(),
                        },
                    };
                    let elapsed = started.elapsed();
                    debug!(
                        ?status,
                        stdout_chars = stdout.len(),
                        stderr_chars = stderr.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "code unit finished"
                    );
                    return Ok(ExecOutcome {
                        stdout,
                        stderr,
                        elapsed,
                        variables,
                        status,
                    });
                }
                RunnerMessage::Error { error } => bail!("python runner error: {error}"),
                RunnerMessage::Ready => bail!("unexpected ready message from python runner"),
            }
        }
    }

    fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    fn output_limit(&self) -> usize {
        self.output_limit
    }
}

fn chunking_call(name: &str, args: &[Value]) -> CallReply {
    let text = string_arg(args, 0, "text")?;
    let chunks = match name {
        "chunk_by_section" => chunk_by_section(text),
        "chunk_by_paragraph" => {
            let min_length = usize_arg(args, 1, "min_length", DEFAULT_MIN_PARAGRAPH_LEN)?;
            chunk_by_paragraph(text, min_length)
        }
        _ => {
            let chunk_size = usize_arg(args, 1, "chunk_size", DEFAULT_CHUNK_SIZE)?;
            let overlap = usize_arg(args, 2, "overlap", DEFAULT_CHUNK_OVERLAP)?;
            chunk_by_tokens(text, chunk_size, overlap).map_err(|err| err.to_string())?
        }
    };
    Ok(Value::from(chunks))
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: PYTHON_TARGET, "{line}");
    }
}

fn string_arg<'a>(args: &'a [Value], idx: usize, name: &str) -> std::result::Result<&'a str, String> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("{name} must be a str, got {}", json_type(other))),
        None => Err(format!("missing argument `{name}`")),
    }
}

fn string_list_arg(args: &[Value], idx: usize, name: &str) -> std::result::Result<Vec<String>, String> {
    match args.get(idx) {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(format!("{name}[{i}] must be a str, got {}", json_type(other))),
            })
            .collect(),
        Some(other) => Err(format!("{name} must be a list of str, got {}", json_type(other))),
        None => Err(format!("missing argument `{name}`")),
    }
}

/// Missing or `None` arguments take `default`.
fn usize_arg(args: &[Value], idx: usize, name: &str, default: usize) -> std::result::Result<usize, String> {
    match args.get(idx) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| format!("{name} must be a non-negative int, got {n}")),
        Some(other) => Err(format!("{name} must be an int, got {}", json_type(other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
