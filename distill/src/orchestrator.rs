//! Iteration controller: drives the supervisor conversation until a final answer.
//!
//! [`drive`] owns the conversation history and is generic over the supervisor
//! client and the execution environment, so it can be tested with scripted
//! doubles. [`run`] wires the real collaborators together for one task.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::extract::extract_code_units;
use crate::core::nudge::{FORCE_FINAL_NUDGE, WRITE_CODE_NUDGE, compose_nudge};
use crate::core::output::render_block;
use crate::core::types::{Completion, Message, Usage};
use crate::io::config::RunConfig;
use crate::io::delegate::{Delegate, WorkerChannel};
use crate::io::model::ModelClient;
use crate::io::prompt::compose_system;
use crate::io::run_log::RunLogger;
use crate::io::sandbox::{ExecutionEnv, PythonSandbox, SandboxOptions};

/// One question over one document.
#[derive(Debug, Clone, Copy)]
pub struct Task<'a> {
    pub query: &'a str,
    pub context: &'a str,
    /// Free-form tag recorded in the task log (e.g. a dataset example id).
    pub label: Option<&'a str>,
}

/// Result of a complete run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub answer: String,
    /// `false` when the answer is the raw text of the forced final reply.
    pub answered_by_final: bool,
    /// Supervisor turns consumed, including the forced final turn.
    pub iterations: usize,
    pub supervisor_usage: Usage,
    pub worker_usage: Usage,
    pub elapsed: Duration,
}

/// What the controller loop produced, before worker usage is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveOutcome {
    pub answer: String,
    pub answered_by_final: bool,
    pub iterations: usize,
    pub supervisor_usage: Usage,
    /// Conversation history at the time the run ended.
    pub history: Vec<Message>,
}

/// Run the supervisor loop over an opening `history` until a final answer.
///
/// Each of the `max_iterations` turns either executes the reply's code units
/// or, for a text-only reply, appends the write-code nudge. Once the budget is
/// spent, one forced turn follows; if it does not terminate either, its raw
/// text becomes the answer.
#[instrument(skip_all, fields(max_iterations = config.max_iterations, features = %config.features))]
pub async fn drive<M, E>(
    supervisor: &M,
    env: &mut E,
    history: Vec<Message>,
    config: &RunConfig,
    logger: Option<&RunLogger>,
) -> Result<DriveOutcome>
where
    M: ModelClient,
    E: ExecutionEnv,
{
    let max_iterations = config.max_iterations;
    let mut messages = history;
    let mut usage = Usage::default();

    for step in 0..max_iterations {
        let reply = call_supervisor(supervisor, &messages, step, logger).await?;
        usage += reply.usage;

        let units = extract_code_units(&reply.text);
        debug!(step, code_units = units.len(), "supervisor replied");
        if units.is_empty() {
            messages.push(Message::assistant(reply.text));
            messages.push(Message::user(WRITE_CODE_NUDGE));
            continue;
        }

        let mut blocks = Vec::with_capacity(units.len());
        for code in &units {
            let outcome = env.execute(step, code).await?;
            if let Some(logger) = logger {
                logger.log_repl(step, code, &outcome)?;
            }
            blocks.push(render_block(code, &env.truncate_output(&outcome)));
            if let Some(answer) = env.final_answer() {
                info!(step, "final answer set");
                return Ok(DriveOutcome {
                    answer: answer.to_string(),
                    answered_by_final: true,
                    iterations: step + 1,
                    supervisor_usage: usage,
                    history: messages,
                });
            }
        }

        messages.push(Message::assistant(reply.text));
        let nudge = compose_nudge(step, max_iterations, &config.features);
        messages.push(Message::user(format!("{}\n\n{nudge}", blocks.join("\n\n"))));
    }

    warn!(max_iterations, "iteration budget exhausted; forcing final answer");
    messages.push(Message::user(FORCE_FINAL_NUDGE));
    let step = max_iterations;
    let reply = call_supervisor(supervisor, &messages, step, logger).await?;
    usage += reply.usage;

    for code in extract_code_units(&reply.text) {
        let outcome = env.execute(step, &code).await?;
        if let Some(logger) = logger {
            logger.log_repl(step, &code, &outcome)?;
        }
        if let Some(answer) = env.final_answer() {
            return Ok(DriveOutcome {
                answer: answer.to_string(),
                answered_by_final: true,
                iterations: step + 1,
                supervisor_usage: usage,
                history: messages,
            });
        }
    }

    Ok(DriveOutcome {
        answer: reply.text,
        answered_by_final: false,
        iterations: step + 1,
        supervisor_usage: usage,
        history: messages,
    })
}

async fn call_supervisor<M: ModelClient>(
    supervisor: &M,
    messages: &[Message],
    step: usize,
    logger: Option<&RunLogger>,
) -> Result<Completion> {
    let reply = supervisor
        .chat(messages)
        .await
        .with_context(|| format!("supervisor call at step {step}"))?;
    if let Some(logger) = logger {
        logger.log_supervisor(step, messages, &reply)?;
    }
    Ok(reply)
}

/// Answer `task` with a fresh Python sandbox and the given model clients.
///
/// When `config.log_dir` is set, the four JSONL streams are written there.
/// Logs already written stay on disk if the run fails.
#[instrument(skip_all, fields(label = task.label.unwrap_or_default(), context_chars = task.context.len()))]
pub async fn run<S, W>(
    task: &Task<'_>,
    supervisor: &S,
    worker: &W,
    config: &RunConfig,
) -> Result<RunResult>
where
    S: ModelClient,
    W: ModelClient,
{
    config.validate()?;
    let started = Instant::now();
    let logger = config
        .log_dir
        .as_deref()
        .map(RunLogger::create)
        .transpose()?;
    if let Some(logger) = &logger {
        logger.log_task_input(task.query, task.context, task.label, Some(&config.features))?;
    }

    let (system, user) = compose_system(task.context, task.query, config)?;
    let options = SandboxOptions {
        python_command: config.python_command.clone(),
        output_limit: config.output_limit,
        features: config.features,
    };
    let channel = WorkerChannel::new(worker, logger.as_ref());
    let mut sandbox = PythonSandbox::spawn(&options, task.context, task.query, channel).await?;

    let outcome = drive(
        supervisor,
        &mut sandbox,
        vec![system, user],
        config,
        logger.as_ref(),
    )
    .await?;
    let channel = sandbox.shutdown().await?;

    if let Some(logger) = &logger {
        logger.log_task_output(&outcome.answer)?;
    }
    let result = RunResult {
        answer: outcome.answer,
        answered_by_final: outcome.answered_by_final,
        iterations: outcome.iterations,
        supervisor_usage: outcome.supervisor_usage,
        worker_usage: channel.usage(),
        elapsed: started.elapsed(),
    };
    info!(
        iterations = result.iterations,
        answered_by_final = result.answered_by_final,
        supervisor_tokens = result.supervisor_usage.input_tokens + result.supervisor_usage.output_tokens,
        worker_tokens = result.worker_usage.input_tokens + result.worker_usage.output_tokens,
        elapsed_ms = result.elapsed.as_millis() as u64,
        "run finished"
    );
    Ok(result)
}
