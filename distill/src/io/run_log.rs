//! Append-only JSONL run logs: `task.jsonl`, `supervisor.jsonl`, `worker.jsonl`, `repl.jsonl`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::core::features::FeatureFlags;
use crate::core::output::ExecOutcome;
use crate::core::types::{Completion, Message, Usage};

pub const TASK_LOG: &str = "task.jsonl";
pub const SUPERVISOR_LOG: &str = "supervisor.jsonl";
pub const WORKER_LOG: &str = "worker.jsonl";
pub const REPL_LOG: &str = "repl.jsonl";

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaskRecord<'a> {
    Input {
        query: &'a str,
        context: &'a str,
        label: &'a str,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        features: Option<&'a FeatureFlags>,
    },
    Output {
        answer: &'a str,
        timestamp: String,
    },
}

#[derive(Debug, Serialize)]
struct SupervisorRecord<'a> {
    step: usize,
    timestamp: String,
    model: &'a str,
    messages: &'a [Message],
    response: &'a str,
    usage: Usage,
    /// Seconds.
    elapsed: f64,
}

#[derive(Debug, Serialize)]
struct WorkerRecord<'a> {
    step: usize,
    timestamp: String,
    model: &'a str,
    prompt: &'a str,
    response: &'a str,
    usage: Usage,
    elapsed: f64,
}

#[derive(Debug, Serialize)]
struct ReplRecord<'a> {
    step: usize,
    timestamp: String,
    code: &'a str,
    stdout: &'a str,
    stderr: &'a str,
    elapsed: f64,
}

/// Writer for the four per-run streams. Records are flushed as they are written.
pub struct RunLogger {
    dir: PathBuf,
    task: Mutex<File>,
    supervisor: Mutex<File>,
    worker: Mutex<File>,
    repl: Mutex<File>,
}

impl RunLogger {
    /// Create `dir` if needed and open every stream in append mode.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            task: Mutex::new(open_append(&dir.join(TASK_LOG))?),
            supervisor: Mutex::new(open_append(&dir.join(SUPERVISOR_LOG))?),
            worker: Mutex::new(open_append(&dir.join(WORKER_LOG))?),
            repl: Mutex::new(open_append(&dir.join(REPL_LOG))?),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_task_input(
        &self,
        query: &str,
        context: &str,
        label: Option<&str>,
        features: Option<&FeatureFlags>,
    ) -> Result<()> {
        let record = TaskRecord::Input {
            query,
            context,
            label: label.unwrap_or_default(),
            timestamp: now(),
            features,
        };
        append(&self.task, TASK_LOG, &record)
    }

    pub fn log_task_output(&self, answer: &str) -> Result<()> {
        let record = TaskRecord::Output {
            answer,
            timestamp: now(),
        };
        append(&self.task, TASK_LOG, &record)
    }

    /// One supervisor turn with the history it was called with.
    pub fn log_supervisor(
        &self,
        step: usize,
        messages: &[Message],
        completion: &Completion,
    ) -> Result<()> {
        let record = SupervisorRecord {
            step,
            timestamp: now(),
            model: &completion.model,
            messages,
            response: &completion.text,
            usage: completion.usage,
            elapsed: completion.elapsed.as_secs_f64(),
        };
        append(&self.supervisor, SUPERVISOR_LOG, &record)
    }

    pub fn log_worker(&self, step: usize, prompt: &str, completion: &Completion) -> Result<()> {
        let record = WorkerRecord {
            step,
            timestamp: now(),
            model: &completion.model,
            prompt,
            response: &completion.text,
            usage: completion.usage,
            elapsed: completion.elapsed.as_secs_f64(),
        };
        append(&self.worker, WORKER_LOG, &record)
    }

    /// Full untruncated streams of one code-unit execution.
    pub fn log_repl(&self, step: usize, code: &str, outcome: &ExecOutcome) -> Result<()> {
        let record = ReplRecord {
            step,
            timestamp: now(),
            code,
            stdout: &outcome.stdout,
            stderr: &outcome.stderr,
            elapsed: outcome.elapsed.as_secs_f64(),
        };
        append(&self.repl, REPL_LOG, &record)
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))
}

fn append<T: Serialize>(file: &Mutex<File>, name: &str, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).with_context(|| format!("encode {name} record"))?;
    line.push('\n');
    let mut file = file
        .lock()
        .map_err(|_| anyhow!("{name} writer poisoned"))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {name}"))?;
    file.flush().with_context(|| format!("flush {name}"))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
