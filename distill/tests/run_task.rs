//! End-to-end runs through the real Python sandbox with scripted models.

use std::fs;
use std::path::Path;

use serde_json::Value;

use distill::core::features::FeatureFlags;
use distill::core::types::Role;
use distill::io::config::RunConfig;
use distill::io::run_log::{REPL_LOG, SUPERVISOR_LOG, TASK_LOG, WORKER_LOG};
use distill::orchestrator::{Task, run};
use distill::test_support::{ScriptedModel, python_available, usage_between};

const CONTEXT: &str = "Alpha beta gamma delta.";

fn read_jsonl(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid json line"))
        .collect()
}

fn run_config(log_dir: &Path, max_iterations: usize) -> RunConfig {
    RunConfig {
        max_iterations,
        log_dir: Some(log_dir.to_path_buf()),
        ..RunConfig::default()
    }
}

/// Verifies a delegate-then-FINAL run answers, counts usage and writes every log stream.
#[tokio::test]
async fn delegated_answer_reaches_final() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let supervisor = ScriptedModel::replies(
        "supervisor",
        [
            "Ask a worker.\n```repl\nanswer = worker(context[:10])\nprint(answer)\n```",
            "```repl\nFINAL(answer)\n```",
        ],
    );
    let worker = ScriptedModel::echo("worker");
    let task = Task {
        query: "What comes first?",
        context: CONTEXT,
        label: Some("smoke"),
    };

    let result = run(&task, &supervisor, &worker, &run_config(temp.path(), 5))
        .await
        .expect("run");

    assert_eq!(result.answer, "echo: Alpha beta");
    assert!(result.answered_by_final);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.worker_usage, usage_between("Alpha beta", "echo: Alpha beta"));

    let calls = supervisor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0][0].role, Role::System);
    assert_eq!(
        calls[0][1].content,
        "Context length: 23 characters.\n\nQuestion: What comes first?"
    );
    let feedback = &calls[1].last().expect("feedback turn").content;
    assert!(
        feedback.contains("Output:\necho: Alpha beta\n"),
        "unexpected feedback: {feedback}"
    );

    let task_log = read_jsonl(&temp.path().join(TASK_LOG));
    assert_eq!(task_log.len(), 2);
    assert_eq!(task_log[0]["type"], "input");
    assert_eq!(task_log[0]["context"], CONTEXT);
    assert_eq!(task_log[0]["label"], "smoke");
    assert_eq!(task_log[1]["type"], "output");
    assert_eq!(task_log[1]["answer"], "echo: Alpha beta");

    let supervisor_log = read_jsonl(&temp.path().join(SUPERVISOR_LOG));
    let steps: Vec<u64> = supervisor_log
        .iter()
        .map(|r| r["step"].as_u64().expect("step"))
        .collect();
    assert_eq!(steps, vec![0, 1]);

    let worker_log = read_jsonl(&temp.path().join(WORKER_LOG));
    assert_eq!(worker_log.len(), 1);
    assert_eq!(worker_log[0]["step"], 0);
    assert_eq!(worker_log[0]["prompt"], "Alpha beta");
    assert_eq!(worker_log[0]["response"], "echo: Alpha beta");

    let repl_log = read_jsonl(&temp.path().join(REPL_LOG));
    assert_eq!(repl_log.len(), 2);
    assert_eq!(repl_log[0]["stdout"], "echo: Alpha beta\n");
    assert_eq!(repl_log[1]["step"], 1);
}

/// Verifies a supervisor that never calls FINAL falls back to the forced turn's text.
#[tokio::test]
async fn budget_exhaustion_falls_back_to_forced_reply() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let supervisor = ScriptedModel::replies(
        "supervisor",
        [
            "```repl\nprint(len(context))\n```",
            "Still thinking.",
            "It is alpha.",
        ],
    );
    let worker = ScriptedModel::echo("worker");
    let task = Task {
        query: "Which word?",
        context: CONTEXT,
        label: None,
    };

    let result = run(&task, &supervisor, &worker, &run_config(temp.path(), 2))
        .await
        .expect("run");

    assert_eq!(result.answer, "It is alpha.");
    assert!(!result.answered_by_final);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.worker_usage, Default::default());
    assert!(fs::read_to_string(temp.path().join(WORKER_LOG)).expect("worker log").is_empty());
}

/// Verifies feature flags reach the sandbox so chunking helpers are callable.
#[tokio::test]
async fn chunking_flag_exposes_helpers() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let supervisor = ScriptedModel::replies(
        "supervisor",
        ["```repl\nFINAL(len(chunk_by_tokens(context, 10, 2)))\n```"],
    );
    let worker = ScriptedModel::echo("worker");
    let task = Task {
        query: "How many chunks?",
        context: CONTEXT,
        label: None,
    };
    let config = RunConfig {
        features: FeatureFlags::parse_list("bc").expect("flags"),
        ..run_config(temp.path(), 3)
    };

    let result = run(&task, &supervisor, &worker, &config).await.expect("run");
    // 23 chars, stride 8: windows start at 0, 8 and 16.
    assert_eq!(result.answer, "3");
    assert_eq!(result.iterations, 1);
}

#[tokio::test]
async fn invalid_config_fails_before_spawning() {
    let supervisor = ScriptedModel::replies("supervisor", Vec::<String>::new());
    let worker = ScriptedModel::echo("worker");
    let task = Task {
        query: "q",
        context: "c",
        label: None,
    };
    let config = RunConfig {
        max_iterations: 0,
        ..RunConfig::default()
    };
    let err = run(&task, &supervisor, &worker, &config)
        .await
        .err()
        .expect("invalid config should fail");
    assert!(err.to_string().contains("max_iterations"));
    assert!(supervisor.calls().is_empty());
}
