//! Supervisor-worker question answering over long documents.
//!
//! `distill ask` runs one question against one document; `distill prompt`
//! previews the composed supervisor prompt for a flag combination;
//! `distill config` writes a default config file.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use distill::core::features::FeatureFlags;
use distill::exit_codes;
use distill::io::config::{
    AppConfig, RunOverrides, apply_overrides, load_config, write_config,
};
use distill::io::model::OpenAiClient;
use distill::io::prompt::{compose_instructions, compose_user};
use distill::orchestrator::{self, RunResult, Task};

#[derive(Parser)]
#[command(
    name = "distill",
    version,
    about = "Supervisor-worker question answering over long documents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question about a document.
    Ask(AskArgs),
    /// Print the composed supervisor prompt without calling any model.
    Prompt(PromptArgs),
    /// Write the default configuration file.
    Config(ConfigArgs),
}

/// Settings shared by every command that composes a prompt.
#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Config file. Missing files fall back to defaults.
    #[arg(long, default_value = "distill.toml")]
    config: PathBuf,

    #[arg(long)]
    max_iterations: Option<usize>,

    /// Max characters of execution output shown to the supervisor.
    #[arg(long)]
    output_limit: Option<usize>,

    /// Worker context window, in thousands.
    #[arg(long)]
    worker_context_k: Option<usize>,

    /// Feature flags, e.g. `sj,so` or `none`.
    #[arg(long, value_parser = FeatureFlags::parse_list)]
    flags: Option<FeatureFlags>,

    /// File whose contents replace the flag-composed instructions.
    #[arg(long)]
    prompt_template: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    /// Document to answer questions about.
    #[arg(long)]
    document: PathBuf,

    #[arg(long)]
    query: String,

    /// Directory for JSONL run logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Tag recorded in the task log.
    #[arg(long)]
    label: Option<String>,

    #[arg(long)]
    supervisor_model: Option<String>,

    #[arg(long)]
    worker_model: Option<String>,

    /// API root for both models.
    #[arg(long)]
    base_url: Option<String>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug, Clone)]
struct PromptArgs {
    /// Document length reported in the user turn.
    #[arg(long, default_value_t = 0)]
    context_len: usize,

    #[arg(long, default_value = "<query>")]
    query: String,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[arg(long, default_value = "distill.toml")]
    config: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() {
    distill::logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // Usage errors share the generic error code; clap's default (2) means fallback here.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().context("print usage")?;
            return Ok(if err.use_stderr() {
                exit_codes::ERROR
            } else {
                exit_codes::OK
            });
        }
    };
    match cli.command {
        Command::Ask(args) => cmd_ask(args).await,
        Command::Prompt(args) => cmd_prompt(&args),
        Command::Config(args) => cmd_config(&args),
    }
}

async fn cmd_ask(args: AskArgs) -> Result<i32> {
    let overrides = RunOverrides {
        log_dir: args.log_dir.clone(),
        supervisor_model: args.supervisor_model.clone(),
        worker_model: args.worker_model.clone(),
        base_url: args.base_url.clone(),
        ..run_overrides(&args.run)?
    };
    let cfg = resolve_config(&args.run, &overrides)?;
    let document = fs::read_to_string(&args.document)
        .with_context(|| format!("read document {}", args.document.display()))?;

    let supervisor = OpenAiClient::new(&cfg.supervisor).context("build supervisor client")?;
    let worker = OpenAiClient::new(&cfg.worker).context("build worker client")?;
    let task = Task {
        query: &args.query,
        context: &document,
        label: args.label.as_deref(),
    };
    let result = orchestrator::run(&task, &supervisor, &worker, &cfg.run).await?;
    print!("{}", render_result(&result));
    Ok(if result.answered_by_final {
        exit_codes::OK
    } else {
        exit_codes::FALLBACK
    })
}

fn cmd_prompt(args: &PromptArgs) -> Result<i32> {
    let cfg = resolve_config(&args.run, &run_overrides(&args.run)?)?;
    let system = compose_instructions(&cfg.run)?;
    let user = compose_user(args.context_len, &args.query);
    println!("flags: {}", cfg.run.features);
    println!();
    println!("=== system ===");
    print!("{system}");
    println!();
    println!("=== user ===");
    println!("{}", user.content);
    Ok(exit_codes::OK)
}

fn cmd_config(args: &ConfigArgs) -> Result<i32> {
    if args.config.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.config.display()
        );
    }
    write_config(&args.config, &AppConfig::default())?;
    println!("wrote {}", args.config.display());
    Ok(exit_codes::OK)
}

fn run_overrides(args: &RunArgs) -> Result<RunOverrides> {
    let prompt_template = args
        .prompt_template
        .as_ref()
        .map(|path| {
            fs::read_to_string(path)
                .with_context(|| format!("read prompt template {}", path.display()))
        })
        .transpose()?;
    Ok(RunOverrides {
        max_iterations: args.max_iterations,
        output_limit: args.output_limit,
        worker_context_k: args.worker_context_k,
        features: args.flags,
        prompt_template,
        ..RunOverrides::default()
    })
}

fn resolve_config(args: &RunArgs, overrides: &RunOverrides) -> Result<AppConfig> {
    let base = load_config(&args.config)?;
    apply_overrides(base, overrides)
}

fn render_result(result: &RunResult) -> String {
    let source = if result.answered_by_final {
        "FINAL"
    } else {
        "fallback"
    };
    format!(
        "answer ({source}): {}\n\
         iterations: {}\n\
         supervisor tokens: {} in / {} out\n\
         worker tokens: {} in / {} out\n\
         elapsed: {:.1}s\n",
        result.answer,
        result.iterations,
        result.supervisor_usage.input_tokens,
        result.supervisor_usage.output_tokens,
        result.worker_usage.input_tokens,
        result.worker_usage.output_tokens,
        result.elapsed.as_secs_f64(),
    )
}
