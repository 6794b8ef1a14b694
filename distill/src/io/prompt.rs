//! Supervisor prompt composition from flag-gated template sections.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, Value, context};
use tracing::debug;

use crate::core::features::{FeatureFlags, Flag};
use crate::core::types::Message;
use crate::io::config::RunConfig;

/// Characters of worker prompt budget per unit of `worker_context_k`.
pub const WORKER_CHARS_PER_K: usize = 1024;

const BASE_TEMPLATE: &str = include_str!("prompts/base.md");
const STRATEGY_DEFAULT_TEMPLATE: &str = include_str!("prompts/strategy_default.md");
const STRATEGY_STRUCTURED_JOBS_TEMPLATE: &str = include_str!("prompts/strategy_structured_jobs.md");
const STRUCTURED_OUTPUT_TEMPLATE: &str = include_str!("prompts/structured_output.md");
const BUILTIN_CHUNKING_TEMPLATE: &str = include_str!("prompts/builtin_chunking.md");
const EXPLICIT_CONVERGENCE_TEMPLATE: &str = include_str!("prompts/explicit_convergence.md");
const SYNTHESIS_COT_TEMPLATE: &str = include_str!("prompts/synthesis_cot.md");
const CONSTRAINTS_TEMPLATE: &str = include_str!("prompts/constraints.md");

/// When a section is included.
#[derive(Debug, Clone, Copy)]
enum Gate {
    Always,
    When(Flag),
    Unless(Flag),
}

impl Gate {
    fn admits(self, flags: &FeatureFlags) -> bool {
        match self {
            Gate::Always => true,
            Gate::When(flag) => flags.is_set(flag),
            Gate::Unless(flag) => !flags.is_set(flag),
        }
    }
}

struct SectionRule {
    name: &'static str,
    gate: Gate,
    source: &'static str,
}

/// Sections in the order they appear in the composed instructions.
const SECTION_RULES: &[SectionRule] = &[
    SectionRule {
        name: "base",
        gate: Gate::Always,
        source: BASE_TEMPLATE,
    },
    SectionRule {
        name: "strategy_default",
        gate: Gate::Unless(Flag::StructuredJobs),
        source: STRATEGY_DEFAULT_TEMPLATE,
    },
    SectionRule {
        name: "strategy_structured_jobs",
        gate: Gate::When(Flag::StructuredJobs),
        source: STRATEGY_STRUCTURED_JOBS_TEMPLATE,
    },
    SectionRule {
        name: "structured_output",
        gate: Gate::When(Flag::StructuredOutput),
        source: STRUCTURED_OUTPUT_TEMPLATE,
    },
    SectionRule {
        name: "builtin_chunking",
        gate: Gate::When(Flag::BuiltinChunking),
        source: BUILTIN_CHUNKING_TEMPLATE,
    },
    SectionRule {
        name: "explicit_convergence",
        gate: Gate::When(Flag::ExplicitConvergence),
        source: EXPLICIT_CONVERGENCE_TEMPLATE,
    },
    SectionRule {
        name: "synthesis_cot",
        gate: Gate::When(Flag::SynthesisCot),
        source: SYNTHESIS_COT_TEMPLATE,
    },
    SectionRule {
        name: "constraints",
        gate: Gate::Always,
        source: CONSTRAINTS_TEMPLATE,
    },
];

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        for rule in SECTION_RULES {
            env.add_template(rule.name, rule.source)
                .expect("prompt section template should be valid");
        }
        Self { env }
    }

    fn render_sections(&self, flags: &FeatureFlags, vars: &Value) -> Result<String> {
        let mut parts = Vec::new();
        for rule in SECTION_RULES.iter().filter(|rule| rule.gate.admits(flags)) {
            let template = self.env.get_template(rule.name)?;
            let rendered = template
                .render(vars)
                .with_context(|| format!("render prompt section {}", rule.name))?;
            parts.push(rendered);
        }
        Ok(parts.join("\n"))
    }

    fn render_override(&self, source: &str, vars: &Value) -> Result<String> {
        self.env
            .render_str(source, vars)
            .context("render prompt template override")
    }
}

fn template_vars(config: &RunConfig) -> Result<Value> {
    let worker_chunk = config
        .worker_context_k
        .checked_mul(WORKER_CHARS_PER_K)
        .ok_or_else(|| anyhow!("worker_context_k {} is too large", config.worker_context_k))?;
    Ok(context! {
        worker_ctx => config.worker_context_k,
        worker_chunk => worker_chunk,
        output_limit => config.output_limit,
    })
}

/// System instructions for a run.
///
/// An override template is rendered on its own and ignores the feature flags.
pub fn compose_instructions(config: &RunConfig) -> Result<String> {
    let engine = PromptEngine::new();
    let vars = template_vars(config)?;
    let text = match &config.prompt_template {
        Some(source) => engine.render_override(source, &vars)?,
        None => engine.render_sections(&config.features, &vars)?,
    };
    debug!(
        features = %config.features,
        overridden = config.prompt_template.is_some(),
        chars = text.len(),
        "composed supervisor instructions"
    );
    Ok(text)
}

/// Opening `(system, user)` pair of the supervisor conversation.
///
/// The user turn carries only the document length and the verbatim query.
pub fn compose_system(context: &str, query: &str, config: &RunConfig) -> Result<(Message, Message)> {
    let system = compose_instructions(config)?;
    Ok((
        Message::system(system),
        compose_user(context.chars().count(), query),
    ))
}

/// Opening user turn for a document of `context_chars` characters.
pub fn compose_user(context_chars: usize, query: &str) -> Message {
    Message::user(format!(
        "Context length: {} characters.\n\nQuestion: {query}",
        group_thousands(context_chars)
    ))
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(features: FeatureFlags) -> RunConfig {
        RunConfig {
            features,
            ..RunConfig::default()
        }
    }

    #[test]
    fn default_prompt_has_base_strategy_and_constraints() {
        let text = compose_instructions(&RunConfig::default()).expect("compose");
        assert!(text.starts_with("You are a research supervisor."));
        assert!(text.contains("~8k context window, so keep prompts under 8192 chars"));
        assert!(text.contains("\nStrategy:\n1. Inspect `context`"));
        assert!(text.contains("only the first 2000 chars of stdout/stderr"));
        assert!(!text.contains("structured decomposition"));
        assert!(!text.contains("## Structured worker output"));
        assert!(text.ends_with("multi-step reasoning.\n"));
    }

    #[test]
    fn structured_jobs_replaces_default_strategy() {
        let text =
            compose_instructions(&config_with(FeatureFlags::only(Flag::StructuredJobs))).expect("compose");
        assert!(text.contains("Strategy — structured decomposition:"));
        assert!(!text.contains("\nStrategy:\n"));
    }

    #[test]
    fn sections_follow_declared_order() {
        let text = compose_instructions(&config_with(FeatureFlags::all_on())).expect("compose");
        let markers = [
            "Strategy — structured decomposition:",
            "## Structured worker output",
            "## Document chunking primitives",
            "## Convergence protocol",
            "## Synthesis protocol",
            "Keep print output concise",
        ];
        let positions: Vec<usize> = markers
            .iter()
            .map(|m| text.find(m).unwrap_or_else(|| panic!("missing {m}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }

    #[test]
    fn each_flag_adds_only_its_section() {
        let cases = [
            (Flag::StructuredOutput, "## Structured worker output"),
            (Flag::BuiltinChunking, "chunk_by_paragraph(text, min_length=100)"),
            (Flag::ExplicitConvergence, "Maintain a `scratchpad` variable"),
            (Flag::SynthesisCot, "Print a numbered list of all evidence"),
        ];
        for (flag, marker) in cases {
            let with = compose_instructions(&config_with(FeatureFlags::only(flag))).expect("compose");
            let without =
                compose_instructions(&config_with(FeatureFlags::all_but(flag))).expect("compose");
            assert!(with.contains(marker), "{} should add {marker}", flag.name());
            assert!(!without.contains(marker), "{} leaked {marker}", flag.name());
        }
    }

    #[test]
    fn worker_budget_scales_with_context_k() {
        let config = RunConfig {
            worker_context_k: 32,
            output_limit: 500,
            ..RunConfig::default()
        };
        let text = compose_instructions(&config).expect("compose");
        assert!(text.contains("~32k context window, so keep prompts under 32768 chars"));
        assert!(text.contains("only the first 500 chars"));
    }

    #[test]
    fn oversized_worker_budget_is_an_error() {
        let config = RunConfig {
            worker_context_k: usize::MAX,
            ..RunConfig::default()
        };
        let err = compose_instructions(&config).unwrap_err();
        assert!(err.to_string().contains("worker_context_k"), "{err}");
    }

    #[test]
    fn override_template_bypasses_flags() {
        let config = RunConfig {
            prompt_template: Some(
                "ctx={{ worker_ctx }} chunk={{ worker_chunk }} limit={{ output_limit }}".to_string(),
            ),
            features: FeatureFlags::all_on(),
            ..RunConfig::default()
        };
        let text = compose_instructions(&config).expect("compose");
        assert_eq!(text, "ctx=8 chunk=8192 limit=2000");
    }

    #[test]
    fn malformed_override_is_an_error() {
        let config = RunConfig {
            prompt_template: Some("{{ worker_ctx ".to_string()),
            ..RunConfig::default()
        };
        assert!(compose_instructions(&config).is_err());
    }

    #[test]
    fn user_turn_reports_length_and_query() {
        let context = "a".repeat(50_000);
        let (system, user) =
            compose_system(&context, "What is X?", &RunConfig::default()).expect("compose");
        assert!(system.content.starts_with("You are a research supervisor."));
        assert_eq!(
            user.content,
            "Context length: 50,000 characters.\n\nQuestion: What is X?"
        );
        assert!(!system.content.contains(&context));
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }
}
