//! Feature flags for prompt and wrapping ablations.

use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// One independent feature flag, listed in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    StructuredJobs,
    StructuredOutput,
    BuiltinChunking,
    ExplicitConvergence,
    SynthesisCot,
}

impl Flag {
    /// Every flag in the fixed order used for labels and prompt sections.
    pub const ALL: [Flag; 5] = [
        Flag::StructuredJobs,
        Flag::StructuredOutput,
        Flag::BuiltinChunking,
        Flag::ExplicitConvergence,
        Flag::SynthesisCot,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Flag::StructuredJobs => "structured_jobs",
            Flag::StructuredOutput => "structured_output",
            Flag::BuiltinChunking => "builtin_chunking",
            Flag::ExplicitConvergence => "explicit_convergence",
            Flag::SynthesisCot => "synthesis_cot",
        }
    }

    pub fn abbrev(self) -> &'static str {
        match self {
            Flag::StructuredJobs => "sj",
            Flag::StructuredOutput => "so",
            Flag::BuiltinChunking => "bc",
            Flag::ExplicitConvergence => "ec",
            Flag::SynthesisCot => "sc",
        }
    }

    /// Accepts either the abbreviation or the full name.
    pub fn parse(raw: &str) -> Result<Flag> {
        let raw = raw.trim();
        match Flag::ALL
            .into_iter()
            .find(|flag| flag.abbrev() == raw || flag.name() == raw)
        {
            Some(flag) => Ok(flag),
            None => bail!(
                "unknown feature flag `{raw}` (expected one of: {})",
                Flag::ALL.map(Flag::abbrev).join(", ")
            ),
        }
    }
}

/// Immutable set of feature flags. All default to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub structured_jobs: bool,
    pub structured_output: bool,
    pub builtin_chunking: bool,
    pub explicit_convergence: bool,
    pub synthesis_cot: bool,
}

impl FeatureFlags {
    pub fn all_on() -> Self {
        Self::from_fn(|_| true)
    }

    pub fn all_but(excluded: Flag) -> Self {
        Self::from_fn(|flag| flag != excluded)
    }

    pub fn only(included: Flag) -> Self {
        Self::from_fn(|flag| flag == included)
    }

    /// Parse a comma-separated list such as `sj,so` or `builtin_chunking`.
    ///
    /// An empty string or `none` yields the empty set.
    pub fn parse_list(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "none" {
            return Ok(Self::default());
        }
        let mut flags = Self::default();
        for part in raw.split([',', '-']).filter(|part| !part.trim().is_empty()) {
            flags.set(Flag::parse(part)?, true);
        }
        Ok(flags)
    }

    pub fn is_set(&self, flag: Flag) -> bool {
        match flag {
            Flag::StructuredJobs => self.structured_jobs,
            Flag::StructuredOutput => self.structured_output,
            Flag::BuiltinChunking => self.builtin_chunking,
            Flag::ExplicitConvergence => self.explicit_convergence,
            Flag::SynthesisCot => self.synthesis_cot,
        }
    }

    pub fn set(&mut self, flag: Flag, value: bool) {
        let slot = match flag {
            Flag::StructuredJobs => &mut self.structured_jobs,
            Flag::StructuredOutput => &mut self.structured_output,
            Flag::BuiltinChunking => &mut self.builtin_chunking,
            Flag::ExplicitConvergence => &mut self.explicit_convergence,
            Flag::SynthesisCot => &mut self.synthesis_cot,
        };
        *slot = value;
    }

    /// Enabled flags in declared order.
    pub fn enabled(&self) -> Vec<Flag> {
        Flag::ALL
            .into_iter()
            .filter(|flag| self.is_set(*flag))
            .collect()
    }

    /// Short label for directory naming, e.g. `sj-so-bc`, or `none`.
    pub fn label(&self) -> String {
        let parts: Vec<&str> = self.enabled().into_iter().map(Flag::abbrev).collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join("-")
        }
    }

    fn from_fn(mut pick: impl FnMut(Flag) -> bool) -> Self {
        let mut flags = Self::default();
        for flag in Flag::ALL {
            flags.set(flag, pick(flag));
        }
        flags
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
