//! Platform facts, predicates, and conditional argument tables.
//!
//! Architecture-conditional behavior is expressed as data: a
//! [`PlatformPredicate`] gates a dependency reference or an argument
//! rule, and predicates are evaluated exactly once at plan time. The
//! build executor never branches on environment facts itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// CPU architecture of the build host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    X86_64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Arm64 => write!(f, "arm64"),
            Arch::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// The facts a predicate can observe about the target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// OS release label, e.g. `"catalina"` or `"mojave"`.
    pub os: String,
    pub arch: Arch,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: Arch) -> Self {
        Platform {
            os: os.into(),
            arch,
        }
    }

    /// Platform tag used to key precomputed-artifact (bottle) feeds.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

/// A predicate over [`Platform`] facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPredicate {
    Always,
    OnArch(Arch),
    NotArch(Arch),
    OnOs(String),
    NotOs(String),
}

impl Default for PlatformPredicate {
    fn default() -> Self {
        PlatformPredicate::Always
    }
}

impl PlatformPredicate {
    pub fn matches(&self, platform: &Platform) -> bool {
        match self {
            PlatformPredicate::Always => true,
            PlatformPredicate::OnArch(arch) => platform.arch == *arch,
            PlatformPredicate::NotArch(arch) => platform.arch != *arch,
            PlatformPredicate::OnOs(os) => platform.os == *os,
            PlatformPredicate::NotOs(os) => platform.os != *os,
        }
    }
}

/// One predicate-gated set of build arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgRule {
    pub when: PlatformPredicate,
    pub args: Vec<String>,
}

impl ArgRule {
    pub fn new(when: PlatformPredicate, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ArgRule {
            when,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Unconditional arguments.
    pub fn always(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ArgRule::new(PlatformPredicate::Always, args)
    }
}

/// An ordered predicate -> argument-set table.
///
/// Rules contribute their arguments in declared order when their
/// predicate matches. [`ArgTable::resolve`] is called once at plan time
/// and the resulting concrete argument list flows into the recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgTable {
    rules: Vec<ArgRule>,
}

impl ArgTable {
    pub fn new() -> Self {
        ArgTable::default()
    }

    pub fn push(&mut self, rule: ArgRule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: ArgRule) -> Self {
        self.push(rule);
        self
    }

    pub fn rules(&self) -> &[ArgRule] {
        &self.rules
    }

    /// Flattens the table against a concrete platform.
    pub fn resolve(&self, platform: &Platform) -> Vec<String> {
        self.rules
            .iter()
            .filter(|rule| rule.when.matches(platform))
            .flat_map(|rule| rule.args.iter().cloned())
            .collect()
    }
}
