//! # Failure Classification
//!
//! Maps raw failure text onto an [`ErrorKind`] with an ordered table of
//! case-insensitive substring rules. The first matching rule wins and
//! anything unmatched is [`ErrorKind::Generic`], so classification is total.
//!
//! Rules for the rendering subsystems (animation, material, texture,
//! geometry) also look at the stack trace, because those failures are often
//! reported with a terse message and a telling frame such as
//! `AnimationMixer.update`.

use serde::Serialize;

use crate::types::{ErrorKind, FailureReport};

/// Which parts of a failure a rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleScope {
    /// Only the failure message
    Message,
    /// The failure message and the stack trace
    MessageAndStack,
}

/// A single classification rule
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClassificationRule {
    /// Kind assigned when the rule matches
    pub kind: ErrorKind,
    /// Lowercase tokens, any of which matches
    pub tokens: &'static [&'static str],
    /// Text the tokens are searched in
    pub scope: RuleScope,
}

/// Default rule table, evaluated top to bottom
pub const DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        kind: ErrorKind::Network,
        tokens: &["network", "fetch", "404", "connection"],
        scope: RuleScope::Message,
    },
    ClassificationRule {
        kind: ErrorKind::Parsing,
        tokens: &[
            "invalid typed array length",
            "unexpected end of data",
            "unexpected end of json",
            "unexpected token",
            "corrupt",
            "unsupported file format",
        ],
        scope: RuleScope::Message,
    },
    ClassificationRule {
        kind: ErrorKind::Memory,
        tokens: &["memory", "out of memory", "allocation failed"],
        scope: RuleScope::Message,
    },
    ClassificationRule {
        kind: ErrorKind::Animation,
        tokens: &["animation", "mixer", "clip", "action"],
        scope: RuleScope::MessageAndStack,
    },
    ClassificationRule {
        kind: ErrorKind::Material,
        tokens: &["material", "shader", "uniform", "attribute"],
        scope: RuleScope::MessageAndStack,
    },
    ClassificationRule {
        kind: ErrorKind::Texture,
        tokens: &["texture", "image", "canvas"],
        scope: RuleScope::MessageAndStack,
    },
    ClassificationRule {
        kind: ErrorKind::Geometry,
        tokens: &["geometry", "buffer", "vertices", "indices"],
        scope: RuleScope::MessageAndStack,
    },
    ClassificationRule {
        kind: ErrorKind::Validation,
        tokens: &["validation", "invalid", "missing", "required"],
        scope: RuleScope::Message,
    },
    ClassificationRule {
        kind: ErrorKind::Loading,
        tokens: &["load", "import", "file", "path"],
        scope: RuleScope::Message,
    },
];

/// Classifies a failure against an explicit rule table
pub fn classify_with(rules: &[ClassificationRule], message: &str, stack: Option<&str>) -> ErrorKind {
    let message = message.to_lowercase();
    let stack = stack.map(str::to_lowercase);

    rules
        .iter()
        .find(|rule| {
            rule.tokens.iter().any(|token| {
                message.contains(token)
                    || (rule.scope == RuleScope::MessageAndStack
                        && stack.as_deref().map_or(false, |s| s.contains(token)))
            })
        })
        .map(|rule| rule.kind)
        .unwrap_or(ErrorKind::Generic)
}

/// Classifies a failure against [`DEFAULT_RULES`]
pub fn classify(message: &str, stack: Option<&str>) -> ErrorKind {
    classify_with(DEFAULT_RULES, message, stack)
}

/// Classifies a backend failure report
pub fn classify_report(report: &FailureReport) -> ErrorKind {
    classify(&report.message, report.stack.as_deref())
}
