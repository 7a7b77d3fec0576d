//! Skip rules
//!
//! A story may carry skip options in one of three shapes:
//! - a reason string, which always skips,
//! - a single rule whose matcher fields are AND-combined,
//! - a list of rules, OR-combined (the leftmost truthy result wins).
//!
//! Each matcher field is a literal string, a list of strings, or
//! `{ pattern = "<regex>" }`. An absent field matches everything.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::Skip;

/// Regular expression that must match the whole value
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{})$", source)).map(Self)
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }

    /// Pattern text as written, without the anchors added by [`Pattern::new`]
    pub fn source(&self) -> &str {
        let anchored = self.0.as_str();
        &anchored[4..anchored.len() - 2]
    }
}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.source())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// One matcher field of a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matcher {
    Exact(String),
    AnyOf(Vec<String>),
    Pattern { pattern: Pattern },
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == value,
            Matcher::AnyOf(values) => values.iter().any(|v| v == value),
            Matcher::Pattern { pattern } => pattern.is_match(value),
        }
    }
}

/// `true` when the matcher is absent or matches the value
pub fn matches(matcher: Option<&Matcher>, value: &str) -> bool {
    matcher.map_or(true, |m| m.matches(value))
}

/// A structured skip rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkipRule {
    /// Reason reported when the rule matches; `None` skips without a stated reason
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, alias = "in")]
    pub browsers: Option<Matcher>,
    #[serde(default)]
    pub kinds: Option<Matcher>,
    #[serde(default)]
    pub stories: Option<Matcher>,
    #[serde(default)]
    pub tests: Option<Matcher>,
}

/// Skip options attached to a story
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SkipOptions {
    Reason(String),
    Rules(Vec<SkipOptions>),
    Rule(SkipRule),
}

/// What a rule is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct SkipContext<'a> {
    pub browser: &'a str,
    pub kind: &'a str,
    pub story: &'a str,
    /// Name of an explicit story test; `None` for the implicit test
    pub test: Option<&'a str>,
}

/// Decide whether a test is skipped and why
pub fn should_skip(ctx: &SkipContext<'_>, options: &SkipOptions) -> Skip {
    match options {
        SkipOptions::Reason(reason) => Skip::Reason(reason.clone()),
        SkipOptions::Rules(rules) => rules
            .iter()
            .map(|rule| should_skip(ctx, rule))
            .find(Skip::is_skipped)
            .unwrap_or_default(),
        SkipOptions::Rule(rule) => {
            let matched = matches(rule.browsers.as_ref(), ctx.browser)
                && matches(rule.kinds.as_ref(), ctx.kind)
                && matches(rule.stories.as_ref(), ctx.story)
                && ctx.test.map_or(true, |test| matches(rule.tests.as_ref(), test));
            if !matched {
                return Skip::Flag(false);
            }
            match &rule.reason {
                Some(reason) => Skip::Reason(reason.clone()),
                None => Skip::Flag(true),
            }
        }
    }
}
