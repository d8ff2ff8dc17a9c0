//! Path prefix rewriting for switches
//!
//! Rules are kept in insertion order and the first rule whose prefix matches
//! the start of the path wins. Replacing the target of an existing prefix
//! keeps its position. The table is shared by every request using the switch,
//! so it sits behind a read-write lock and may be changed while serving.

use crate::proxy::types::DEFAULT_PATH;
use parking_lot::RwLock;

/// A single `from` prefix to `to` prefix substitution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

/// Ordered, internally synchronized rewrite table
#[derive(Debug, Default)]
pub struct RewriteTable {
    rules: RwLock<Vec<RewriteRule>>,
}

impl RewriteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, or replace the target of an existing prefix in place
    pub fn insert(&self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|rule| rule.from == from) {
            Some(rule) => rule.to = to,
            None => rules.push(RewriteRule { from, to }),
        }
    }

    /// Remove the rule for `from`, returning whether one existed
    pub fn remove(&self, from: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.from != from);
        rules.len() != before
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Copy of the current rules in match order
    pub fn rules(&self) -> Vec<RewriteRule> {
        self.rules.read().clone()
    }

    /// Rewrite `path` with the first matching rule
    ///
    /// Paths no rule matches come back untouched.
    pub fn apply(&self, path: &str) -> String {
        let rules = self.rules.read();
        rules
            .iter()
            .find(|rule| path.starts_with(rule.from.as_str()))
            .map(|rule| join_path(&rule.to, &path[rule.from.len()..]))
            .unwrap_or_else(|| path.to_string())
    }
}

/// Join a replacement prefix and the remainder of a path, then clean the result
///
/// The output is always rooted so it can be used as a request path.
pub fn join_path(prefix: &str, rest: &str) -> String {
    let joined = match (prefix.is_empty(), rest.is_empty()) {
        (true, true) => return DEFAULT_PATH.to_string(),
        (false, true) => prefix.to_string(),
        (true, false) => rest.to_string(),
        (false, false) => format!("{prefix}/{rest}"),
    };

    let cleaned = clean_path(&joined);
    if cleaned.starts_with('/') {
        cleaned
    } else if cleaned == "." {
        DEFAULT_PATH.to_string()
    } else {
        format!("/{cleaned}")
    }
}

/// Lexically normalize a slash separated path
///
/// Repeated slashes collapse, `.` segments vanish and `..` removes the
/// preceding segment. A rooted path never climbs above `/`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let body = segments.join("/");
    match (rooted, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}
