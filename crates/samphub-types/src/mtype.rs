//! MType patterns and subscription tables.
//!
//! An MType is a dot-separated name such as `samp.app.echo`. Clients subscribe
//! with patterns: an exact MType, a `prefix.*` wildcard, or the bare `*` that
//! matches everything. When several patterns of one client match a concrete
//! MType, the most specific one decides which handler kind applies.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MTypePattern {
    raw: String,
}

impl MTypePattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: &str) -> HubResult<Self> {
        if pattern == "*" {
            return Ok(Self { raw: pattern.to_string() });
        }
        let literal = pattern.strip_suffix(".*").unwrap_or(pattern);
        validate_segments(literal).map_err(|reason| {
            HubError::Protocol(format!("invalid MType pattern '{pattern}': {reason}"))
        })?;
        Ok(Self { raw: pattern.to_string() })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern ends in a wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.raw == "*" || self.raw.ends_with(".*")
    }

    /// Whether this pattern matches the concrete MType.
    pub fn matches(&self, mtype: &str) -> bool {
        if self.raw == "*" {
            return true;
        }
        match self.raw.strip_suffix('*') {
            // `prefix` keeps its trailing dot, so `a.b.*` never matches `a.b`
            Some(prefix) => mtype.len() > prefix.len() && mtype.starts_with(prefix),
            None => self.raw == mtype,
        }
    }

    /// Ordering key: more literal segments first, exact beats wildcard.
    pub fn specificity(&self) -> (usize, bool) {
        if self.raw == "*" {
            return (0, false);
        }
        let literal = self.raw.strip_suffix(".*").unwrap_or(&self.raw);
        (literal.split('.').count(), !self.is_wildcard())
    }
}

impl TryFrom<String> for MTypePattern {
    type Error = HubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MTypePattern> for String {
    fn from(p: MTypePattern) -> Self {
        p.raw
    }
}

impl std::fmt::Display for MTypePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete (non-wildcard) MType.
pub fn validate_mtype(mtype: &str) -> HubResult<()> {
    validate_segments(mtype)
        .map_err(|reason| HubError::Protocol(format!("invalid MType '{mtype}': {reason}")))
}

fn validate_segments(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err("empty segment");
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("segments may only contain [A-Za-z0-9_-]");
        }
    }
    Ok(())
}

/// The role a delivered message plays for its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Notification,
    Call,
}

/// What a subscribed client is prepared to receive for a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Subscribed (visible to `get_subscribed_clients`) but nothing bound.
    #[default]
    None,
    Notification,
    Call,
    /// Both a notification and a call handler are bound.
    Both,
}

impl HandlerKind {
    /// Whether a handler of this kind can take a message in `role`.
    pub fn accepts(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Self::Both, _)
                | (Self::Notification, Role::Notification)
                | (Self::Call, Role::Call)
        )
    }

    /// Combine two bindings on the same pattern.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::None, x) | (x, Self::None) => x,
            _ => Self::Both,
        }
    }
}

impl From<Role> for HandlerKind {
    fn from(role: Role) -> Self {
        match role {
            Role::Notification => Self::Notification,
            Role::Call => Self::Call,
        }
    }
}

/// A client's declared subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionTable {
    entries: BTreeMap<MTypePattern, HandlerKind>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the kind bound to `pattern`.
    pub fn insert(&mut self, pattern: MTypePattern, kind: HandlerKind) {
        self.entries.insert(pattern, kind);
    }

    /// Merge `kind` into whatever is already bound to `pattern`.
    pub fn add(&mut self, pattern: MTypePattern, kind: HandlerKind) {
        let entry = self.entries.entry(pattern).or_default();
        *entry = entry.merge(kind);
    }

    pub fn remove(&mut self, pattern: &MTypePattern) -> Option<HandlerKind> {
        self.entries.remove(pattern)
    }

    pub fn get(&self, pattern: &MTypePattern) -> Option<HandlerKind> {
        self.entries.get(pattern).copied()
    }

    /// The most specific pattern matching `mtype`, with its handler kind.
    pub fn best_match(&self, mtype: &str) -> Option<(&MTypePattern, HandlerKind)> {
        self.entries
            .iter()
            .filter(|(pattern, _)| pattern.matches(mtype))
            .max_by_key(|(pattern, _)| pattern.specificity())
            .map(|(pattern, kind)| (pattern, *kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MTypePattern, HandlerKind)> {
        self.entries.iter().map(|(p, k)| (p, *k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(MTypePattern, HandlerKind)> for SubscriptionTable {
    fn from_iter<I: IntoIterator<Item = (MTypePattern, HandlerKind)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (pattern, kind) in iter {
            table.add(pattern, kind);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> MTypePattern {
        MTypePattern::parse(s).unwrap()
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(p("a.b.*").matches("a.b.c"));
        assert!(p("a.b.*").matches("a.b.c.d"));
        assert!(!p("a.b.*").matches("a.b"));
        assert!(!p("a.b.*").matches("a.bc"));
        assert!(p("a.*").matches("a.b"));
        assert!(p("a.*").matches("a.b.c"));
        assert!(p("*").matches("anything.at.all"));
    }

    #[test]
    fn test_exact_matching() {
        assert!(p("samp.test").matches("samp.test"));
        assert!(!p("samp.test").matches("samp.test.more"));
        assert!(!p("samp.test").matches("samp"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for bad in ["", "a..b", ".a", "a.*.b", "a*", "a.b.", "sp ace", "**"] {
            assert!(
                matches!(MTypePattern::parse(bad), Err(HubError::Protocol(_))),
                "pattern {bad:?} should be rejected"
            );
        }
        assert!(validate_mtype("samp.app.*").is_err());
        assert!(validate_mtype("samp.app.echo").is_ok());
    }

    #[test]
    fn test_longest_pattern_wins() {
        let mut table = SubscriptionTable::new();
        table.insert(p("samp.*"), HandlerKind::Notification);
        table.insert(p("samp.app.*"), HandlerKind::Call);
        table.insert(p("*"), HandlerKind::Both);

        let (pattern, kind) = table.best_match("samp.app.echo").unwrap();
        assert_eq!(pattern.as_str(), "samp.app.*");
        assert_eq!(kind, HandlerKind::Call);

        let (pattern, _) = table.best_match("samp.hub.event.register").unwrap();
        assert_eq!(pattern.as_str(), "samp.*");

        let (pattern, _) = table.best_match("other").unwrap();
        assert_eq!(pattern.as_str(), "*");
    }

    #[test]
    fn test_exact_beats_wildcard_of_same_depth() {
        let mut table = SubscriptionTable::new();
        table.insert(p("samp.app.*"), HandlerKind::Notification);
        table.insert(p("samp.app"), HandlerKind::Call);
        table.insert(p("samp.app.echo"), HandlerKind::Call);
        let (pattern, _) = table.best_match("samp.app.echo").unwrap();
        assert_eq!(pattern.as_str(), "samp.app.echo");
    }

    #[test]
    fn test_no_match() {
        let mut table = SubscriptionTable::new();
        table.insert(p("x.*"), HandlerKind::Both);
        assert!(table.best_match("samp.app.echo").is_none());
    }

    #[test]
    fn test_handler_kind_merge_and_accepts() {
        let kind = HandlerKind::Notification.merge(HandlerKind::Call);
        assert_eq!(kind, HandlerKind::Both);
        assert!(kind.accepts(Role::Call));
        assert_eq!(HandlerKind::None.merge(HandlerKind::Call), HandlerKind::Call);
        assert!(!HandlerKind::Notification.accepts(Role::Call));
        assert!(!HandlerKind::None.accepts(Role::Notification));
    }

    #[test]
    fn test_table_add_merges() {
        let mut table = SubscriptionTable::new();
        table.add(p("samp.app.*"), HandlerKind::Notification);
        table.add(p("samp.app.*"), HandlerKind::Call);
        assert_eq!(table.get(&p("samp.app.*")), Some(HandlerKind::Both));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_serializes_as_map() {
        let mut table = SubscriptionTable::new();
        table.insert(p("samp.app.*"), HandlerKind::Call);
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["samp.app.*"], "call");

        let back: SubscriptionTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);

        let bad = serde_json::json!({"a..b": "call"});
        assert!(serde_json::from_value::<SubscriptionTable>(bad).is_err());
    }
}
