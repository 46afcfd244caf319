use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SelectorParseError {
    #[error("empty key in selector term {0:?}")]
    EmptyKey(String),

    #[error("empty value in selector term {0:?}")]
    EmptyValue(String),

    #[error("expected parenthesized value list in selector term {0:?}")]
    MissingValueList(String),

    #[error("malformed selector term {0:?}")]
    MalformedTerm(String),
}

/// A parsed Kubernetes label selector, evaluated client-side against a pod's
/// label set. The raw expression is retained for server-side list filtering.
///
/// Supports the standard grammar: `k=v`, `k==v`, `k!=v`, `k in (a,b)`,
/// `k notin (a,b)`, `k` (exists), `!k` (does not exist), comma-separated.
/// An empty expression matches everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Selector {
    /// Parse a selector expression. Immutable once parsed.
    pub fn parse(expression: &str) -> Result<Self, SelectorParseError> {
        let raw = expression.trim().to_string();
        let mut requirements = Vec::new();

        for term in split_terms(&raw) {
            let term = term.trim();
            if term.is_empty() {
                return Err(SelectorParseError::MalformedTerm(term.to_string()));
            }
            requirements.push(parse_term(term)?);
        }

        Ok(Self { raw, requirements })
    }

    /// Whether this selector matches everything.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// The raw expression, suitable for server-side `ListParams` filtering.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Evaluate the selector against a label set. Absent keys satisfy `!=`
    /// and `notin` requirements, matching server-side semantics.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
            Requirement::NotEquals(key, value) => labels.get(key) != Some(value),
            Requirement::In(key, values) => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::NotIn(key, values) => {
                labels.get(key).is_none_or(|v| !values.contains(v))
            }
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
        })
    }
}

impl FromStr for Selector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split on commas outside parentheses, so `k in (a,b)` stays one term.
fn split_terms(raw: &str) -> Vec<&str> {
    if raw.is_empty() {
        return Vec::new();
    }

    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&raw[start..]);
    terms
}

fn parse_term(term: &str) -> Result<Requirement, SelectorParseError> {
    if let Some((key, value)) = term.split_once("!=") {
        let (key, value) = (key.trim(), value.trim());
        validate_key(key, term)?;
        validate_value(value, term)?;
        return Ok(Requirement::NotEquals(key.to_string(), value.to_string()));
    }

    if let Some((key, rest)) = term.split_once(" notin ") {
        let key = key.trim();
        validate_key(key, term)?;
        return Ok(Requirement::NotIn(key.to_string(), parse_values(rest, term)?));
    }

    if let Some((key, rest)) = term.split_once(" in ") {
        let key = key.trim();
        validate_key(key, term)?;
        return Ok(Requirement::In(key.to_string(), parse_values(rest, term)?));
    }

    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        let (key, value) = (key.trim(), value.trim());
        validate_key(key, term)?;
        validate_value(value, term)?;
        return Ok(Requirement::Equals(key.to_string(), value.to_string()));
    }

    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        validate_key(key, term)?;
        return Ok(Requirement::DoesNotExist(key.to_string()));
    }

    validate_key(term, term)?;
    Ok(Requirement::Exists(term.to_string()))
}

fn parse_values(rest: &str, term: &str) -> Result<Vec<String>, SelectorParseError> {
    let rest = rest.trim();
    let Some(inner) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) else {
        return Err(SelectorParseError::MissingValueList(term.to_string()));
    };

    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .collect();

    if values.iter().any(String::is_empty) {
        return Err(SelectorParseError::EmptyValue(term.to_string()));
    }

    Ok(values)
}

fn validate_key(key: &str, term: &str) -> Result<(), SelectorParseError> {
    if key.is_empty() {
        return Err(SelectorParseError::EmptyKey(term.to_string()));
    }
    if key.contains([' ', '(', ')', ',', '!', '=']) {
        return Err(SelectorParseError::MalformedTerm(term.to_string()));
    }
    Ok(())
}

fn validate_value(value: &str, term: &str) -> Result<(), SelectorParseError> {
    if value.is_empty() {
        return Err(SelectorParseError::EmptyValue(term.to_string()));
    }
    if value.contains([' ', '(', ')', ',']) {
        return Err(SelectorParseError::MalformedTerm(term.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = Selector::parse("").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "nginx")])));
    }

    #[test]
    fn equality() {
        let selector = Selector::parse("app=nginx").unwrap();
        assert!(selector.matches(&labels(&[("app", "nginx")])));
        assert!(!selector.matches(&labels(&[("app", "redis")])));
        assert!(!selector.matches(&labels(&[])));

        let double = Selector::parse("app==nginx").unwrap();
        assert!(double.matches(&labels(&[("app", "nginx")])));
    }

    #[test]
    fn inequality_matches_absent_key() {
        let selector = Selector::parse("env!=qa").unwrap();
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("env", "qa")])));
    }

    #[test]
    fn set_operators() {
        let selector = Selector::parse("tier in (web, api)").unwrap();
        assert!(selector.matches(&labels(&[("tier", "web")])));
        assert!(selector.matches(&labels(&[("tier", "api")])));
        assert!(!selector.matches(&labels(&[("tier", "db")])));
        assert!(!selector.matches(&labels(&[])));

        let notin = Selector::parse("tier notin (web)").unwrap();
        assert!(notin.matches(&labels(&[("tier", "db")])));
        assert!(notin.matches(&labels(&[])));
        assert!(!notin.matches(&labels(&[("tier", "web")])));
    }

    #[test]
    fn existence_operators() {
        let exists = Selector::parse("app").unwrap();
        assert!(exists.matches(&labels(&[("app", "anything")])));
        assert!(!exists.matches(&labels(&[])));

        let not_exists = Selector::parse("!app").unwrap();
        assert!(not_exists.matches(&labels(&[])));
        assert!(!not_exists.matches(&labels(&[("app", "nginx")])));
    }

    #[test]
    fn conjunction() {
        let selector = Selector::parse("app=nginx,tier in (web,api),!legacy").unwrap();
        assert!(selector.matches(&labels(&[("app", "nginx"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("app", "nginx"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[
            ("app", "nginx"),
            ("tier", "web"),
            ("legacy", "true")
        ])));
    }

    #[test]
    fn malformed_selectors_error() {
        assert!(Selector::parse("=nginx").is_err());
        assert!(Selector::parse("app=").is_err());
        assert!(Selector::parse("app=nginx,").is_err());
        assert!(Selector::parse("tier in web").is_err());
        assert!(Selector::parse("tier in ()").is_err());
        assert!(Selector::parse("!").is_err());
    }

    #[test]
    fn matching_is_deterministic() {
        let selector = Selector::parse("app=nginx,env!=qa").unwrap();
        let set = labels(&[("app", "nginx"), ("env", "prod")]);
        let first = selector.matches(&set);
        for _ in 0..10 {
            assert_eq!(selector.matches(&set), first);
        }
    }

    #[test]
    fn raw_expression_preserved() {
        let selector = Selector::parse("app=nginx,tier in (web,api)").unwrap();
        assert_eq!(selector.as_str(), "app=nginx,tier in (web,api)");
    }
}
