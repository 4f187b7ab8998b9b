//! Success criteria shared by the task variants.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DialError, Result};
use crate::task::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Leq,
    Gt,
    Geq,
    Eq,
}

impl CompareOp {
    pub fn holds(self, actual: f64, target: f64) -> bool {
        match self {
            CompareOp::Lt => actual < target,
            CompareOp::Leq => actual <= target,
            CompareOp::Gt => actual > target,
            CompareOp::Geq => actual >= target,
            CompareOp::Eq => (actual - target).abs() < f64::EPSILON,
        }
    }
}

impl FromStr for CompareOp {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "lt" => Ok(CompareOp::Lt),
            "leq" | "le" => Ok(CompareOp::Leq),
            "gt" => Ok(CompareOp::Gt),
            "geq" | "ge" => Ok(CompareOp::Geq),
            "eq" => Ok(CompareOp::Eq),
            other => Err(DialError::config(format!("unknown comparison operator {other:?}"))),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Lt => "<",
            CompareOp::Leq => "<=",
            CompareOp::Gt => ">",
            CompareOp::Geq => ">=",
            CompareOp::Eq => "==",
        };
        f.write_str(symbol)
    }
}

/// Aggregate applied to a set of round-trip times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttFunc {
    Avg,
    Min,
    Max,
    Std,
}

impl FromStr for RttFunc {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "avg" => Ok(RttFunc::Avg),
            "min" => Ok(RttFunc::Min),
            "max" => Ok(RttFunc::Max),
            "std" => Ok(RttFunc::Std),
            other => Err(DialError::config(format!("unknown response time function {other:?}"))),
        }
    }
}

impl fmt::Display for RttFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RttFunc::Avg => "avg",
            RttFunc::Min => "min",
            RttFunc::Max => "max",
            RttFunc::Std => "std",
        })
    }
}

/// A response time threshold, e.g. `{"func": "avg", "op": "lt", "target": "50ms"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTimeTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub func: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
    pub target: String,
}

impl ResponseTimeTarget {
    pub fn validate(&self) -> Result<()> {
        self.func.parse::<RttFunc>()?;
        self.op.parse::<CompareOp>()?;
        self.target_duration()?;
        Ok(())
    }

    pub fn target_duration(&self) -> Result<Duration> {
        parse_duration(&self.target)
    }

    /// Returns a failure reason when `actual` does not satisfy the threshold.
    pub fn evaluate(&self, actual: Duration) -> Option<String> {
        let (op, target) = match (self.op.parse::<CompareOp>(), self.target_duration()) {
            (Ok(op), Ok(target)) => (op, target),
            _ => return Some(format!("invalid response time criterion {:?}", self.target)),
        };
        let actual_ms = actual.as_secs_f64() * 1000.0;
        let target_ms = target.as_secs_f64() * 1000.0;
        if op.holds(actual_ms, target_ms) {
            None
        } else {
            Some(format!(
                "response time {actual_ms:.3}ms does not satisfy {op} {}",
                self.target
            ))
        }
    }
}

/// A plain numeric threshold, e.g. packet loss percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueTarget {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
    pub target: f64,
}

impl ValueTarget {
    pub fn validate(&self) -> Result<()> {
        self.op.parse::<CompareOp>().map(|_| ())
    }

    pub fn evaluate(&self, subject: &str, actual: f64) -> Option<String> {
        let Ok(op) = self.op.parse::<CompareOp>() else {
            return Some(format!("invalid {subject} criterion operator {:?}", self.op));
        };
        if op.holds(actual, self.target) {
            None
        } else {
            Some(format!("{subject} {actual} does not satisfy {op} {}", self.target))
        }
    }
}

/// A regex criterion, compiled on first use and kept for later evaluations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern {
    source: String,
    #[serde(skip)]
    compiled: OnceCell<std::result::Result<Regex, String>>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into(), compiled: OnceCell::new() }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn regex(&self) -> std::result::Result<&Regex, &str> {
        self.compiled
            .get_or_init(|| Regex::new(&self.source).map_err(|err| err.to_string()))
            .as_ref()
            .map_err(String::as_str)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Pattern {}

impl From<&str> for Pattern {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for Pattern {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

/// String criterion applied to a status code, body or header value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_not: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_regex: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_match_regex: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_contains: Option<String>,
}

impl StringMatcher {
    pub fn validate(&self) -> Result<()> {
        for pattern in [&self.match_regex, &self.not_match_regex].into_iter().flatten() {
            pattern
                .regex()
                .map_err(|err| DialError::config(format!("invalid regex {:?}: {err}", pattern.as_str())))?;
        }
        Ok(())
    }

    /// Returns a failure reason when `value` does not meet the criterion.
    pub fn evaluate(&self, subject: &str, value: &str) -> Option<String> {
        if let Some(expected) = &self.is {
            if value != expected {
                return Some(format!("{subject} {value:?} is not {expected:?}"));
            }
        }
        if let Some(unexpected) = &self.is_not {
            if value == unexpected {
                return Some(format!("{subject} {value:?} should not be {unexpected:?}"));
            }
        }
        if let Some(pattern) = &self.match_regex {
            let source = pattern.as_str();
            match pattern.regex() {
                Ok(re) if re.is_match(value) => {}
                Ok(_) => return Some(format!("{subject} does not match {source:?}")),
                Err(err) => return Some(format!("invalid regex {source:?}: {err}")),
            }
        }
        if let Some(pattern) = &self.not_match_regex {
            let source = pattern.as_str();
            match pattern.regex() {
                Ok(re) if !re.is_match(value) => {}
                Ok(_) => return Some(format!("{subject} should not match {source:?}")),
                Err(err) => return Some(format!("invalid regex {source:?}: {err}")),
            }
        }
        if let Some(needle) = &self.contains {
            if !value.contains(needle.as_str()) {
                return Some(format!("{subject} does not contain {needle:?}"));
            }
        }
        if let Some(needle) = &self.not_contains {
            if value.contains(needle.as_str()) {
                return Some(format!("{subject} should not contain {needle:?}"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_matcher() {
        let matcher = StringMatcher { is: Some("200".into()), ..Default::default() };
        assert!(matcher.evaluate("status code", "200").is_none());
        assert!(matcher.evaluate("status code", "404").is_some());

        let matcher = StringMatcher { match_regex: Some("^2\\d\\d$".into()), ..Default::default() };
        assert!(matcher.evaluate("status code", "204").is_none());
        assert!(matcher.evaluate("status code", "500").is_some());

        let matcher = StringMatcher { not_contains: Some("error".into()), ..Default::default() };
        assert!(matcher.evaluate("body", "all fine").is_none());
        assert!(matcher.evaluate("body", "an error occurred").is_some());
    }

    #[test]
    fn test_pattern_is_compiled_once() {
        let matcher: StringMatcher = serde_json::from_str(r#"{"match_regex":"^ok"}"#).unwrap();
        let pattern = matcher.match_regex.as_ref().unwrap();
        assert!(pattern.compiled.get().is_none());

        assert!(matcher.evaluate("body", "ok then").is_none());
        let first = pattern.regex().unwrap() as *const Regex;
        assert!(matcher.evaluate("body", "not ok").is_some());
        assert_eq!(pattern.regex().unwrap() as *const Regex, first);

        assert_eq!(serde_json::to_string(&matcher).unwrap(), r#"{"match_regex":"^ok"}"#);
    }

    #[test]
    fn test_invalid_regex_fails_validation() {
        let matcher = StringMatcher { match_regex: Some("(".into()), ..Default::default() };
        assert!(matcher.validate().is_err());
    }

    #[test]
    fn test_response_time_target() {
        let target = ResponseTimeTarget { target: "100ms".into(), ..Default::default() };
        assert!(target.evaluate(Duration::from_millis(20)).is_none());
        assert!(target.evaluate(Duration::from_millis(150)).is_some());

        let target = ResponseTimeTarget { func: "max".into(), op: "geq".into(), target: "1s".into() };
        assert!(target.validate().is_ok());
        assert!(target.evaluate(Duration::from_secs(2)).is_none());

        let bad = ResponseTimeTarget { func: "median".into(), target: "1s".into(), ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_value_target() {
        let loss = ValueTarget { op: "leq".into(), target: 10.0 };
        assert!(loss.evaluate("packet loss", 0.0).is_none());
        assert!(loss.evaluate("packet loss", 33.3).is_some());
    }
}
