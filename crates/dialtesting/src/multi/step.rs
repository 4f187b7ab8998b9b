use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::task::Fields;

pub const STEP_TYPE_HTTP: &str = "http";
pub const STEP_TYPE_WAIT: &str = "wait";

/// Retry policy of an http step: `retry` extra attempts, `interval` ms apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiStepRetry {
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub interval: u64,
}

/// A value a step exports for the steps after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiExtractedVar {
    pub name: String,
    /// Outcome field the value is taken from. Post-script values are keyed by
    /// `name`; `field` is only consulted when no value carries that name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl MultiExtractedVar {
    /// Pick this variable's value out of a step's post-script values.
    pub fn lookup<'v>(&self, values: &'v BTreeMap<String, String>) -> Option<&'v String> {
        values
            .get(&self.name)
            .or_else(|| if self.field.is_empty() { None } else { values.get(&self.field) })
    }

    /// Copy fit for reports: secure values are dropped.
    pub(crate) fn redacted(&self) -> Self {
        let mut var = self.clone();
        if var.secure {
            var.value.clear();
        }
        var
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiStep {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<MultiStepRetry>,
    /// Inner HTTP task definition, JSON encoded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task: String,
    /// Seconds to sleep for a wait step.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub value: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted_vars: Vec<MultiExtractedVar>,

    #[serde(skip)]
    pub(crate) result: Option<Fields>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl MultiStep {
    pub fn result(&self) -> Option<&Fields> {
        self.result.as_ref()
    }

    pub fn is_http(&self) -> bool {
        self.step_type == STEP_TYPE_HTTP
    }

    pub(crate) fn reset(&mut self) {
        self.result = None;
        for var in &mut self.extracted_vars {
            var.value.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_prefers_name() {
        let values: BTreeMap<String, String> =
            [("token".to_string(), "abc".to_string()), ("body".to_string(), "raw".to_string())].into();

        let var = MultiExtractedVar { name: "token".into(), field: "body".into(), ..Default::default() };
        assert_eq!(var.lookup(&values).map(String::as_str), Some("abc"));

        let var = MultiExtractedVar { name: "session".into(), field: "body".into(), ..Default::default() };
        assert_eq!(var.lookup(&values).map(String::as_str), Some("raw"));

        let var = MultiExtractedVar { name: "session".into(), ..Default::default() };
        assert_eq!(var.lookup(&values), None);
    }

    #[test]
    fn test_secure_value_is_redacted() {
        let var = MultiExtractedVar { name: "t".into(), secure: true, value: "abc".into(), ..Default::default() };
        assert!(var.redacted().value.is_empty());
        assert!(!serde_json::to_string(&var.redacted()).unwrap().contains("abc"));
        let var = MultiExtractedVar { name: "t".into(), value: "abc".into(), ..Default::default() };
        assert_eq!(var.redacted().value, "abc");
    }

    #[test]
    fn test_step_decoding() {
        let step: MultiStep = serde_json::from_str(
            r#"{"type":"http","allow_failure":true,"retry":{"retry":2,"interval":10},"task":"{}"}"#,
        )
        .unwrap();
        assert!(step.is_http());
        assert!(step.allow_failure);
        assert_eq!(step.retry, Some(MultiStepRetry { retry: 2, interval: 10 }));
    }
}
