use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `ConfigVar::var_type` marking a value that comes from the global snapshot.
pub const TYPE_VARIABLE_GLOBAL: &str = "global";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Global variables supplied by the caller at render time, keyed by id.
pub type GlobalVars = HashMap<String, Variable>;

/// Resolved `name -> value` pairs available to `{{name}}` placeholders.
pub type TemplateVars = BTreeMap<String, String>;

/// A variable declared on a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVar {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub var_type: String,
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub example: String,
    #[serde(default)]
    pub secure: bool,
}

impl ConfigVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>, secure: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure,
            ..Default::default()
        }
    }

    pub fn is_global(&self) -> bool {
        self.var_type == TYPE_VARIABLE_GLOBAL
    }
}

/// A global variable. When `task_id` is set, its value is produced by running
/// `post_script` against the last response of that task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variable {
    pub id: String,
    pub name: String,
    pub uuid: String,
    pub task_id: String,
    pub task_var_name: String,
    pub value: String,
    pub secure: bool,
    pub post_script: String,
    pub updated_at: i64,
    pub owner_external_id: String,
}

/// Applies the global snapshot to a task's config vars.
#[derive(Debug, Clone, Copy)]
pub struct VariableResolver<'a> {
    globals: &'a GlobalVars,
}

impl<'a> VariableResolver<'a> {
    pub fn new(globals: &'a GlobalVars) -> Self {
        Self { globals }
    }

    /// Resolve every var in place and return the placeholder table.
    ///
    /// Global vars whose id is present in the snapshot take its value and secure
    /// flag. When two vars share a name the later one wins.
    pub fn resolve(&self, vars: &mut [ConfigVar]) -> TemplateVars {
        let mut resolved = TemplateVars::new();
        for var in vars.iter_mut() {
            if var.is_global() && !var.id.is_empty() {
                if let Some(global) = self.globals.get(&var.id) {
                    var.value = global.value.clone();
                    var.secure = global.secure;
                }
            }
            resolved.insert(var.name.clone(), var.value.clone());
        }
        resolved
    }
}

/// Replace `{{name}}` placeholders in `input`. Unknown names become empty.
pub fn render_str<'s>(input: &'s str, vars: &TemplateVars) -> Cow<'s, str> {
    if !input.contains("{{") {
        return Cow::Borrowed(input);
    }
    PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
}

/// Render every string leaf and object key of a JSON document.
pub fn render_value(value: &Value, vars: &TemplateVars) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, vars).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(item, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (render_str(key, vars).into_owned(), render_value(item, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_render_known_and_unknown_names() {
        let table = vars(&[("host", "example.com")]);
        assert_eq!(render_str("http://{{host}}/a", &table), "http://example.com/a");
        assert_eq!(render_str("http://{{ host }}/a", &table), "http://example.com/a");
        assert_eq!(render_str("x{{missing}}y", &table), "xy");
        assert_eq!(render_str("no placeholders", &table), "no placeholders");
    }

    #[test]
    fn test_render_value_keeps_document_valid() {
        let table = vars(&[("token", "a\"b"), ("key", "X-Token")]);
        let doc = json!({
            "url": "http://localhost/?t={{token}}",
            "headers": { "{{key}}": "{{token}}" },
            "retries": 3,
        });
        let rendered = render_value(&doc, &table);
        assert_eq!(rendered["url"], "http://localhost/?t=a\"b");
        assert_eq!(rendered["headers"]["X-Token"], "a\"b");
        assert_eq!(rendered["retries"], 3);
        assert!(serde_json::to_string(&rendered).is_ok());
    }

    #[test]
    fn test_global_overrides_literal() {
        let mut globals = GlobalVars::new();
        globals.insert(
            "g1".into(),
            Variable { id: "g1".into(), value: "from-global".into(), secure: true, ..Default::default() },
        );
        let mut config = vec![
            ConfigVar { id: "g1".into(), var_type: TYPE_VARIABLE_GLOBAL.into(), name: "a".into(), value: "literal".into(), ..Default::default() },
            ConfigVar { id: "g2".into(), var_type: TYPE_VARIABLE_GLOBAL.into(), name: "b".into(), value: "kept".into(), ..Default::default() },
            ConfigVar::literal("c", "plain", false),
        ];

        let table = VariableResolver::new(&globals).resolve(&mut config);

        assert_eq!(table["a"], "from-global");
        assert!(config[0].secure);
        assert_eq!(table["b"], "kept");
        assert_eq!(table["c"], "plain");
    }
}
