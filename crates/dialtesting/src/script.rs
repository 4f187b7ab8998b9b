//! Sandbox for HTTP post-scripts.
//!
//! Scripts are Rhai. Each invocation sees two variables: `response` (status
//! code, headers, body of the probed response) and `api`, through which the
//! script marks the probe as failed or exports values:
//!
//! ```text
//! let body = parse_json(response.body);
//! if response.statusCode != 200 { api.fail("unexpected status"); }
//! api.setValue("token", body.token);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;

/// Response data exposed to a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHttpResponse {
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptApiContent {
    pub values: BTreeMap<String, String>,
    pub is_failed: bool,
    pub error_message: String,
}

/// State read back from the sandbox after a script ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub response: ScriptHttpResponse,
    pub api: ScriptApiContent,
}

#[derive(Debug, Clone)]
struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    fn lookup(&mut self, name: ImmutableString) -> Dynamic {
        match self.0.get(name.as_str()) {
            Some(values) => {
                let values: Array = values.iter().cloned().map(Dynamic::from).collect();
                Dynamic::from_array(values)
            }
            None => Dynamic::UNIT,
        }
    }
}

#[derive(Debug, Clone)]
struct Response {
    status_code: i64,
    headers: Headers,
    body: ImmutableString,
}

#[derive(Debug, Clone, Default)]
struct Api {
    values: Map,
    is_failed: bool,
    error_message: String,
}

impl Api {
    fn fail(&mut self, message: Dynamic) {
        self.is_failed = true;
        self.error_message = message.to_string();
    }

    fn set_value(&mut self, key: ImmutableString, value: Dynamic) {
        self.values.insert(key.as_str().into(), value);
    }

    fn get_value(&mut self, key: ImmutableString) -> Dynamic {
        self.values.get(key.as_str()).cloned().unwrap_or(Dynamic::UNIT)
    }

    fn into_content(self) -> ScriptApiContent {
        ScriptApiContent {
            values: self
                .values
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            is_failed: self.is_failed,
            error_message: self.error_message,
        }
    }
}

/// Shared, read-only Rhai engine. Every call gets a fresh scope.
#[derive(Clone)]
pub struct ScriptEngine {
    engine: Arc<Engine>,
}

impl ScriptEngine {
    pub fn new(max_operations: u64) -> Self {
        Self { engine: Arc::new(build_engine(max_operations)) }
    }

    /// Run `script` against a response.
    ///
    /// Returns `Ok(None)` when there is nothing to run. Compile and runtime
    /// errors do not escape: they are recorded as `api.fail(message)`.
    pub fn run(
        &self,
        script: &str,
        body: &[u8],
        response: Option<&ResponseSnapshot>,
    ) -> Result<Option<ScriptResult>> {
        let Some(response) = response else {
            return Ok(None);
        };
        if script.is_empty() {
            return Ok(None);
        }

        let original = Response {
            status_code: i64::from(response.status_code),
            headers: Headers(response.headers.clone()),
            body: String::from_utf8_lossy(body).into_owned().into(),
        };

        let mut scope = Scope::new();
        scope.push("response", original.clone());
        scope.push("api", Api::default());

        let outcome = self.execute(&mut scope, script);

        let mut api = scope.get_value::<Api>("api").unwrap_or_default();
        if let Err(message) = outcome {
            debug!(error = %message, "post script failed");
            api.fail(message.into());
        }
        let response = scope.get_value::<Response>("response").unwrap_or(original);

        Ok(Some(ScriptResult {
            response: ScriptHttpResponse {
                headers: response.headers.0,
                body: response.body.to_string(),
                status_code: u16::try_from(response.status_code).unwrap_or_default(),
            },
            api: api.into_content(),
        }))
    }

    fn execute(&self, scope: &mut Scope<'_>, script: &str) -> std::result::Result<(), String> {
        let ast = self.engine.compile(script).map_err(|err| err.to_string())?;
        self.engine
            .run_ast_with_scope(scope, &ast)
            .map_err(|err| failure_message(&err))
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine").finish_non_exhaustive()
    }
}

fn failure_message(err: &EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => b.into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) => s.into(),
        Value::Array(items) => Dynamic::from_array(items.into_iter().map(json_to_dynamic).collect()),
        Value::Object(map) => Dynamic::from_map(
            map.into_iter()
                .map(|(key, item)| (key.into(), json_to_dynamic(item)))
                .collect(),
        ),
    }
}

fn parse_json(text: ImmutableString) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
    serde_json::from_str(&text)
        .map(json_to_dynamic)
        .map_err(|err| format!("invalid JSON: {err}").into())
}

fn build_engine(max_operations: u64) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_call_levels(32);

    engine.on_print(|text| debug!(target: "dialtesting::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "dialtesting::script", source = source.unwrap_or_default(), %pos, "{text}")
    });

    engine.register_fn("parse_json", parse_json);

    engine
        .register_type_with_name::<Response>("Response")
        .register_get("statusCode", |r: &mut Response| r.status_code)
        .register_get("status_code", |r: &mut Response| r.status_code)
        .register_get("body", |r: &mut Response| r.body.clone())
        .register_get("headers", |r: &mut Response| r.headers.clone())
        .register_fn("getStatusCode", |r: &mut Response| r.status_code)
        .register_fn("getResponseBody", |r: &mut Response| r.body.clone())
        .register_fn("getHeaders", |r: &mut Response| r.headers.clone());

    engine
        .register_type_with_name::<Headers>("Headers")
        .register_indexer_get(Headers::lookup)
        .register_fn("get", Headers::lookup);

    engine
        .register_type_with_name::<Api>("Api")
        .register_fn("fail", Api::fail)
        .register_fn("setValue", Api::set_value)
        .register_fn("getValue", Api::get_value)
        .register_fn("getValues", |api: &mut Api| api.values.clone())
        .register_get_set(
            "values",
            |api: &mut Api| api.values.clone(),
            |api: &mut Api, values: Map| api.values = values,
        )
        .register_get("is_failed", |api: &mut Api| api.is_failed)
        .register_get("error_message", |api: &mut Api| api.error_message.clone());

    engine
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ResponseSnapshot {
        let mut headers = BTreeMap::new();
        headers.insert("header1".to_string(), vec!["value1".to_string()]);
        headers.insert("Set-Cookie".to_string(), vec!["a=1".to_string(), "b=2".to_string()]);
        ResponseSnapshot { status_code: 200, headers }
    }

    fn run(script: &str, body: &str) -> ScriptResult {
        ScriptEngine::new(100_000)
            .run(script, body.as_bytes(), Some(&snapshot()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_nothing_to_run() {
        let engine = ScriptEngine::new(1000);
        assert!(engine.run("", b"{}", Some(&snapshot())).unwrap().is_none());
        assert!(engine.run("api.fail(\"x\")", b"{}", None).unwrap().is_none());
    }

    #[test]
    fn test_fail_records_message() {
        let result = run(r#"api.fail("x");"#, "");
        assert!(result.api.is_failed);
        assert_eq!(result.api.error_message, "x");
    }

    #[test]
    fn test_thrown_value_becomes_failure() {
        let result = run(r#"throw "error";"#, "");
        assert!(result.api.is_failed);
        assert_eq!(result.api.error_message, "error");
    }

    #[test]
    fn test_runtime_error_is_captured() {
        let result = run("response.xxxxxx = xxxxxx;", "");
        assert!(result.api.is_failed);
        assert!(!result.api.error_message.is_empty());
    }

    #[test]
    fn test_syntax_error_is_captured() {
        let result = run("let = ;", "");
        assert!(result.api.is_failed);
    }

    #[test]
    fn test_expression_script_is_not_a_failure() {
        let result = run("1", "hello");
        assert!(!result.api.is_failed);
        assert!(result.api.values.is_empty());
        assert_eq!(result.response.body, "hello");
        assert_eq!(result.response.status_code, 200);
    }

    #[test]
    fn test_response_accessors() {
        let script = r#"
            if response.statusCode != 200 || response.getStatusCode() != 200 {
                api.fail("status");
            }
            let cookies = response.headers["Set-Cookie"];
            api.setValue("cookies", cookies.len());
            api.setValue("h1", response.headers.get("header1")[0]);
            if response.headers["header-missing"] != () {
                api.fail("missing header should be unit");
            }
            let body = parse_json(response.getResponseBody());
            api.setValue("token", body.token);
        "#;
        let result = run(script, r#"{"token":"tkn_123"}"#);
        assert!(!result.api.is_failed, "{}", result.api.error_message);
        assert_eq!(result.api.values["cookies"], "2");
        assert_eq!(result.api.values["h1"], "value1");
        assert_eq!(result.api.values["token"], "tkn_123");
    }

    #[test]
    fn test_values_property_and_get_value() {
        let script = r#"
            api.values = #{ "a": "1" };
            api.setValue("b", "2");
            if api.getValue("a") != "1" { api.fail("a"); }
            if api.getValues().len() != 2 { api.fail("len"); }
        "#;
        let result = run(script, "");
        assert!(!result.api.is_failed, "{}", result.api.error_message);
        assert_eq!(result.api.values.len(), 2);
    }

    #[test]
    fn test_runaway_script_is_bounded() {
        let result = ScriptEngine::new(10_000)
            .run("loop { }", b"", Some(&snapshot()))
            .unwrap()
            .unwrap();
        assert!(result.api.is_failed);
    }

    #[test]
    fn test_parse_json_failure_is_recorded() {
        let result = run("let v = parse_json(response.body);", "not json");
        assert!(result.api.is_failed);
        assert!(result.api.error_message.starts_with("invalid JSON"));
    }

    #[test]
    fn test_result_serializes_status_code_in_camel_case() {
        let result = run("1", "");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["response"]["statusCode"], 200);
        assert_eq!(json["api"]["is_failed"], false);
    }
}
