use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::context::ProbeContext;
use crate::criteria::{ResponseTimeTarget, StringMatcher};
use crate::error::{DialError, Result};
use crate::script::{ResponseSnapshot, ScriptResult};
use crate::task::{Fields, Probe, RunContext, TaskClass, TaskMeta, Tags, Variable, base_tags, parse_duration, status_of};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("dialtesting/", env!("CARGO_PKG_VERSION"));
/// Largest response body echoed back in a failure message.
const MAX_MESSAGE_BODY: usize = 10 * 1024;
const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

fn default_method() -> String {
    "GET".to_string()
}

/// One set of conditions a response must meet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSuccess {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status_code: Vec<StringMatcher>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<StringMatcher>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, Vec<StringMatcher>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<ResponseTimeTarget>,
}

impl HttpSuccess {
    fn validate(&self) -> Result<()> {
        self.status_code
            .iter()
            .chain(&self.body)
            .chain(self.header.values().flatten())
            .try_for_each(StringMatcher::validate)?;
        if let Some(rt) = &self.response_time {
            rt.validate()?;
        }
        Ok(())
    }

    fn evaluate(&self, response: &HttpOutcome, elapsed: Duration) -> Vec<String> {
        let status = response.status.to_string();
        let body = String::from_utf8_lossy(&response.body);
        let mut reasons: Vec<String> = self
            .status_code
            .iter()
            .filter_map(|m| m.evaluate("status code", &status))
            .chain(self.body.iter().filter_map(|m| m.evaluate("body", &body)))
            .collect();

        for (name, matchers) in &self.header {
            let value = response
                .headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, values)| values.join(","))
                .unwrap_or_default();
            let subject = format!("header {name}");
            reasons.extend(matchers.iter().filter_map(|m| m.evaluate(&subject, &value)));
        }

        if let Some(rt) = &self.response_time {
            reasons.extend(rt.evaluate(elapsed));
        }
        reasons
    }
}

/// What came back from the last request.
#[derive(Debug, Clone, Default)]
struct HttpOutcome {
    status: u16,
    reason: String,
    version: String,
    headers: BTreeMap<String, Vec<String>>,
    body: Vec<u8>,
}

impl HttpOutcome {
    fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot { status_code: self.status, headers: self.headers.clone() }
    }
}

/// Request a URL and judge the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpTask {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub post_script: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_when: Vec<HttpSuccess>,
    /// `and` (default): every entry must hold; `or`: one is enough.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub success_when_logic: String,

    #[serde(skip)]
    client: Option<Client>,
    #[serde(skip)]
    outcome: Option<HttpOutcome>,
    #[serde(skip)]
    request_error: Option<String>,
    #[serde(skip)]
    post_script_result: Option<ScriptResult>,
    #[serde(skip)]
    elapsed: Duration,
}

impl HttpTask {
    pub fn post_script_result(&self) -> Option<&ScriptResult> {
        self.post_script_result.as_ref()
    }

    fn timeout_duration(&self) -> Result<Duration> {
        if self.timeout.is_empty() { Ok(DEFAULT_TIMEOUT) } else { parse_duration(&self.timeout) }
    }

    fn build_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .timeout(self.timeout_duration()?)
            .user_agent(USER_AGENT)
            .build()?)
    }

    fn criteria_reasons(&self, outcome: &HttpOutcome) -> Vec<String> {
        let per_entry: Vec<Vec<String>> = self
            .success_when
            .iter()
            .map(|success| success.evaluate(outcome, self.elapsed))
            .collect();

        if self.success_when_logic.eq_ignore_ascii_case("or") && per_entry.iter().any(Vec::is_empty) {
            return Vec::new();
        }
        per_entry.into_iter().flatten().collect()
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        collected
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    collected
}

fn status_class(status: u16) -> String {
    format!("{}xx", status / 100)
}

#[async_trait]
impl Probe for HttpTask {
    fn class(&self) -> TaskClass {
        TaskClass::Http
    }

    fn metric_name(&self) -> &'static str {
        "http_dial_testing"
    }

    fn check(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(DialError::config("url should not be empty"));
        }
        // templated URLs are validated once rendered
        if !self.url.contains("{{") {
            let url = Url::parse(&self.url)
                .map_err(|err| DialError::config(format!("invalid url {:?}: {err}", self.url)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DialError::config(format!("unsupported url scheme {:?}", url.scheme())));
            }
        }
        let method = self.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(DialError::config(format!("unsupported http method {:?}", self.method)));
        }
        if !self.timeout.is_empty() {
            parse_duration(&self.timeout)?;
        }
        self.success_when.iter().try_for_each(HttpSuccess::validate)
    }

    fn init(&mut self) -> Result<()> {
        self.client = Some(self.build_client()?);
        Ok(())
    }

    async fn run(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        let client = match &self.client {
            Some(client) => client.clone(),
            None => self.build_client()?,
        };
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| DialError::config(format!("unsupported http method {:?}", self.method)))?;

        let mut request = client.request(method, &self.url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if !self.body.is_empty() {
            request = request.body(self.body.clone());
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                self.elapsed = start.elapsed();
                warn!(url = %self.url, error = %err, "http request failed");
                self.request_error = Some(err.to_string());
                return Err(DialError::Http(err));
            }
        };

        let status = response.status();
        let mut outcome = HttpOutcome {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            version: format!("{:?}", response.version()),
            headers: collect_headers(response.headers()),
            body: Vec::new(),
        };
        let body = response.bytes().await;
        self.elapsed = start.elapsed();
        match body {
            Ok(bytes) => outcome.body = bytes.to_vec(),
            Err(err) => {
                self.request_error = Some(format!("failed to read response body: {err}"));
                self.outcome = Some(outcome);
                return Err(DialError::Http(err));
            }
        }
        debug!(url = %self.url, status = outcome.status, elapsed = ?self.elapsed, "http request finished");

        self.post_script_result = ctx
            .probe
            .scripts()
            .run(&self.post_script, &outcome.body, Some(&outcome.snapshot()))?;
        self.outcome = Some(outcome);
        Ok(())
    }

    fn clear(&mut self) {
        self.outcome = None;
        self.request_error = None;
        self.post_script_result = None;
        self.elapsed = Duration::ZERO;
    }

    fn results(&self, meta: &TaskMeta) -> (Tags, Fields) {
        let (reasons, success) = self.check_result();

        let mut tags = base_tags(meta);
        tags.insert("url".into(), self.url.clone());
        tags.insert("method".into(), self.method.to_ascii_uppercase());
        tags.insert("status".into(), status_of(success).into());

        let mut fields = Fields::new();
        fields.insert("response_time".into(), json!(self.elapsed.as_micros() as u64));
        fields.insert("success".into(), json!(if success { 1 } else { -1 }));

        let mut message = json!({
            "request_header": self.headers,
            "request_body": self.body,
        });
        if let Some(outcome) = &self.outcome {
            tags.insert("status_code_string".into(), format!("{} {}", outcome.status, outcome.reason).trim_end().to_string());
            tags.insert("status_code_class".into(), status_class(outcome.status));
            tags.insert("proto".into(), outcome.version.clone());
            fields.insert("status_code".into(), json!(outcome.status));
            fields.insert("response_body_size".into(), json!(outcome.body.len()));

            message["response_header"] = json!(outcome.headers);
            if !success {
                let body = String::from_utf8_lossy(&outcome.body);
                let cut = body.char_indices().nth(MAX_MESSAGE_BODY).map(|(i, _)| i).unwrap_or(body.len());
                message["response_body"] = Value::String(body[..cut].to_string());
            }
        }
        if !success {
            let reason = reasons.join(";");
            message["fail_reason"] = Value::String(reason.clone());
            fields.insert("fail_reason".into(), Value::String(reason));
        }
        fields.insert("message".into(), Value::String(message.to_string()));

        (tags, fields)
    }

    fn check_result(&self) -> (Vec<String>, bool) {
        let mut reasons = Vec::new();
        match (&self.request_error, &self.outcome) {
            (Some(err), _) => reasons.push(err.clone()),
            (None, None) => reasons.push("no response".to_string()),
            (None, Some(outcome)) => reasons.extend(self.criteria_reasons(outcome)),
        }
        if let Some(result) = &self.post_script_result {
            if result.api.is_failed {
                reasons.push(result.api.error_message.clone());
            }
        }
        let success = reasons.is_empty();
        (reasons, success)
    }

    fn variable_value(&self, variable: &Variable, ctx: &ProbeContext) -> Result<String> {
        if variable.post_script.is_empty() {
            return Err(DialError::config("variable post_script should not be empty"));
        }
        let outcome = self
            .outcome
            .as_ref()
            .ok_or_else(|| DialError::Script("no response available, run the task first".into()))?;
        let result = ctx
            .scripts()
            .run(&variable.post_script, &outcome.body, Some(&outcome.snapshot()))?
            .ok_or_else(|| DialError::Script("post script produced no result".into()))?;
        if result.api.is_failed {
            return Err(DialError::Script(result.api.error_message));
        }
        result
            .api
            .values
            .get(&variable.task_var_name)
            .cloned()
            .ok_or_else(|| DialError::Script(format!("post script set no value named {:?}", variable.task_var_name)))
    }

    fn host_names(&self) -> Result<Vec<String>> {
        let url = Url::parse(&self.url)
            .map_err(|err| DialError::config(format!("invalid url {:?}: {err}", self.url)))?;
        Ok(url.host_str().map(|host| vec![host.to_string()]).unwrap_or_default())
    }
}
