//! Multi-step tasks: a sequence of HTTP requests and waits sharing extracted
//! variables.

mod step;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::context::ProbeContext;
use crate::error::{DialError, Result};
use crate::task::{
    ConfigVar, Fields, Probe, RunContext, STATUS_FAIL, STATUS_OK, Tags, Task, TaskClass, TaskKind, TaskMeta,
    Variable, base_tags, status_of,
};

pub use step::{MultiExtractedVar, MultiStep, MultiStepRetry, STEP_TYPE_HTTP, STEP_TYPE_WAIT};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one attempt of an http step.
struct StepAttempt {
    result: Fields,
    error: Option<DialError>,
    values: Option<BTreeMap<String, String>>,
}

impl StepAttempt {
    fn failed(error: DialError) -> Self {
        Self { result: Fields::new(), error: Some(error), values: None }
    }

    fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.get("status").and_then(Value::as_str) == Some(STATUS_OK)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiTask {
    pub steps: Vec<MultiStep>,

    /// Variables extracted so far in the current run, in step order.
    #[serde(skip)]
    extracted_vars: Vec<MultiExtractedVar>,
    #[serde(skip)]
    last_http_step: Option<usize>,
    #[serde(skip)]
    elapsed: Duration,
}

impl MultiTask {
    pub fn extracted_vars(&self) -> &[MultiExtractedVar] {
        &self.extracted_vars
    }

    fn last_http_result(&self) -> Option<&Fields> {
        self.last_http_step.and_then(|index| self.steps.get(index)).and_then(MultiStep::result)
    }

    fn succeeded(&self) -> bool {
        self.last_http_result()
            .and_then(|result| result.get("status"))
            .and_then(Value::as_str)
            == Some(STATUS_OK)
    }

    async fn run_steps(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        for index in 0..self.steps.len() {
            let step_type = self.steps[index].step_type.clone();
            match step_type.as_str() {
                STEP_TYPE_HTTP => {
                    self.last_http_step = Some(index);
                    self.run_http_step(index, ctx).await?;
                }
                STEP_TYPE_WAIT => {
                    let wait = Duration::from_secs(self.steps[index].value);
                    debug!(step = index, ?wait, "waiting before next step");
                    sleep(wait).await;
                }
                other => {
                    return Err(DialError::config(format!("step type should be wait or http, got {other:?}")));
                }
            }
        }
        Ok(())
    }

    async fn run_http_step(&mut self, index: usize, ctx: &RunContext<'_>) -> Result<()> {
        let (max_attempts, interval) = match self.steps[index].retry {
            Some(retry) => (retry.retry.saturating_add(1), Duration::from_millis(retry.interval)),
            None => (1, DEFAULT_RETRY_INTERVAL),
        };

        let mut attempts = 1;
        let mut attempt = self.attempt_http_step(&self.steps[index], ctx).await;
        while !attempt.is_ok() && attempts < max_attempts {
            debug!(step = index, attempt = attempts, "http step failed, retrying");
            sleep(interval).await;
            attempts += 1;
            attempt = self.attempt_http_step(&self.steps[index], ctx).await;
        }

        let StepAttempt { mut result, error, values } = attempt;
        if let Some(values) = values {
            let step = &mut self.steps[index];
            for var in &mut step.extracted_vars {
                if let Some(value) = var.lookup(&values) {
                    var.value = value.clone();
                }
                self.extracted_vars.push(var.clone());
            }
        }

        let Some(err) = error else {
            self.steps[index].result = Some(result);
            return Ok(());
        };

        result.insert("status".into(), Value::String(STATUS_FAIL.into()));
        result
            .entry("fail_reason")
            .or_insert_with(|| Value::String(err.to_string()));
        let allow_failure = self.steps[index].allow_failure;
        self.steps[index].result = Some(result);

        if allow_failure {
            warn!(step = index, attempts, error = %err, "http step failed, continuing");
            Ok(())
        } else {
            Err(DialError::Step { index, source: Box::new(err) })
        }
    }

    async fn attempt_http_step(&self, step: &MultiStep, ctx: &RunContext<'_>) -> StepAttempt {
        let mut task = match Task::from_json(TaskClass::Http, &step.task) {
            Ok(task) => task,
            Err(err) => return StepAttempt::failed(err),
        };

        for var in ctx.config_vars {
            if !task.has_config_var(&var.name) {
                task.add_config_var(ConfigVar::literal(&var.name, &var.value, var.secure));
            }
        }
        for var in &self.extracted_vars {
            task.add_config_var(ConfigVar::literal(&var.name, &var.value, var.secure));
        }

        if let Err(err) = task.render_template_and_init(Some(ctx.globals)) {
            return StepAttempt::failed(err);
        }

        let error = task.run(ctx.probe).await.err();
        let (tags, fields) = task.results();
        let mut result: Fields = tags.into_iter().map(|(key, value)| (key, Value::String(value))).collect();
        result.extend(fields);

        let values = match task.kind() {
            TaskKind::Http(http) => http.post_script_result().map(|script| script.api.values.clone()),
            _ => None,
        };

        StepAttempt { result, error, values }
    }
}

#[async_trait]
impl Probe for MultiTask {
    fn class(&self) -> TaskClass {
        TaskClass::Multi
    }

    fn metric_name(&self) -> &'static str {
        "multi_dial_testing"
    }

    fn check(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(DialError::config("steps should not be empty"));
        }
        for (index, step) in self.steps.iter().enumerate() {
            match step.step_type.as_str() {
                STEP_TYPE_WAIT if step.value == 0 => {
                    return Err(DialError::config(format!("wait step {index} value should not be 0")));
                }
                STEP_TYPE_WAIT => {}
                STEP_TYPE_HTTP => {
                    if step.task.is_empty() {
                        return Err(DialError::config(format!("http step {index} task should not be empty")));
                    }
                    let task = Task::from_json(TaskClass::Http, &step.task)
                        .map_err(|err| DialError::config(format!("http step {index} task is invalid: {err}")))?;
                    if let TaskKind::Http(http) = task.kind() {
                        http.check()
                            .map_err(|err| DialError::config(format!("check http step {index} failed: {err}")))?;
                    }
                }
                other => {
                    return Err(DialError::config(format!("step type should be wait or http, got {other:?}")));
                }
            }
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        let start = Instant::now();
        let outcome = self.run_steps(ctx).await;
        self.elapsed = start.elapsed();
        outcome
    }

    fn clear(&mut self) {
        self.extracted_vars.clear();
        self.last_http_step = None;
        self.elapsed = Duration::ZERO;
        for step in &mut self.steps {
            step.reset();
        }
    }

    fn results(&self, meta: &TaskMeta) -> (Tags, Fields) {
        let success = self.succeeded();

        let mut tags = base_tags(meta);
        tags.insert("status".into(), status_of(success).into());

        let mut fields = Fields::new();
        fields.insert("success".into(), json!(if success { 1 } else { -1 }));
        fields.insert("response_time".into(), json!(self.elapsed.as_micros() as u64));
        if let Some(message) = self.last_http_result().and_then(|result| result.get("message")) {
            fields.insert("message".into(), message.clone());
        }

        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|step| {
                let mut result = step.result().cloned().unwrap_or_default();
                let vars: Vec<MultiExtractedVar> = step.extracted_vars.iter().map(MultiExtractedVar::redacted).collect();
                result.insert("extracted_vars".into(), json!(vars));
                Value::Object(result)
            })
            .collect();
        fields.insert("steps".into(), Value::String(Value::Array(steps).to_string()));

        (tags, fields)
    }

    fn check_result(&self) -> (Vec<String>, bool) {
        let reasons = self
            .last_http_result()
            .and_then(|result| result.get("fail_reason"))
            .and_then(Value::as_str)
            .map(|reason| vec![reason.to_string()])
            .unwrap_or_default();
        (reasons, self.succeeded())
    }

    fn variable_value(&self, _variable: &Variable, _ctx: &ProbeContext) -> Result<String> {
        Err(DialError::Unsupported("variable extraction", TaskClass::Multi))
    }

    fn host_names(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for step in self.steps.iter().filter(|step| step.is_http()) {
            let task = Task::from_json(TaskClass::Http, &step.task)?;
            hosts.extend(task.host_names()?);
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(json: Value) -> MultiTask {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_check_rejects_bad_steps() {
        assert!(multi(json!({ "steps": [] })).check().is_err());
        assert!(multi(json!({ "steps": [{ "type": "wait", "value": 0 }] })).check().is_err());
        assert!(multi(json!({ "steps": [{ "type": "dns" }] })).check().is_err());
        assert!(multi(json!({ "steps": [{ "type": "http", "task": "" }] })).check().is_err());
        assert!(multi(json!({ "steps": [{ "type": "http", "task": "not json" }] })).check().is_err());

        let ok = multi(json!({ "steps": [
            { "type": "http", "task": r#"{"url":"http://localhost/a"}"# },
            { "type": "wait", "value": 1 },
        ]}));
        assert!(ok.check().is_ok());
    }

    #[test]
    fn test_host_names_from_http_steps() {
        let task = multi(json!({ "steps": [
            { "type": "http", "task": r#"{"url":"http://a.example/x"}"# },
            { "type": "wait", "value": 1 },
            { "type": "http", "task": r#"{"url":"https://b.example"}"# },
        ]}));
        assert_eq!(task.host_names().unwrap(), vec!["a.example".to_string(), "b.example".to_string()]);
    }

    #[test]
    fn test_results_without_run_fail() {
        let task = multi(json!({ "steps": [{ "type": "wait", "value": 1 }] }));
        let (tags, fields) = task.results(&TaskMeta::default());
        assert_eq!(tags["status"], "FAIL");
        assert_eq!(fields["success"], -1);
        let steps: Vec<Value> = serde_json::from_str(fields["steps"].as_str().unwrap()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(task.check_result(), (Vec::new(), false));
    }
}
