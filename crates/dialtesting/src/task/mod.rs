//! Task definitions and the lifecycle shared by every probe variant.
//!
//! A [`Task`] wraps the common metadata (identity, schedule, config vars) and a
//! [`TaskKind`] payload. The lifecycle is `check` -> `render_template` -> `run`,
//! after which `results` and `check_result` describe the last run.

mod frequency;
mod variables;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::ProbeContext;
use crate::error::{DialError, Result};
use crate::http::HttpTask;
use crate::icmp::IcmpTask;
use crate::multi::MultiTask;
use crate::tcp::TcpTask;

pub use frequency::{Ticker, parse_duration, parse_frequency};
pub use variables::{
    ConfigVar, GlobalVars, TYPE_VARIABLE_GLOBAL, TemplateVars, Variable, VariableResolver,
    render_str, render_value,
};

/// Status value that marks a task as stopped.
pub const STATUS_STOP: &str = "stop";
pub const STATUS_OK: &str = "OK";
pub const STATUS_FAIL: &str = "FAIL";

/// Tags of a result record.
pub type Tags = BTreeMap<String, String>;
/// Fields of a result record.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskClass {
    Http,
    Icmp,
    Tcp,
    Multi,
}

impl fmt::Display for TaskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskClass::Http => "HTTP",
            TaskClass::Icmp => "ICMP",
            TaskClass::Tcp => "TCP",
            TaskClass::Multi => "MULTI",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Checked,
    Rendered,
    Running,
    Completed,
    Stopped,
}

/// What a variant sees while it runs.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub probe: &'a ProbeContext,
    pub globals: &'a GlobalVars,
    /// The owning task's config vars, already resolved against `globals`.
    pub config_vars: &'a [ConfigVar],
}

/// Behaviour every task variant provides.
#[async_trait]
pub trait Probe: Send + Sync {
    fn class(&self) -> TaskClass;

    fn metric_name(&self) -> &'static str;

    /// Structural validation of the payload.
    fn check(&self) -> Result<()>;

    /// Prepare runtime state (clients, parsed criteria). Called again after a
    /// render changes the payload.
    fn init(&mut self) -> Result<()>;

    fn before_first_render(&mut self) {}

    async fn run(&mut self, ctx: &RunContext<'_>) -> Result<()>;

    /// Forget everything recorded by the previous run.
    fn clear(&mut self);

    fn results(&self, meta: &TaskMeta) -> (Tags, Fields);

    fn check_result(&self) -> (Vec<String>, bool);

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn variable_value(&self, variable: &Variable, ctx: &ProbeContext) -> Result<String>;

    fn host_names(&self) -> Result<Vec<String>>;
}

/// Metadata shared by all task variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMeta {
    pub external_id: String,
    pub name: String,
    #[serde(rename = "access_key")]
    pub access_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub post_url: String,
    pub status: String,
    pub frequency: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub owner_external_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub update_time: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_vars: Vec<ConfigVar>,
}

/// Variant payload of a task.
#[derive(Debug)]
pub enum TaskKind {
    Http(HttpTask),
    Icmp(IcmpTask),
    Tcp(TcpTask),
    Multi(MultiTask),
}

impl TaskKind {
    pub fn from_value(class: TaskClass, value: Value) -> Result<Self> {
        Ok(match class {
            TaskClass::Http => TaskKind::Http(serde_json::from_value(value)?),
            TaskClass::Icmp => TaskKind::Icmp(serde_json::from_value(value)?),
            TaskClass::Tcp => TaskKind::Tcp(serde_json::from_value(value)?),
            TaskClass::Multi => TaskKind::Multi(serde_json::from_value(value)?),
        })
    }

    pub fn class(&self) -> TaskClass {
        self.probe().class()
    }

    fn to_value(&self) -> Result<Value> {
        Ok(match self {
            TaskKind::Http(task) => serde_json::to_value(task)?,
            TaskKind::Icmp(task) => serde_json::to_value(task)?,
            TaskKind::Tcp(task) => serde_json::to_value(task)?,
            TaskKind::Multi(task) => serde_json::to_value(task)?,
        })
    }

    fn probe(&self) -> &dyn Probe {
        match self {
            TaskKind::Http(task) => task,
            TaskKind::Icmp(task) => task,
            TaskKind::Tcp(task) => task,
            TaskKind::Multi(task) => task,
        }
    }

    fn probe_mut(&mut self) -> &mut dyn Probe {
        match self {
            TaskKind::Http(task) => task,
            TaskKind::Icmp(task) => task,
            TaskKind::Tcp(task) => task,
            TaskKind::Multi(task) => task,
        }
    }
}

/// A dial-testing task: metadata, variant payload and schedule.
#[derive(Debug)]
pub struct Task {
    meta: TaskMeta,
    kind: TaskKind,
    /// Metadata as supplied, placeholders intact.
    meta_template: TaskMeta,
    /// Variant definition as supplied, placeholders intact.
    template: Value,
    /// Serialized output of the last render.
    rendered: String,
    globals: GlobalVars,
    ticker: Option<Ticker>,
    state: TaskState,
    inited: bool,
    init_count: u64,
}

#[derive(Serialize)]
struct TaskDefinition<'a> {
    #[serde(flatten)]
    meta: &'a TaskMeta,
    #[serde(flatten)]
    payload: &'a Value,
}

impl Serialize for Task {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TaskDefinition { meta: &self.meta_template, payload: &self.template }.serialize(serializer)
    }
}

impl Task {
    pub fn new(meta: TaskMeta, kind: TaskKind) -> Result<Self> {
        Self::assemble(meta, kind)
    }

    /// Decode a task definition: metadata and variant fields live in one object.
    pub fn from_value(class: TaskClass, value: Value) -> Result<Self> {
        let meta: TaskMeta = serde_json::from_value(value.clone())?;
        let kind = TaskKind::from_value(class, value)?;
        Self::assemble(meta, kind)
    }

    pub fn from_json(class: TaskClass, json: &str) -> Result<Self> {
        Self::from_value(class, serde_json::from_str(json)?)
    }

    fn assemble(meta: TaskMeta, kind: TaskKind) -> Result<Self> {
        let template = kind.to_value()?;
        let mut task = Self {
            meta_template: meta.clone(),
            meta,
            kind,
            template,
            rendered: String::new(),
            globals: GlobalVars::new(),
            ticker: None,
            state: TaskState::Created,
            inited: false,
            init_count: 0,
        };
        task.rendered = task.definition()?.to_string();
        Ok(task)
    }

    /// Metadata and variant fields as one object, placeholders intact. Config
    /// var declarations are left out so rendering never rewrites them.
    fn definition(&self) -> Result<Value> {
        let mut meta = self.meta_template.clone();
        meta.config_vars.clear();
        let mut definition = serde_json::to_value(&meta)?;
        if let (Some(definition), Some(payload)) = (definition.as_object_mut(), self.template.as_object()) {
            definition.extend(payload.clone());
        }
        Ok(definition)
    }

    /// Validate the definition and prepare the task for scheduled runs.
    pub fn check(&mut self) -> Result<()> {
        if self.meta.external_id.is_empty() {
            return Err(DialError::config("external ID missing"));
        }
        self.kind.probe().check()?;
        self.init(false)?;
        self.state = if self.is_stopped() { TaskState::Stopped } else { TaskState::Checked };
        Ok(())
    }

    /// Initialise without a schedule, for ad-hoc runs and step tasks.
    pub fn init_debug(&mut self) -> Result<()> {
        self.init(true)
    }

    fn init(&mut self, debug: bool) -> Result<()> {
        let result = self.init_inner(debug);
        self.inited = true;
        result
    }

    fn init_inner(&mut self, debug: bool) -> Result<()> {
        if !debug {
            let period = parse_frequency(&self.meta.frequency)?;
            self.ticker = Some(Ticker::new(period));
        }
        if self.is_stopped() {
            return Ok(());
        }
        self.init_count += 1;
        self.kind.probe_mut().init()
    }

    /// Resolve config vars against `globals` and re-render the variant when the
    /// substituted definition changed.
    pub fn render_template(&mut self, globals: Option<&GlobalVars>) -> Result<()> {
        if !self.inited {
            self.kind.probe_mut().before_first_render();
        }
        self.globals = globals.cloned().unwrap_or_default();

        if !self.meta.config_vars.is_empty() {
            let values = VariableResolver::new(&self.globals).resolve(&mut self.meta.config_vars);
            if self.class() != TaskClass::Multi {
                self.apply_render(&values)?;
            }
        }

        if self.state != TaskState::Stopped {
            self.state = TaskState::Rendered;
        }
        Ok(())
    }

    fn apply_render(&mut self, values: &TemplateVars) -> Result<()> {
        let rendered = render_value(&self.definition()?, values);
        let text = rendered.to_string();
        if text == self.rendered {
            return Ok(());
        }

        let mut meta: TaskMeta =
            serde_json::from_value(rendered.clone()).map_err(|err| DialError::Template(err.to_string()))?;
        let kind = TaskKind::from_value(self.class(), rendered).map_err(|err| DialError::Template(err.to_string()))?;
        meta.config_vars = std::mem::take(&mut self.meta.config_vars);

        debug!(task = %meta.name, class = %self.class(), "task definition changed after render");
        self.meta = meta;
        self.kind = kind;
        self.rendered = text;
        // the schedule is only (re)built by check
        self.init_debug()
    }

    /// Render, then make sure the variant was initialised at least once.
    pub fn render_template_and_init(&mut self, globals: Option<&GlobalVars>) -> Result<()> {
        self.render_template(globals)?;
        if !self.inited {
            self.init_debug()?;
        }
        Ok(())
    }

    /// Execute one probe run. A stopped task does nothing.
    pub async fn run(&mut self, ctx: &ProbeContext) -> Result<()> {
        match self.state {
            TaskState::Created => {
                return Err(DialError::config("task must be checked or rendered before it runs"));
            }
            TaskState::Stopped => {
                debug!(task = %self.meta.name, "skipping run of stopped task");
                return Ok(());
            }
            _ => {}
        }

        self.kind.probe_mut().clear();
        self.state = TaskState::Running;
        let run = RunContext {
            probe: ctx,
            globals: &self.globals,
            config_vars: &self.meta.config_vars,
        };
        let result = self.kind.probe_mut().run(&run).await;
        self.state = TaskState::Completed;
        result
    }

    pub fn results(&self) -> (Tags, Fields) {
        self.kind.probe().results(&self.meta)
    }

    pub fn check_result(&self) -> (Vec<String>, bool) {
        self.kind.probe().check_result()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.kind.probe_mut().stop()?;
        self.ticker = None;
        self.state = TaskState::Stopped;
        info!(task = %self.meta.name, id = %self.id(), "task stopped");
        Ok(())
    }

    pub fn host_names(&self) -> Result<Vec<String>> {
        self.kind.probe().host_names()
    }

    pub fn variable_value(&self, variable: &Variable, ctx: &ProbeContext) -> Result<String> {
        self.kind.probe().variable_value(variable, ctx)
    }

    /// Ids of the global variables this task references.
    pub fn global_vars(&self) -> Vec<String> {
        self.meta
            .config_vars
            .iter()
            .filter(|var| var.is_global() && !var.id.is_empty())
            .map(|var| var.id.clone())
            .collect()
    }

    /// Append a config var. Used to inject extracted variables into step tasks.
    pub fn add_config_var(&mut self, var: ConfigVar) {
        self.meta.config_vars.push(var);
    }

    pub fn has_config_var(&self, name: &str) -> bool {
        self.meta.config_vars.iter().any(|var| var.name == name)
    }

    pub fn id(&self) -> String {
        if self.meta.external_id.is_empty() {
            format!("dtst_{}", Uuid::new_v4().simple())
        } else {
            format!("{}_{}", self.meta.access_key, self.meta.external_id)
        }
    }

    pub fn class(&self) -> TaskClass {
        self.kind.class()
    }

    pub fn metric_name(&self) -> &'static str {
        self.kind.probe().metric_name()
    }

    pub fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.meta.status.eq_ignore_ascii_case(STATUS_STOP)
    }

    pub fn ticker_mut(&mut self) -> Option<&mut Ticker> {
        self.ticker.as_mut()
    }

    /// How many times the variant has been initialised.
    pub fn init_count(&self) -> u64 {
        self.init_count
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.meta.status = status.into();
        self.meta_template.status = self.meta.status.clone();
    }

    pub fn set_access_key(&mut self, access_key: impl Into<String>) {
        self.meta.access_key = access_key.into();
        self.meta_template.access_key = self.meta.access_key.clone();
    }

    pub fn set_region(&mut self, region: impl Into<String>) {
        self.meta.region = region.into();
        self.meta_template.region = self.meta.region.clone();
    }

    pub fn set_owner_external_id(&mut self, owner: impl Into<String>) {
        self.meta.owner_external_id = owner.into();
        self.meta_template.owner_external_id = self.meta.owner_external_id.clone();
    }

    pub fn set_update_time(&mut self, update_time: i64) {
        self.meta.update_time = update_time;
        self.meta_template.update_time = update_time;
    }
}

/// The task's own tags plus `name`.
pub(crate) fn base_tags(meta: &TaskMeta) -> Tags {
    let mut tags = meta.tags.clone();
    tags.insert("name".to_string(), meta.name.clone());
    tags
}

pub(crate) fn status_of(success: bool) -> &'static str {
    if success { STATUS_OK } else { STATUS_FAIL }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tcp_task(extra: Value) -> Task {
        let mut def = json!({
            "external_id": "ext-1",
            "access_key": "ak",
            "name": "tcp",
            "frequency": "1m",
            "host": "127.0.0.1",
            "port": 80,
        });
        if let (Some(obj), Some(extra)) = (def.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        Task::from_value(TaskClass::Tcp, def).unwrap()
    }

    #[test]
    fn test_class_names() {
        assert_eq!(TaskClass::Multi.to_string(), "MULTI");
        let class: TaskClass = serde_json::from_str("\"ICMP\"").unwrap();
        assert_eq!(class, TaskClass::Icmp);
    }

    #[test]
    fn test_id_uses_access_key_and_external_id() {
        let task = tcp_task(json!({}));
        assert_eq!(task.id(), "ak_ext-1");

        let task = tcp_task(json!({ "external_id": "" }));
        assert!(task.id().starts_with("dtst_"));
    }

    #[test]
    fn test_check_requires_external_id_and_frequency() {
        let mut task = tcp_task(json!({ "external_id": "" }));
        assert!(matches!(task.check(), Err(DialError::Configuration(_))));

        let mut task = tcp_task(json!({ "frequency": "soon" }));
        assert!(matches!(task.check(), Err(DialError::Configuration(_))));

        let mut task = tcp_task(json!({}));
        task.check().unwrap();
        assert_eq!(task.state(), TaskState::Checked);
        assert_eq!(task.init_count(), 1);
    }

    #[test]
    fn test_stopped_task_skips_variant_init() {
        let mut task = tcp_task(json!({ "status": "stop" }));
        task.check().unwrap();
        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(task.init_count(), 0);
    }

    #[test]
    fn test_global_vars_lists_ids() {
        let task = tcp_task(json!({
            "config_vars": [
                { "id": "g1", "type": "global", "name": "a" },
                { "name": "b", "value": "x" },
            ]
        }));
        assert_eq!(task.global_vars(), vec!["g1".to_string()]);
    }

    #[test]
    fn test_render_resolves_metadata_placeholders() {
        let mut task = tcp_task(json!({
            "name": "{{env}} login",
            "tags": { "env": "{{env}}" },
            "config_vars": [{ "name": "env", "value": "prod" }]
        }));
        task.check().unwrap();
        task.render_template(None).unwrap();

        let (tags, _) = task.results();
        assert_eq!(tags["env"], "prod");
        assert_eq!(tags["name"], "prod login");
        assert_eq!(task.meta().config_vars.len(), 1);
        assert_eq!(task.meta().config_vars[0].name, "env");

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["tags"]["env"], "{{env}}");
        assert_eq!(value["name"], "{{env}} login");

        let count = task.init_count();
        task.render_template(None).unwrap();
        assert_eq!(task.init_count(), count);
    }

    #[test]
    fn test_serialize_keeps_placeholders() {
        let task = tcp_task(json!({
            "host": "{{target}}",
            "config_vars": [{ "name": "target", "value": "10.0.0.1" }]
        }));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["host"], "{{target}}");
        assert_eq!(value["external_id"], "ext-1");
    }
}
