use std::time::SystemTime;

use dialtesting::{Fields, Tags, Task, TaskClass};
use serde::{Deserialize, Serialize};

/// Outcome of a run as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialStatus {
    Ok,
    Fail,
    /// The run itself errored before a verdict could be reached.
    Error,
}

impl std::fmt::Display for DialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialStatus::Ok => write!(f, "ok"),
            DialStatus::Fail => write!(f, "fail"),
            DialStatus::Error => write!(f, "error"),
        }
    }
}

/// One result record, ready to be logged or shipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRecord {
    pub task_id: String,
    pub class: TaskClass,
    /// Measurement name, e.g. `http_dial_testing`.
    pub metric: String,
    pub timestamp: SystemTime,
    pub status: DialStatus,
    pub tags: Tags,
    pub fields: Fields,
    pub reasons: Vec<String>,
    pub error: Option<String>,
}

impl DialRecord {
    /// Snapshot the last run of `task`.
    pub fn from_task(task: &Task) -> Self {
        let (tags, fields) = task.results();
        let (reasons, success) = task.check_result();
        Self {
            task_id: task.id(),
            class: task.class(),
            metric: task.metric_name().to_string(),
            timestamp: SystemTime::now(),
            status: if success { DialStatus::Ok } else { DialStatus::Fail },
            tags,
            fields,
            reasons,
            error: None,
        }
    }

    /// Attach the error the run returned.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.status = DialStatus::Error;
        self.error = Some(error.to_string());
        self
    }

    pub fn name(&self) -> &str {
        self.tags.get("name").map(String::as_str).unwrap_or_default()
    }
}
