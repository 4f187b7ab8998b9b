use std::{fs, io, path};

use dialtesting::{DialError, GlobalVars, Task, TaskClass};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {source}")]
    Read { path: path::PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: path::PathBuf, source: serde_json::Error },
    #[error("task {index} ({class}) is invalid: {source}")]
    Task { index: usize, class: TaskClass, source: DialError },
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    class: TaskClass,
    task: Value,
}

#[derive(Debug, Default, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskEntry>,
    #[serde(default)]
    global_vars: GlobalVars,
}

/// Checked tasks and the global variables they render against.
#[derive(Debug, Default)]
pub struct TaskSet {
    pub tasks: Vec<Task>,
    pub global_vars: GlobalVars,
}

pub fn load_tasks(path: &path::Path) -> Result<TaskSet, LoaderError> {
    let raw = fs::read_to_string(path).map_err(|source| LoaderError::Read { path: path.to_path_buf(), source })?;
    parse_tasks(&raw).map_err(|err| match err {
        LoaderError::Parse { source, .. } => LoaderError::Parse { path: path.to_path_buf(), source },
        other => other,
    })
}

/// Decode and check every definition. A task that fails `check` is skipped
/// with a warning, a task that cannot be decoded fails the whole file.
pub fn parse_tasks(raw: &str) -> Result<TaskSet, LoaderError> {
    let file: TaskFile =
        serde_json::from_str(raw).map_err(|source| LoaderError::Parse { path: path::PathBuf::new(), source })?;

    let mut tasks = Vec::with_capacity(file.tasks.len());
    for (index, entry) in file.tasks.into_iter().enumerate() {
        let mut task = Task::from_value(entry.class, entry.task)
            .map_err(|source| LoaderError::Task { index, class: entry.class, source })?;
        if let Err(err) = task.check() {
            warn!(index, class = %entry.class, name = %task.meta().name, error = %err, "skipping invalid task");
            continue;
        }
        tasks.push(task);
    }

    Ok(TaskSet { tasks, global_vars: file.global_vars })
}
