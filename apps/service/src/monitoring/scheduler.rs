use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dialtesting::{GlobalVars, ProbeContext, Task};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::types::DialRecord;

/// Drives every task on its own timer and forwards the records.
pub struct DialScheduler {
    ctx: Arc<ProbeContext>,
    globals: Arc<RwLock<GlobalVars>>,
    result_tx: mpsc::Sender<DialRecord>,
    shutdown: watch::Receiver<bool>,
}

impl DialScheduler {
    pub fn new(
        ctx: Arc<ProbeContext>,
        globals: Arc<RwLock<GlobalVars>>,
        result_tx: mpsc::Sender<DialRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { ctx, globals, result_tx, shutdown }
    }

    /// Spawn the loop of a checked task. Stopped tasks return at once,
    /// otherwise the loop runs until shutdown or until the record channel closes.
    pub fn schedule_task(&self, mut task: Task) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let globals = self.globals.clone();
        let result_tx = self.result_tx.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let id = task.id();
            if task.is_stopped() {
                debug!(task = %id, "task is stopped, not scheduling");
                return;
            }
            info!(task = %id, class = %task.class(), "scheduling task");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let Some(ticker) = task.ticker_mut() else {
                    debug!(task = %id, "task has no schedule");
                    break;
                };
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let record = execute(&mut task, &ctx, &globals).await;
                if let Err(e) = result_tx.send(record).await {
                    error!("Failed to send dial record: {}", e);
                    break;
                }
            }
            info!(task = %id, "task loop finished");
        })
    }

    pub fn schedule_tasks(&self, tasks: Vec<Task>) -> Vec<tokio::task::JoinHandle<()>> {
        tasks.into_iter().map(|task| self.schedule_task(task)).collect()
    }
}

/// Render against the current globals, run once and snapshot the outcome.
pub async fn execute(task: &mut Task, ctx: &ProbeContext, globals: &RwLock<GlobalVars>) -> DialRecord {
    let rendered = {
        let globals = globals.read().await;
        task.render_template(Some(&*globals))
    };
    if let Err(err) = rendered {
        warn!(task = %task.id(), error = %err, "render failed");
        return DialRecord::from_task(task).with_error(err);
    }

    let outcome = task.run(ctx).await;
    refresh_variables(task, ctx, globals).await;

    let record = DialRecord::from_task(task);
    match outcome {
        Ok(()) => record,
        Err(err) => record.with_error(err),
    }
}

/// Update the global variables whose value is extracted from `task`.
///
/// Scripts run under the read lock; the write lock is only held to store the
/// new values.
async fn refresh_variables(task: &Task, ctx: &ProbeContext, globals: &RwLock<GlobalVars>) {
    let external_id = &task.meta().external_id;
    let updates: Vec<(String, String)> = {
        let globals = globals.read().await;
        globals
            .iter()
            .filter(|(_, var)| !var.task_id.is_empty() && var.task_id == *external_id)
            .filter_map(|(key, var)| match task.variable_value(var, ctx) {
                Ok(value) if value != var.value => Some((key.clone(), value)),
                Ok(_) => None,
                Err(err) => {
                    warn!(variable = %var.id, task = %external_id, error = %err, "failed to refresh variable");
                    None
                }
            })
            .collect()
    };
    if updates.is_empty() {
        return;
    }

    let updated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default();
    let mut globals = globals.write().await;
    for (key, value) in updates {
        if let Some(variable) = globals.get_mut(&key) {
            debug!(variable = %variable.id, task = %external_id, "global variable updated");
            variable.value = value;
            variable.updated_at = updated_at;
        }
    }
}
