mod config;
mod monitoring;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dialtesting::ProbeContext;
use logger::LogFormat;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::monitoring::{DialRecord, DialScheduler, DialStatus, load_tasks};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run every task once, report and exit
    #[arg(long)]
    once: bool,
}

fn report(record: &DialRecord) {
    let fields = serde_json::Value::Object(record.fields.clone());
    match record.status {
        DialStatus::Ok => info!(
            task = %record.task_id,
            name = %record.name(),
            metric = %record.metric,
            %fields,
            "dial ok"
        ),
        DialStatus::Fail | DialStatus::Error => warn!(
            task = %record.task_id,
            name = %record.name(),
            metric = %record.metric,
            status = %record.status,
            reasons = ?record.reasons,
            error = record.error.as_deref().unwrap_or_default(),
            "dial failed"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, config_path) = Config::from_config(args.config.as_ref())?;
    let format: LogFormat = config.log.format.parse().map_err(anyhow::Error::msg)?;
    logger::init(&config.log.level, format)?;
    debug!("{config}");

    let tasks_path = config.tasks_path(&config_path);
    let set = load_tasks(&tasks_path).with_context(|| format!("loading tasks from {}", tasks_path.display()))?;
    info!(tasks = set.tasks.len(), path = %tasks_path.display(), "tasks loaded");

    let ctx = Arc::new(ProbeContext::new(config.probe.clone()));
    let globals = Arc::new(RwLock::new(set.global_vars));

    if args.once {
        for mut task in set.tasks {
            if task.is_stopped() {
                continue;
            }
            let record = monitoring::scheduler::execute(&mut task, &ctx, &globals).await;
            report(&record);
        }
        return Ok(());
    }

    let (result_tx, mut result_rx) = mpsc::channel::<DialRecord>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = DialScheduler::new(ctx, globals, result_tx, shutdown_rx);
    let handles = scheduler.schedule_tasks(set.tasks);
    drop(scheduler);

    let reporter = tokio::spawn(async move {
        while let Some(record) = result_rx.recv().await {
            report(&record);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "task loop panicked");
        }
    }
    reporter.await?;
    Ok(())
}
