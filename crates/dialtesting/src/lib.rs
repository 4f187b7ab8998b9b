//! Synthetic monitoring probes.
//!
//! Tasks are decoded from JSON definitions, validated with [`Task::check`],
//! rendered against global variables and then run on a schedule:
//!
//! ```no_run
//! use dialtesting::{ProbeContext, Task, TaskClass};
//!
//! # async fn demo() -> dialtesting::Result<()> {
//! let ctx = ProbeContext::default();
//! let mut task = Task::from_json(
//!     TaskClass::Http,
//!     r#"{"external_id":"1","frequency":"1m","url":"https://example.com"}"#,
//! )?;
//! task.check()?;
//! task.render_template(None)?;
//! task.run(&ctx).await?;
//! let (tags, fields) = task.results();
//! # let _ = (tags, fields);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod criteria;
pub mod error;
pub mod http;
pub mod icmp;
pub mod multi;
pub mod script;
pub mod tcp;
pub mod task;

pub use context::{ProbeConfig, ProbeContext};
pub use error::{DialError, Result};
pub use icmp::IpPreference;
pub use script::{ScriptEngine, ScriptResult};
pub use task::{
    ConfigVar, Fields, GlobalVars, Probe, Tags, Task, TaskClass, TaskKind, TaskMeta, TaskState, Ticker, Variable,
};
