/// Scheduling of dial-testing tasks: loading definitions, driving each task
/// on its own timer and turning runs into records.
pub mod loader;
pub mod scheduler;
pub mod types;

pub use loader::load_tasks;
pub use scheduler::DialScheduler;
pub use types::{DialRecord, DialStatus};
