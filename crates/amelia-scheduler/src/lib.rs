pub mod scheduler;

pub use scheduler::{progress, ready_tasks, step, TaskExecutor, TaskOutcome};
