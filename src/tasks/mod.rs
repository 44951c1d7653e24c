pub mod queue;
pub mod task;

pub use queue::TaskQueue;
pub use task::{Task, TaskOptions, TaskState};
