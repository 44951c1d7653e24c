pub mod heartbeat;
pub mod machine;

pub use heartbeat::HeartbeatTracker;
pub use machine::{Machine, MachineStatus};
