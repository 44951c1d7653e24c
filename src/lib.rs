pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod node;
pub mod scheduler;
pub mod series;
pub mod shutdown;
pub mod tasks;
