pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod schedule;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod wal;
