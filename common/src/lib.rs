// Shared library for recurring background workers coordinated through a cache

pub mod cache;
pub mod config;
pub mod errors;
pub mod identity;
pub mod lease;
pub mod schedule;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
