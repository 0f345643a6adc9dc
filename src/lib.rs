pub mod config;
pub mod errors;
pub mod platform;
pub mod telemetry;
