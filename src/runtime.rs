//! Runtime glue: configuration, fatal error capture, telemetry, and the
//! signal-aware runner.

pub mod config;
pub mod fatal;
pub mod runner;
pub mod telemetry;
