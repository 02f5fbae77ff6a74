pub mod command;
pub mod telemetry;
