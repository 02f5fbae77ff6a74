pub mod advisor;
pub mod bus;
pub mod commands;
pub mod controller;
pub mod derivations;
pub mod engine;
pub mod op_state;
pub mod publisher;
pub mod sampler;
pub mod watchdog;
