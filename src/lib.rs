//! Library crate for domscan-rs: tool catalog, command building, process
//! supervision, output fan-out and the scan orchestrator behind the HTTP API.
pub mod broadcast;
pub mod catalog;
pub mod command;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod run;
pub mod runner;
pub mod server;
pub mod types;
