//! stephub: distributed step-graph scheduling hub.
//!
//! This library provides the hub server, its durable step store and
//! scheduler, and the client used by workers and pipeline tooling.

// Core modules
pub mod blob;
pub mod cli;
pub mod client;
pub mod compile;
pub mod config;
pub mod graph;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod throttle;

// Re-export the types most callers touch
pub use client::{ClientError, HubClient};
pub use config::HubConfig;
pub use store::{Step, StepStatus, StepStore};
