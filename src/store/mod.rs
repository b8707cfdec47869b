//! Durable step storage.
//!
//! This module provides the sqlite-backed table of step records with
//! status transitions, the companion tag -> velocity table, and schema
//! management.
//!
//! # Overview
//!
//! - **StepStore**: CRUD over step rows, the dispatch query, error
//!   reports and bulk maintenance operations
//! - **Step / StepStatus**: the job unit and its status state machine
//! - **Migrations**: idempotent schema application

pub mod migrations;
pub mod schema;
pub mod step;
#[allow(clippy::module_inception)]
mod store;

pub use migrations::{MigrationError, MigrationRunner};
pub use step::{Step, StepStatus, UnknownStatus};
pub use store::{now_epoch, DispatchRow, ErrorReport, StepStore, StoreError};
