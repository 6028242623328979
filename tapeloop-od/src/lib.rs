//! # tapeloop-od
//!
//! Orchestrator daemon that takes a liked track through chat approval,
//! real-time recording, encode/tag and finally a copy onto a removable
//! player. The library is what the binary wires up; integration tests drive
//! it with fake collaborators.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;

pub use api::{build_router, AppState};
pub use error::{ApiError, ApiResult, OrchestratorError};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorHandle};
