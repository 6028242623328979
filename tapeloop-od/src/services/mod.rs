//! Core services driven by the orchestrator

pub mod approval_gateway;
pub mod naming;
pub mod notifications;
pub mod pipeline;
pub mod recording_controller;
pub mod sync_coordinator;
