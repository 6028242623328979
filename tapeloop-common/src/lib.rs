//! # tapeloop common library
//!
//! Shared code for the tapeloop daemon and its tooling:
//! - Error and Result types
//! - Bootstrap configuration (TOML) and root folder resolution
//! - SQLite pool initialisation and lock-retry helper
//! - Chat message types exchanged with the messaging collaborator

pub mod config;
pub mod db;
pub mod error;
pub mod messages;

pub use error::{Error, Result};
pub use messages::{InboundMessage, MessageKind, OutboundMessage};
