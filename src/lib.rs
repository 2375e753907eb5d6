//! wabridge: bridge a personal WhatsApp account to a tool-calling agent.
//!
//! Keeps one long-lived session with the messaging network, mirrors chat
//! history into SQLite, and exposes read queries plus send commands (text,
//! files, voice notes) to an external agent layer.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod types;

pub mod network;
pub mod session;
pub mod store;

pub mod ingest;
pub mod media;

pub mod commands;
pub mod query;

pub mod bridge;
