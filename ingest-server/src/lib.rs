//! Segmented image ingest server: TCP listener, per-connection frame loop, session coordinator
//! with idle reaper, plus a small client for senders.

pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod server;
pub mod session;

pub use client::IngestClient;
pub use config::{Config, ConfigError};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use error::{IngestError, Result};
pub use server::{IngestServer, ServerHandle};
pub use session::Session;
