//! Client runtime for the booking app: session, realtime connection, bot
//! conversation, notifications and synced preferences.
//!
//! [`runtime::Runtime`] wires the services together; each service can also be
//! constructed on its own with injected collaborators.

pub mod config;
pub mod conversation;
pub mod notify;
pub mod prefs;
pub mod realtime;
pub mod runtime;
pub mod session;
pub mod storage;

pub use config::RuntimeConfig;
pub use runtime::{Runtime, RuntimeError};
