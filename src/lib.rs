//! discord-bridge - Discord front end for an assistant host
//!
//! This library provides the bridge's components: streaming output
//! reconciliation, session routing, pairing-based access control, the
//! Discord adapter and the assistant host client.

pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;

#[cfg(test)]
pub mod test_utils;

// Re-export Args for the binary
pub use cli::Args;
pub use error::{Error, Result};
