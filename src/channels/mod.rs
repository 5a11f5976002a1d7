//! Chat platform side of the bridge.
//!
//! # Architecture
//!
//! ```text
//!                ┌───────────────────────────────────────────────────┐
//!                │                  BridgeManager                    │
//!  Discord ────► │  SessionRouter ─► AccessGate ─► AssistantHost ────┼──► host socket
//!  (plugin)      │                                     │ fragments   │
//!     ▲          │                                     ▼             │
//!     └──────────┼──────────────── StreamRegistry (one task/session) │
//!                └───────────────────────────────────────────────────┘
//! ```
//!
//! Routing and access state live in the persisted config; see
//! [`crate::config::ConfigStore`].

pub mod auth;
pub mod chunker;
pub mod history;
pub mod manager;
pub mod plugin;
pub mod session_map;
pub mod stream;

#[cfg(feature = "discord")]
pub mod discord;

pub use manager::BridgeManager;
pub use plugin::{ChannelContext, ChannelPlugin, ChannelTarget, InboundMessage, MessageId, OutboundMessage};
