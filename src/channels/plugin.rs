//! Channel plugin trait and core types for the chat platform boundary.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies a target for sending messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelTarget {
    /// Channel type, e.g. "discord"
    pub channel: String,
    /// Platform-specific chat/channel ID
    pub chat_id: String,
    /// Optional user ID of the sender
    pub user_id: Option<String>,
    /// Optional username/display name
    pub username: Option<String>,
}

impl ChannelTarget {
    /// Create a new Discord target
    pub fn discord(channel_id: u64, user_id: Option<u64>) -> Self {
        Self {
            channel: "discord".to_string(),
            chat_id: channel_id.to_string(),
            user_id: user_id.map(|id| id.to_string()),
            username: None,
        }
    }

    /// Attach a display name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Message ID returned after sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    /// Platform-specific message ID
    pub id: String,
    /// Channel type
    pub channel: String,
}

/// Outbound message to send to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message content
    pub content: String,
    /// Optional message ID to reply to
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    /// Create a simple text message
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to: None,
        }
    }

    /// Set reply target
    pub fn with_reply(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }
}

/// Inbound message from a channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Source of the message
    pub target: ChannelTarget,
    /// Message content with the bot's own mentions removed
    pub content: String,
    /// Platform-specific message ID
    pub message_id: String,
    /// Guild the message came from (None for DMs)
    pub guild_id: Option<String>,
    /// Sent in a direct/private channel
    pub is_dm: bool,
    /// The bot was mentioned explicitly
    pub mentioned: bool,
}

impl InboundMessage {
    /// Whether the bot is being talked to directly
    pub fn is_addressed(&self) -> bool {
        self.is_dm || self.mentioned
    }

    /// Sender user ID, empty when unknown
    pub fn user_id(&self) -> &str {
        self.target.user_id.as_deref().unwrap_or_default()
    }

    /// Best available name for the sender
    pub fn display_name(&self) -> &str {
        self.target
            .username
            .as_deref()
            .or(self.target.user_id.as_deref())
            .unwrap_or("unknown")
    }
}

/// Context passed to channel plugins for interacting with the manager
#[derive(Debug)]
pub struct ChannelContext {
    /// Sender for inbound messages
    pub message_tx: mpsc::UnboundedSender<InboundMessage>,
}

/// Trait for channel plugins (Discord, test doubles)
#[async_trait::async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Plugin name (e.g., "discord")
    fn name(&self) -> &str;

    /// Start the plugin (log in, start receiving events)
    async fn start(&self, ctx: Arc<ChannelContext>) -> Result<()>;

    /// Stop the plugin gracefully
    async fn stop(&self) -> Result<()>;

    /// Send a new message to a target
    async fn send_message(&self, target: &ChannelTarget, msg: &OutboundMessage)
        -> Result<MessageId>;

    /// Replace the content of a previously sent message
    async fn edit_message(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        msg: &OutboundMessage,
    ) -> Result<()>;

    /// Add the bot's reaction to a message
    async fn add_reaction(&self, target: &ChannelTarget, message_id: &str, emoji: &str)
        -> Result<()>;

    /// Remove the bot's reaction from a message
    async fn remove_reaction(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        emoji: &str,
    ) -> Result<()>;
}
