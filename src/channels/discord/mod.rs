//! Discord channel plugin using serenity.

pub mod formatting;

use super::plugin::{
    ChannelContext, ChannelPlugin, ChannelTarget, InboundMessage, MessageId, OutboundMessage,
};
use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serenity::{
    async_trait as serenity_async_trait,
    builder::{CreateAllowedMentions, CreateMessage, EditMessage},
    client::{Client, Context, EventHandler},
    http::Http,
    model::{
        channel::{Message, ReactionType},
        gateway::{GatewayIntents, Ready},
        id::{ChannelId, MessageId as DiscordMessageId},
    },
};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

/// Discord channel plugin
pub struct DiscordChannel {
    token: SecretString,
    /// HTTP client (available after start)
    http: RwLock<Option<Arc<Http>>>,
    /// Shutdown signal
    shutdown_tx: RwLock<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl DiscordChannel {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            http: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Get the HTTP client
    async fn get_http(&self) -> Result<Arc<Http>> {
        let http = self.http.read().await;
        http.clone()
            .ok_or_else(|| Error::invalid("Discord client not initialized"))
    }
}

fn parse_id(id: &str, what: &str) -> Result<u64> {
    match id.parse::<u64>() {
        Ok(0) | Err(_) => Err(Error::invalid(format!("invalid {} id: {:?}", what, id))),
        Ok(id) => Ok(id),
    }
}

fn channel_id(target: &ChannelTarget) -> Result<ChannelId> {
    Ok(ChannelId::new(parse_id(&target.chat_id, "channel")?))
}

fn message_id(id: &str) -> Result<DiscordMessageId> {
    Ok(DiscordMessageId::new(parse_id(id, "message")?))
}

#[async_trait::async_trait]
impl ChannelPlugin for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self, ctx: Arc<ChannelContext>) -> Result<()> {
        let token = self.token.expose_secret();

        // Validate the token before connecting the gateway
        let http = Arc::new(Http::new(token));
        let me = http
            .get_current_user()
            .await
            .map_err(|e| Error::Authentication(e.to_string()))?;

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let handler = DiscordHandler {
            message_tx: ctx.message_tx.clone(),
            bot_id: me.id.get(),
        };

        let mut client = Client::builder(token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| Error::Authentication(e.to_string()))?;

        *self.http.write().await = Some(client.http.clone());

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        // Run client in background
        let shard_manager = client.shard_manager.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = client.start() => {
                    if let Err(e) = result {
                        error!(error = %e, "discord client stopped");
                    }
                }
                _ = &mut shutdown_rx => {
                    shard_manager.shutdown_all().await;
                }
            }
        });

        info!(bot = %me.name, "discord bot started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        *self.http.write().await = None;
        info!("discord bot stopped");
        Ok(())
    }

    async fn send_message(
        &self,
        target: &ChannelTarget,
        msg: &OutboundMessage,
    ) -> Result<MessageId> {
        let http = self.get_http().await?;
        let channel_id = channel_id(target)?;

        let mut builder = CreateMessage::new().content(&msg.content);
        if let Some(reply_to) = &msg.reply_to {
            builder = builder
                .reference_message((channel_id, message_id(reply_to)?))
                .allowed_mentions(CreateAllowedMentions::new().replied_user(false));
        }

        let sent = channel_id
            .send_message(&http, builder)
            .await
            .map_err(|e| Error::delivery(format!("send to {}", channel_id), e.to_string()))?;

        Ok(MessageId {
            id: sent.id.to_string(),
            channel: "discord".to_string(),
        })
    }

    async fn edit_message(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        msg: &OutboundMessage,
    ) -> Result<()> {
        let http = self.get_http().await?;
        let channel_id = channel_id(target)?;
        let msg_id = self::message_id(message_id)?;

        channel_id
            .edit_message(&http, msg_id, EditMessage::new().content(&msg.content))
            .await
            .map_err(|e| Error::delivery(format!("edit message {}", msg_id), e.to_string()))?;

        Ok(())
    }

    async fn add_reaction(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let http = self.get_http().await?;
        let reaction = ReactionType::Unicode(emoji.to_string());
        http.create_reaction(channel_id(target)?, self::message_id(message_id)?, &reaction)
            .await
            .map_err(|e| Error::delivery(format!("react to {}", message_id), e.to_string()))
    }

    async fn remove_reaction(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let http = self.get_http().await?;
        let reaction = ReactionType::Unicode(emoji.to_string());
        http.delete_reaction_me(channel_id(target)?, self::message_id(message_id)?, &reaction)
            .await
            .map_err(|e| Error::delivery(format!("unreact on {}", message_id), e.to_string()))
    }
}

/// Discord event handler
struct DiscordHandler {
    message_tx: mpsc::UnboundedSender<InboundMessage>,
    bot_id: u64,
}

impl DiscordHandler {
    /// Translate a Discord message, or None when it should not be seen
    fn to_inbound(&self, msg: &Message) -> Option<InboundMessage> {
        // Ignore our own and other bots' messages
        if msg.author.bot || msg.author.id.get() == self.bot_id {
            return None;
        }

        let mentioned = msg.mentions.iter().any(|u| u.id.get() == self.bot_id)
            || formatting::mentions_user(&msg.content, self.bot_id);

        let target = ChannelTarget::discord(msg.channel_id.get(), Some(msg.author.id.get()))
            .with_username(msg.author.name.clone());

        Some(InboundMessage {
            target,
            content: formatting::strip_mentions(&msg.content, self.bot_id),
            message_id: msg.id.to_string(),
            guild_id: msg.guild_id.map(|g| g.to_string()),
            is_dm: msg.guild_id.is_none(),
            mentioned,
        })
    }
}

#[serenity_async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(bot = %ready.user.name, guilds = ready.guilds.len(), "discord gateway connected");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let Some(inbound) = self.to_inbound(&msg) else {
            return;
        };
        debug!(
            channel_id = %inbound.target.chat_id,
            addressed = inbound.is_addressed(),
            "discord message received"
        );
        let _ = self.message_tx.send(inbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parsing() {
        assert_eq!(parse_id("123", "channel").unwrap(), 123);
        assert!(parse_id("0", "channel").is_err());
        assert!(parse_id("abc", "message").is_err());

        let target = ChannelTarget::discord(987, None);
        assert_eq!(channel_id(&target).unwrap().get(), 987);
    }

    #[tokio::test]
    async fn test_calls_before_start_fail() {
        let plugin = DiscordChannel::new(SecretString::from("token".to_string()));
        let target = ChannelTarget::discord(1, None);
        let err = plugin
            .send_message(&target, &OutboundMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(plugin.stop().await.is_ok());
    }
}
