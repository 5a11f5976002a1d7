//! Routing of Discord channels to assistant sessions.

use crate::config::{ChannelMapping, ConfigStore};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Prefix of automatically created session names
pub const AUTO_SESSION_PREFIX: &str = "discord-";

/// A resolved route for an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel_id: String,
    pub mapping: ChannelMapping,
    /// The mapping was created for this message
    pub created: bool,
}

impl Route {
    pub fn session(&self) -> &str {
        &self.mapping.session
    }
}

/// Session name used when a channel is mapped automatically
pub fn auto_session_name(channel_id: &str) -> String {
    format!("{}{}", AUTO_SESSION_PREFIX, channel_id)
}

/// Maps channel IDs to session names via the persisted config
pub struct SessionRouter {
    store: Arc<ConfigStore>,
}

impl SessionRouter {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Find the session for a channel.
    ///
    /// Returns None when the message comes from a guild other than the
    /// configured one, or when the channel is unmapped and auto-create is
    /// off. DMs pass the guild filter.
    pub fn resolve(&self, channel_id: &str, guild_id: Option<&str>) -> Result<Option<Route>> {
        if !self.accepts_guild(guild_id) {
            return Ok(None);
        }

        let (existing, auto_create) = self
            .store
            .read(|cfg| (cfg.mappings.get(channel_id).cloned(), cfg.auto_create));

        if let Some(mapping) = existing {
            return Ok(Some(Route {
                channel_id: channel_id.to_string(),
                mapping,
                created: false,
            }));
        }

        if !auto_create {
            return Ok(None);
        }

        let result = self.store.update(|cfg| {
            // Another writer may have mapped the channel in the meantime
            let mapping = cfg
                .mappings
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelMapping::new(auto_session_name(channel_id)));
            Ok(mapping.clone())
        });

        let mapping = match result {
            Ok(mapping) => mapping,
            Err(Error::ConfigPersistence { path, source }) => {
                // The mapping still holds in memory for this process
                warn!(
                    channel_id = %channel_id,
                    path = %path.display(),
                    error = %source,
                    "auto-created mapping not persisted"
                );
                self.store
                    .read(|cfg| cfg.mappings.get(channel_id).cloned())
                    .ok_or_else(|| Error::not_found(format!("mapping for {}", channel_id)))?
            }
            Err(e) => return Err(e),
        };

        info!(channel_id = %channel_id, session = %mapping.session, "auto-created session mapping");
        Ok(Some(Route {
            channel_id: channel_id.to_string(),
            mapping,
            created: true,
        }))
    }

    /// Whether messages from `guild_id` are served. DMs always are.
    pub fn accepts_guild(&self, guild_id: Option<&str>) -> bool {
        let allowed = self.store.read(|cfg| cfg.guild_id);
        match (allowed, guild_id) {
            (Some(allowed), Some(guild)) => guild == allowed.to_string(),
            _ => true,
        }
    }

    /// Whether the channel is mapped with respond-to-all set
    pub fn responds_to_all(&self, channel_id: &str) -> bool {
        self.store.read(|cfg| {
            cfg.mappings
                .get(channel_id)
                .is_some_and(|m| m.respond_to_all)
        })
    }

    /// Map a channel explicitly, replacing any previous mapping
    pub fn map_channel(
        &self,
        channel_id: &str,
        mapping: ChannelMapping,
    ) -> Result<Option<ChannelMapping>> {
        validate_channel_id(channel_id)?;
        validate_session_name(&mapping.session)?;
        self.store
            .update(|cfg| Ok(cfg.mappings.insert(channel_id.to_string(), mapping)))
    }

    /// Remove a channel's mapping
    pub fn unmap_channel(&self, channel_id: &str) -> Result<ChannelMapping> {
        self.store.update(|cfg| {
            cfg.mappings
                .remove(channel_id)
                .ok_or_else(|| Error::not_found(format!("no mapping for channel {}", channel_id)))
        })
    }

    /// All mappings ordered by channel ID
    pub fn list_mappings(&self) -> Vec<(String, ChannelMapping)> {
        self.store.read(|cfg| {
            cfg.mappings
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect()
        })
    }
}

fn validate_channel_id(channel_id: &str) -> Result<()> {
    if channel_id.is_empty() || !channel_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::invalid(format!(
            "channel id must be numeric: {:?}",
            channel_id
        )));
    }
    Ok(())
}

fn validate_session_name(session: &str) -> Result<()> {
    if session.is_empty() || session.chars().any(char::is_whitespace) {
        return Err(Error::invalid(format!("invalid session name: {:?}", session)));
    }
    Ok(())
}
