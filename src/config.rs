//! Persisted bridge configuration.
//!
//! The whole document lives in one TOML file. It is read fully and written
//! fully on every mutation; [`ConfigStore`] serializes writers inside this
//! process and picks up edits made by other processes (the CLI) by watching
//! the file's modification time and size.

use crate::channels::stream::StreamConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Session name that grants access to every session.
pub const ALL_SESSIONS: &str = "*";

/// Who may talk to the bot when no more specific rule applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Everyone (blocked users excepted)
    All,
    /// Users holding an approved grant; unknown users receive a pairing code
    #[default]
    Paired,
    /// Only users granted directly from the CLI
    None,
}

impl AccessPolicy {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" | "open" => Some(AccessPolicy::All),
            "paired" | "pairing" => Some(AccessPolicy::Paired),
            "none" | "closed" => Some(AccessPolicy::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccessPolicy::All => "all",
            AccessPolicy::Paired => "paired",
            AccessPolicy::None => "none",
        };
        f.write_str(s)
    }
}

/// Routing of one Discord channel to an assistant session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelMapping {
    /// Assistant session name
    pub session: String,
    /// Respond to every message in the channel, not only mentions
    #[serde(default)]
    pub respond_to_all: bool,
    /// Only these user IDs may use the channel (absent = no restriction)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_allowlist: Option<Vec<String>>,
    /// When the mapping was created
    pub created_at: DateTime<Utc>,
}

impl ChannelMapping {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            respond_to_all: false,
            user_allowlist: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the mapping's allowlist admits `user_id`
    pub fn admits(&self, user_id: &str) -> bool {
        match &self.user_allowlist {
            Some(list) => list.iter().any(|u| u == user_id),
            None => true,
        }
    }
}

/// Lifecycle of a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PairingStatus::Pending => "pending",
            PairingStatus::Approved => "approved",
            PairingStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A user asking for access to a session. Kept after resolution for history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PairingRequest {
    pub code: String,
    pub user_id: String,
    pub display_name: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub session: String,
    pub status: PairingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Access held by one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserGrant {
    /// Session names the user may use ("*" = all)
    #[serde(default)]
    pub sessions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
    /// Pairing code that produced the grant, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

impl UserGrant {
    /// Whether the grant covers `session`
    pub fn covers(&self, session: &str) -> bool {
        self.sessions.contains(session) || self.sessions.contains(ALL_SESSIONS)
    }
}

/// The persisted document
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Bot token (or env var reference like ${DISCORD_BOT_TOKEN})
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Restrict guild traffic to this guild (DMs always pass)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<u64>,

    /// Create a session automatically for unmapped channels
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,

    /// Access policy for users
    #[serde(default)]
    pub default_access: AccessPolicy,

    /// Path of the assistant host socket (supports ~ expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_socket: Option<String>,

    /// Streaming output tuning
    #[serde(default)]
    pub stream: StreamConfig,

    /// Channel id -> mapping
    #[serde(default)]
    pub mappings: BTreeMap<String, ChannelMapping>,

    /// User id -> grant
    #[serde(default)]
    pub users: BTreeMap<String, UserGrant>,

    /// Pairing code -> request
    #[serde(default)]
    pub pairing_requests: BTreeMap<String, PairingRequest>,
}

fn default_auto_create() -> bool {
    true
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            token: None,
            guild_id: None,
            auto_create: default_auto_create(),
            default_access: AccessPolicy::default(),
            host_socket: None,
            stream: StreamConfig::default(),
            mappings: BTreeMap::new(),
            users: BTreeMap::new(),
            pairing_requests: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Resolve bot token from environment if needed
    pub fn resolve_token(&self) -> Option<SecretString> {
        self.token.as_ref().and_then(|token| {
            if token.starts_with("${") && token.ends_with('}') {
                let env_var = &token[2..token.len() - 1];
                std::env::var(env_var).ok().map(SecretString::from)
            } else if token.is_empty() {
                None
            } else {
                Some(SecretString::from(token.clone()))
            }
        })
    }

    /// Host socket path with ~ expanded
    pub fn resolve_host_socket(&self) -> PathBuf {
        match &self.host_socket {
            Some(path) => expand_home(path),
            None => default_dir().join("host.sock"),
        }
    }
}

/// Expand ~ in a path
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".discord-bridge")
}

/// Default location of the config document
pub fn default_config_path() -> PathBuf {
    default_dir().join("config.toml")
}

/// Modification time and size of the file
type FileStamp = (SystemTime, u64);

struct Cached {
    config: BridgeConfig,
    /// Stamp of the file when last loaded or written
    stamp: Option<FileStamp>,
}

/// Owner of the persisted document
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<Cached>,
}

impl ConfigStore {
    /// Open the store, loading the document if it exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let (config, stamp) = load_file(&path)?;
        Ok(Arc::new(Self {
            path,
            state: Mutex::new(Cached { config, stamp }),
        }))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document
    pub fn read<T>(&self, f: impl FnOnce(&BridgeConfig) -> T) -> T {
        let mut cached = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut cached);
        f(&cached.config)
    }

    /// Clone the current document
    pub fn snapshot(&self) -> BridgeConfig {
        self.read(BridgeConfig::clone)
    }

    /// Apply a mutation and write the whole document back.
    ///
    /// `f` works on a copy: when it fails neither the file nor the cached
    /// document changes. When the write fails the mutation stays applied in
    /// memory and the error is returned.
    pub fn update<T>(&self, f: impl FnOnce(&mut BridgeConfig) -> Result<T>) -> Result<T> {
        let mut cached = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut cached);
        let mut draft = cached.config.clone();
        let value = f(&mut draft)?;
        cached.config = draft;
        cached.stamp = write_file(&self.path, &cached.config)?;
        Ok(value)
    }

    /// Reload from disk when another process changed the file
    fn refresh(&self, cached: &mut Cached) {
        let current = file_stamp(&self.path);
        if current.is_none() || current == cached.stamp {
            return;
        }
        match load_file(&self.path) {
            Ok((config, stamp)) => {
                tracing::debug!(path = %self.path.display(), "config reloaded from disk");
                cached.config = config;
                cached.stamp = stamp;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "keeping cached config");
            }
        }
    }
}

fn file_stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn load_file(path: &Path) -> Result<(BridgeConfig, Option<FileStamp>)> {
    if !path.exists() {
        return Ok((BridgeConfig::default(), None));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    let config: BridgeConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok((config, file_stamp(path)))
}

fn write_file(path: &Path, config: &BridgeConfig) -> Result<Option<FileStamp>> {
    let content = toml::to_string_pretty(config).map_err(|e| Error::Config(e.to_string()))?;
    let persist = |source: std::io::Error| Error::ConfigPersistence {
        path: path.to_path_buf(),
        source,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(persist)?;
        }
    }

    // Write then rename
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content).map_err(persist)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).map_err(persist)?;
    }
    std::fs::rename(&tmp, path).map_err(persist)?;

    Ok(file_stamp(path))
}
