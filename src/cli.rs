//! Command line interface: bridge administration and the bot runner.

use crate::channels::auth::AccessGate;
use crate::channels::manager::BridgeStatus;
use crate::channels::session_map::SessionRouter;
use crate::config::{AccessPolicy, ChannelMapping, ConfigStore, PairingStatus};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "discord-bridge",
    version,
    about = "Bridge a Discord bot to an assistant host"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: ~/.discord-bridge/config.toml)
    #[arg(long, global = true, env = "DISCORD_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Set the bot token (a literal token or an env reference like ${DISCORD_BOT_TOKEN})
    Token { token: String },
    /// Show configuration summary and host availability
    Status,
    /// Set the default access policy
    Access {
        #[arg(value_parser = parse_policy)]
        policy: AccessPolicy,
    },
    /// Restrict guild traffic to one guild (omit the id to allow all guilds)
    Guild { guild_id: Option<u64> },
    /// Manage pairing requests
    Pairing {
        #[command(subcommand)]
        action: PairingAction,
    },
    /// Manage user grants
    Users {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Map a channel to a session
    Map {
        channel_id: String,
        session: String,
        /// Answer every message in the channel, not only mentions
        #[arg(long)]
        respond_to_all: bool,
        /// Only these user IDs may use the channel (repeatable)
        #[arg(long = "allow", value_name = "USER_ID")]
        allow: Vec<String>,
    },
    /// Remove a channel mapping
    Unmap { channel_id: String },
    /// List channel mappings
    Mappings,
    /// Toggle automatic session creation for unmapped channels
    AutoCreate {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Run the bot until interrupted
    Run,
}

#[derive(Subcommand, Debug)]
pub enum PairingAction {
    /// List pairing requests
    List {
        /// Include approved and rejected requests
        #[arg(long)]
        all: bool,
    },
    /// Approve a pending request
    Approve { code: String },
    /// Reject a pending request
    Reject { code: String },
}

#[derive(Subcommand, Debug)]
pub enum UserAction {
    /// List users and their grants
    List,
    /// Grant a session (default: every session)
    Grant {
        user_id: String,
        #[arg(default_value = crate::config::ALL_SESSIONS)]
        session: String,
    },
    /// Revoke a session (default: every session)
    Revoke {
        user_id: String,
        session: Option<String>,
    },
    /// Block a user from all sessions
    Block {
        user_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Lift a block
    Unblock { user_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

fn parse_policy(s: &str) -> std::result::Result<AccessPolicy, String> {
    AccessPolicy::parse(s).ok_or_else(|| format!("unknown policy '{}' (all, paired, none)", s))
}

impl Args {
    /// Config path, falling back to the default location
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::default_config_path)
    }
}

/// Execute an administrative command and return what to print.
///
/// `Run` is not handled here; see [`run_bridge`].
pub async fn execute(command: Command, store: Arc<ConfigStore>) -> Result<String> {
    let mut out = String::new();
    match command {
        Command::Token { token } => {
            let token = token.trim().to_string();
            if token.is_empty() {
                anyhow::bail!("token cannot be empty");
            }
            store.update(|cfg| {
                cfg.token = Some(token);
                Ok(())
            })?;
            writeln!(out, "Token saved to {}", store.path().display())?;
        }
        Command::Status => {
            let host_socket = store.read(|cfg| cfg.resolve_host_socket());
            let status = status_for(&store, host_socket).await;
            write_status(&mut out, &status, &store)?;
        }
        Command::Access { policy } => {
            store.update(|cfg| {
                cfg.default_access = policy;
                Ok(())
            })?;
            writeln!(out, "Access policy set to {}", policy)?;
        }
        Command::Guild { guild_id } => {
            store.update(|cfg| {
                cfg.guild_id = guild_id;
                Ok(())
            })?;
            match guild_id {
                Some(id) => writeln!(out, "Guild traffic restricted to {}", id)?,
                None => writeln!(out, "Guild restriction cleared")?,
            }
        }
        Command::Pairing { action } => pairing(&mut out, AccessGate::new(store), action)?,
        Command::Users { action } => users(&mut out, AccessGate::new(store), action)?,
        Command::Map {
            channel_id,
            session,
            respond_to_all,
            allow,
        } => {
            let mut mapping = ChannelMapping::new(session.clone());
            mapping.respond_to_all = respond_to_all;
            if !allow.is_empty() {
                mapping.user_allowlist = Some(allow);
            }
            let previous = SessionRouter::new(store).map_channel(&channel_id, mapping)?;
            match previous {
                Some(old) if old.session != session => writeln!(
                    out,
                    "Channel {} remapped from {} to {}",
                    channel_id, old.session, session
                )?,
                _ => writeln!(out, "Channel {} mapped to {}", channel_id, session)?,
            }
        }
        Command::Unmap { channel_id } => {
            let removed = SessionRouter::new(store).unmap_channel(&channel_id)?;
            writeln!(
                out,
                "Channel {} unmapped (was {})",
                channel_id, removed.session
            )?;
        }
        Command::Mappings => {
            let mappings = SessionRouter::new(store).list_mappings();
            if mappings.is_empty() {
                writeln!(out, "No channel mappings")?;
            }
            for (channel_id, m) in mappings {
                let mut flags = Vec::new();
                if m.respond_to_all {
                    flags.push("respond-to-all".to_string());
                }
                if let Some(list) = &m.user_allowlist {
                    flags.push(format!("allow={}", list.join(",")));
                }
                writeln!(
                    out,
                    "{:<20} {:<24} {}  {}",
                    channel_id,
                    m.session,
                    m.created_at.format("%Y-%m-%d %H:%M"),
                    flags.join(" ")
                )?;
            }
        }
        Command::AutoCreate { state } => {
            let enabled = state == Toggle::On;
            store.update(|cfg| {
                cfg.auto_create = enabled;
                Ok(())
            })?;
            writeln!(
                out,
                "Auto-create {}",
                if enabled { "enabled" } else { "disabled" }
            )?;
        }
        Command::Run => anyhow::bail!("use run_bridge to run the bot"),
    }
    Ok(out)
}

fn pairing(out: &mut String, gate: AccessGate, action: PairingAction) -> Result<()> {
    match action {
        PairingAction::List { all } => {
            let filter = if all { None } else { Some(PairingStatus::Pending) };
            let requests = gate.list_pairing_requests(filter);
            if requests.is_empty() {
                writeln!(out, "No pairing requests")?;
            }
            for r in requests {
                writeln!(
                    out,
                    "{}  {:<8}  {} ({})  session={}  {}",
                    r.code,
                    r.status,
                    r.display_name,
                    r.user_id,
                    r.session,
                    r.created_at.format("%Y-%m-%d %H:%M")
                )?;
            }
        }
        PairingAction::Approve { code } => {
            let request = gate.approve(&code)?;
            writeln!(
                out,
                "Approved {} ({}) for session {}",
                request.display_name, request.user_id, request.session
            )?;
        }
        PairingAction::Reject { code } => {
            let request = gate.reject(&code)?;
            writeln!(
                out,
                "Rejected {} ({})",
                request.display_name, request.user_id
            )?;
        }
    }
    Ok(())
}

fn users(out: &mut String, gate: AccessGate, action: UserAction) -> Result<()> {
    match action {
        UserAction::List => {
            let users = gate.list_users();
            if users.is_empty() {
                writeln!(out, "No users")?;
            }
            for (user_id, grant) in users {
                let sessions: Vec<&str> = grant.sessions.iter().map(String::as_str).collect();
                let mut line = format!("{:<20} sessions={}", user_id, sessions.join(","));
                if grant.blocked {
                    line.push_str("  BLOCKED");
                    if let Some(reason) = &grant.block_reason {
                        let _ = write!(line, " ({})", reason);
                    }
                }
                writeln!(out, "{}", line)?;
            }
        }
        UserAction::Grant { user_id, session } => {
            gate.grant(&user_id, &session)?;
            writeln!(out, "Granted {} to {}", session, user_id)?;
        }
        UserAction::Revoke { user_id, session } => {
            let removed = gate.revoke(&user_id, session.as_deref())?;
            let what = session.as_deref().unwrap_or("all sessions");
            if removed {
                writeln!(out, "Revoked {} from {}", what, user_id)?;
            } else {
                writeln!(out, "{} had no grant for {}", user_id, what)?;
            }
        }
        UserAction::Block { user_id, reason } => {
            gate.block(&user_id, reason)?;
            writeln!(out, "Blocked {}", user_id)?;
        }
        UserAction::Unblock { user_id } => {
            if gate.unblock(&user_id)? {
                writeln!(out, "Unblocked {}", user_id)?;
            } else {
                writeln!(out, "{} was not blocked", user_id)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn status_for(store: &ConfigStore, host_socket: PathBuf) -> BridgeStatus {
    let host = crate::host::SocketHost::new(host_socket);
    BridgeStatus::collect(store, &host).await
}

#[cfg(not(unix))]
async fn status_for(store: &ConfigStore, _host_socket: PathBuf) -> BridgeStatus {
    BridgeStatus::from_config(store)
}

fn write_status(out: &mut String, status: &BridgeStatus, store: &ConfigStore) -> Result<()> {
    let host_socket = store.read(|cfg| cfg.resolve_host_socket());
    writeln!(out, "Config:          {}", store.path().display())?;
    writeln!(
        out,
        "Token:           {}",
        if status.token_configured { "configured" } else { "missing" }
    )?;
    writeln!(out, "Access policy:   {}", status.access_policy)?;
    writeln!(
        out,
        "Auto-create:     {}",
        if status.auto_create { "on" } else { "off" }
    )?;
    match status.guild_id {
        Some(id) => writeln!(out, "Guild:           {}", id)?,
        None => writeln!(out, "Guild:           any")?,
    }
    writeln!(out, "Mappings:        {}", status.mappings)?;
    writeln!(out, "Users:           {}", status.users)?;
    writeln!(out, "Pending pairing: {}", status.pending_pairings)?;
    writeln!(
        out,
        "Host:            {} ({})",
        host_socket.display(),
        if status.host_available { "available" } else { "unavailable" }
    )?;
    if let Some(active) = status.active_streams {
        writeln!(out, "Active streams:  {}", active)?;
    }
    Ok(())
}

/// Log in, serve messages until Ctrl-C, then shut down.
#[cfg(all(unix, feature = "discord"))]
pub async fn run_bridge(store: Arc<ConfigStore>) -> Result<()> {
    use crate::channels::discord::DiscordChannel;
    use crate::channels::manager::BridgeManager;
    use crate::host::{AssistantHost, SocketHost};
    use anyhow::Context as _;
    use tracing::{info, warn};

    let config = store.snapshot();
    let token = config
        .resolve_token()
        .context("no bot token configured; run `discord-bridge token <TOKEN>`")?;

    let host = Arc::new(SocketHost::new(config.resolve_host_socket()));
    if !host.is_available().await {
        warn!(socket = %host.socket_path().display(), "assistant host socket not found");
    }

    let platform = Arc::new(DiscordChannel::new(token));
    let manager = BridgeManager::new(store, platform, host);
    manager.start().await?;

    let runner = tokio::spawn(manager.clone().run());
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    manager.stop().await?;
    runner.abort();
    Ok(())
}

#[cfg(not(all(unix, feature = "discord")))]
pub async fn run_bridge(_store: Arc<ConfigStore>) -> Result<()> {
    anyhow::bail!("built without Discord support (enable the `discord` feature on a Unix target)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, Arc<ConfigStore>) {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.toml")).unwrap();
        (dir, store)
    }

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["discord-bridge"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn test_parse_commands() {
        assert!(matches!(
            parse(&["access", "paired"]),
            Command::Access {
                policy: AccessPolicy::Paired
            }
        ));
        assert!(Args::try_parse_from(["discord-bridge", "access", "maybe"]).is_err());

        match parse(&["users", "grant", "42"]) {
            Command::Users {
                action: UserAction::Grant { user_id, session },
            } => {
                assert_eq!(user_id, "42");
                assert_eq!(session, "*");
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse(&["map", "100", "dev", "--allow", "1", "--allow", "2"]) {
            Command::Map { allow, .. } => assert_eq!(allow, vec!["1", "2"]),
            other => panic!("unexpected {:?}", other),
        }

        let args =
            Args::try_parse_from(["discord-bridge", "--config", "/tmp/x.toml", "status"]).unwrap();
        assert_eq!(args.config_path(), PathBuf::from("/tmp/x.toml"));
    }

    #[tokio::test]
    async fn test_admin_commands_update_store() {
        let (_dir, store) = test_store();

        execute(parse(&["token", "abc"]), store.clone()).await.unwrap();
        execute(parse(&["access", "none"]), store.clone())
            .await
            .unwrap();
        execute(parse(&["auto-create", "off"]), store.clone())
            .await
            .unwrap();
        execute(parse(&["guild", "77"]), store.clone()).await.unwrap();

        let cfg = store.snapshot();
        assert_eq!(cfg.token.as_deref(), Some("abc"));
        assert_eq!(cfg.default_access, AccessPolicy::None);
        assert!(!cfg.auto_create);
        assert_eq!(cfg.guild_id, Some(77));
    }

    #[tokio::test]
    async fn test_mapping_commands() {
        let (_dir, store) = test_store();

        let out = execute(parse(&["map", "100", "dev", "--respond-to-all"]), store.clone())
            .await
            .unwrap();
        assert!(out.contains("mapped to dev"));

        let out = execute(parse(&["map", "100", "ops"]), store.clone())
            .await
            .unwrap();
        assert!(out.contains("remapped from dev to ops"));

        let out = execute(parse(&["mappings"]), store.clone()).await.unwrap();
        assert!(out.contains("100"));
        assert!(out.contains("ops"));

        execute(parse(&["unmap", "100"]), store.clone())
            .await
            .unwrap();
        assert!(execute(parse(&["unmap", "100"]), store.clone())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pairing_and_user_commands() {
        let (_dir, store) = test_store();
        let gate = AccessGate::new(store.clone());
        let ticket = gate
            .request_pairing(
                &crate::channels::auth::PairingRequester {
                    user_id: "42".to_string(),
                    display_name: "ada".to_string(),
                    channel_id: "100".to_string(),
                    guild_id: None,
                },
                "dev",
            )
            .unwrap();

        let out = execute(parse(&["pairing", "list"]), store.clone())
            .await
            .unwrap();
        assert!(out.contains(&ticket.code));

        let out = execute(parse(&["pairing", "approve", ticket.code.as_str()]), store.clone())
            .await
            .unwrap();
        assert!(out.contains("Approved ada (42) for session dev"));

        let out = execute(parse(&["pairing", "list"]), store.clone())
            .await
            .unwrap();
        assert_eq!(out, "No pairing requests\n");

        execute(
            parse(&["users", "block", "42", "--reason", "spam"]),
            store.clone(),
        )
        .await
        .unwrap();
        let out = execute(parse(&["users", "list"]), store.clone())
            .await
            .unwrap();
        assert!(out.contains("sessions=dev"));
        assert!(out.contains("BLOCKED (spam)"));

        let out = execute(parse(&["users", "revoke", "42"]), store.clone())
            .await
            .unwrap();
        assert!(out.contains("Revoked all sessions from 42"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_reports_missing_host() {
        let (dir, store) = test_store();
        let socket = dir.path().join("missing.sock");
        store
            .update(|cfg| {
                cfg.host_socket = Some(socket.to_string_lossy().to_string());
                Ok(())
            })
            .unwrap();

        let out = execute(Command::Status, store.clone()).await.unwrap();
        assert!(out.contains("Token:           missing"));
        assert!(out.contains("unavailable"));
        assert!(out.contains("Access policy:   paired"));
    }
}
