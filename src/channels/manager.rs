//! Bridge manager: routes inbound messages through the session router and
//! access gate, injects them into the assistant host, and streams the reply
//! back through the reconciler.

use super::auth::{AccessDecision, AccessGate, PairingRequester, PairingTicket};
use super::history::ChannelHistory;
use super::plugin::{ChannelContext, ChannelPlugin, ChannelTarget, InboundMessage, OutboundMessage};
use super::session_map::{Route, SessionRouter};
use super::stream::{StreamRegistry, StreamSummary};
use crate::config::{ConfigStore, PairingStatus};
use crate::error::{Error, Result};
use crate::host::{AssistantHost, HostEvent, InjectOptions};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reaction while a message is being processed
pub const REACTION_WORKING: &str = "👀";
/// Reaction after a successful reply
pub const REACTION_SUCCESS: &str = "✅";
/// Reaction after a failed reply
pub const REACTION_FAILURE: &str = "❌";

/// Upper bound for any single reaction update
const REACTION_TIMEOUT: Duration = Duration::from_secs(5);

const GENERIC_ERROR_REPLY: &str = "⚠️ Something went wrong while generating a response.";
const NO_ACCESS_REPLY: &str = "🚫 You don't have access to this assistant.";
const PAIRING_REJECTED_REPLY: &str = "🚫 Your access request was declined.";

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Not for us (empty, filtered guild, unmapped channel, blocked user)
    Ignored,
    /// Kept as channel context for a later message
    Recorded,
    /// The user was told about their pairing state
    Pairing(PairingStatus),
    /// The user was told they have no access
    Refused,
    /// The reply streamed to completion
    Completed(StreamSummary),
    /// The host failed; partial output was kept and an error posted
    Failed(String),
    /// A newer message for the same session took over the stream
    Superseded,
}

/// Point-in-time view of the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub token_configured: bool,
    pub access_policy: String,
    pub auto_create: bool,
    pub guild_id: Option<u64>,
    pub mappings: usize,
    pub users: usize,
    pub pending_pairings: usize,
    pub host_available: bool,
    /// Streams in flight (None when the bot is not running here)
    pub active_streams: Option<usize>,
}

impl BridgeStatus {
    /// Gather status from the config document and the host
    pub async fn collect(store: &ConfigStore, host: &dyn AssistantHost) -> Self {
        let mut status = Self::from_config(store);
        status.host_available = host.is_available().await;
        status
    }

    /// Status from the config document alone
    pub fn from_config(store: &ConfigStore) -> Self {
        store.read(|cfg| Self {
            token_configured: cfg.resolve_token().is_some(),
            access_policy: cfg.default_access.to_string(),
            auto_create: cfg.auto_create,
            guild_id: cfg.guild_id,
            mappings: cfg.mappings.len(),
            users: cfg.users.len(),
            pending_pairings: cfg
                .pairing_requests
                .values()
                .filter(|r| r.status == PairingStatus::Pending)
                .count(),
            host_available: false,
            active_streams: None,
        })
    }
}

/// Owns the bridge's components and drives message handling
pub struct BridgeManager {
    platform: Arc<dyn ChannelPlugin>,
    host: Arc<dyn AssistantHost>,
    store: Arc<ConfigStore>,
    router: SessionRouter,
    gate: AccessGate,
    streams: StreamRegistry,
    history: ChannelHistory,
    /// Inbound message receiver
    message_rx: RwLock<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    /// Message sender for the platform
    message_tx: mpsc::UnboundedSender<InboundMessage>,
}

impl BridgeManager {
    pub fn new(
        store: Arc<ConfigStore>,
        platform: Arc<dyn ChannelPlugin>,
        host: Arc<dyn AssistantHost>,
    ) -> Arc<Self> {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let stream_config = store.read(|cfg| cfg.stream.clone());

        Arc::new(Self {
            router: SessionRouter::new(store.clone()),
            gate: AccessGate::new(store.clone()),
            streams: StreamRegistry::new(platform.clone(), stream_config),
            history: ChannelHistory::default(),
            message_rx: RwLock::new(Some(message_rx)),
            message_tx,
            platform,
            host,
            store,
        })
    }

    /// Get the channel context for the platform
    pub fn get_context(&self) -> Arc<ChannelContext> {
        Arc::new(ChannelContext {
            message_tx: self.message_tx.clone(),
        })
    }

    /// Log in and start receiving events. Authentication failures are fatal.
    pub async fn start(&self) -> Result<()> {
        info!(platform = %self.platform.name(), "starting platform");
        self.platform.start(self.get_context()).await
    }

    /// Drop all streams and disconnect
    pub async fn stop(&self) -> Result<()> {
        info!(
            platform = %self.platform.name(),
            active_streams = self.streams.active_count(),
            "stopping platform"
        );
        self.streams.abort_all();
        self.platform.stop().await
    }

    /// Current status including in-flight streams
    pub async fn status(&self) -> BridgeStatus {
        let mut status = BridgeStatus::collect(&self.store, self.host.as_ref()).await;
        status.active_streams = Some(self.streams.active_count());
        status
    }

    /// Run the message processing loop. Each message is handled in its own
    /// task so slow replies never hold up other channels.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut message_rx = self
            .message_rx
            .write()
            .await
            .take()
            .ok_or_else(|| Error::invalid("bridge already running"))?;

        while let Some(msg) = message_rx.recv().await {
            let manager = self.clone();
            tokio::spawn(async move {
                let message_id = msg.message_id.clone();
                match manager.handle_inbound_message(msg).await {
                    Ok(handled) => debug!(message_id = %message_id, ?handled, "message handled"),
                    Err(e) => warn!(message_id = %message_id, error = %e, "error handling message"),
                }
            });
        }

        Ok(())
    }

    /// Handle one inbound message from the platform
    pub async fn handle_inbound_message(&self, msg: InboundMessage) -> Result<Handled> {
        if msg.content.trim().is_empty() {
            return Ok(Handled::Ignored);
        }

        let channel_id = msg.target.chat_id.as_str();
        if !self.router.accepts_guild(msg.guild_id.as_deref()) {
            return Ok(Handled::Ignored);
        }

        if !msg.is_addressed() && !self.router.responds_to_all(channel_id) {
            self.history
                .record(channel_id, msg.display_name(), &msg.content);
            return Ok(Handled::Recorded);
        }

        let Some(route) = self
            .router
            .resolve(channel_id, msg.guild_id.as_deref())?
        else {
            debug!(channel_id = %channel_id, "no session for channel");
            return Ok(Handled::Ignored);
        };

        match self
            .gate
            .authorize(msg.user_id(), route.session(), Some(&route.mapping))
        {
            AccessDecision::Allowed => self.process_authorized_message(msg, route).await,
            AccessDecision::PairingRequired => self.handle_pairing(&msg, &route).await,
            AccessDecision::Denied => {
                self.reply(&msg, NO_ACCESS_REPLY).await;
                Ok(Handled::Refused)
            }
            AccessDecision::Blocked | AccessDecision::NotListed => {
                debug!(user_id = %msg.user_id(), session = %route.session(), "ignoring user");
                Ok(Handled::Ignored)
            }
        }
    }

    /// Issue or remind about a pairing code
    async fn handle_pairing(&self, msg: &InboundMessage, route: &Route) -> Result<Handled> {
        let requester = PairingRequester {
            user_id: msg.user_id().to_string(),
            display_name: msg.display_name().to_string(),
            channel_id: msg.target.chat_id.clone(),
            guild_id: msg.guild_id.clone(),
        };
        let ticket = self.gate.request_pairing(&requester, route.session())?;
        self.reply(msg, &pairing_reply(&ticket)).await;
        Ok(Handled::Pairing(ticket.status))
    }

    /// Inject the message and stream the reply
    async fn process_authorized_message(
        &self,
        msg: InboundMessage,
        route: Route,
    ) -> Result<Handled> {
        let session = route.session().to_string();
        let working = self.spawn_reaction(&msg, REACTION_WORKING);

        let options = InjectOptions {
            sender: Some(msg.display_name().to_string()),
            context: self.history.take(&msg.target.chat_id),
        };
        let stream = self
            .streams
            .open(&session, msg.target.clone(), Some(msg.message_id.clone()));

        let mut failure = None;
        match self.host.inject(&session, &msg.content, options).await {
            Ok(mut events) => {
                let mut streamed_any = false;
                loop {
                    match events.next().await {
                        Some(HostEvent::Text { content }) => {
                            streamed_any = true;
                            if !stream.push(content) {
                                break;
                            }
                        }
                        Some(HostEvent::Done { final_text }) => {
                            if let Some(text) = final_text.filter(|_| !streamed_any) {
                                stream.push(text);
                            }
                            break;
                        }
                        Some(HostEvent::Error { message }) => {
                            failure = Some(message);
                            break;
                        }
                        Some(HostEvent::Pong) => {}
                        None => {
                            failure = Some("host stream ended without completing".to_string());
                            break;
                        }
                    }
                }
            }
            Err(e) => failure = Some(e.to_string()),
        }

        // Flush whatever arrived, even on failure
        let summary = stream.close().await;

        let handled = match (summary, failure) {
            (None, _) => {
                info!(session = %session, "stream superseded by a newer message");
                Handled::Superseded
            }
            (Some(_), Some(error)) => {
                warn!(session = %session, error = %error, "injection failed");
                self.reply(&msg, GENERIC_ERROR_REPLY).await;
                Handled::Failed(error)
            }
            (Some(summary), None) => {
                info!(
                    session = %session,
                    messages = summary.messages_created,
                    edits = summary.edits,
                    failures = summary.delivery_failures,
                    "reply delivered"
                );
                Handled::Completed(summary)
            }
        };

        let outcome = match handled {
            Handled::Completed(_) => REACTION_SUCCESS,
            _ => REACTION_FAILURE,
        };
        self.finish_reaction(&msg, working, outcome).await;

        Ok(handled)
    }

    /// Post a plain reply to an inbound message. Failures are logged.
    async fn reply(&self, msg: &InboundMessage, text: &str) {
        let out = OutboundMessage::text(text).with_reply(msg.message_id.clone());
        if let Err(e) = self.platform.send_message(&msg.target, &out).await {
            warn!(channel_id = %msg.target.chat_id, error = %e, "failed to send reply");
        }
    }

    /// Add a reaction without waiting for it
    fn spawn_reaction(&self, msg: &InboundMessage, emoji: &'static str) -> JoinHandle<()> {
        let platform = self.platform.clone();
        let target = msg.target.clone();
        let message_id = msg.message_id.clone();
        tokio::spawn(async move {
            react(platform.as_ref(), &target, &message_id, emoji).await;
        })
    }

    /// Swap the working reaction for the outcome
    async fn finish_reaction(
        &self,
        msg: &InboundMessage,
        working: JoinHandle<()>,
        outcome: &'static str,
    ) {
        // The working reaction must land before it can be removed
        if tokio::time::timeout(REACTION_TIMEOUT, working).await.is_err() {
            warn!(message_id = %msg.message_id, "working reaction timed out");
        }

        let removal = tokio::time::timeout(
            REACTION_TIMEOUT,
            self.platform
                .remove_reaction(&msg.target, &msg.message_id, REACTION_WORKING),
        )
        .await;
        match removal {
            Ok(Err(e)) => debug!(message_id = %msg.message_id, error = %e, "failed to remove reaction"),
            Err(_) => debug!(message_id = %msg.message_id, "removing reaction timed out"),
            Ok(Ok(())) => {}
        }

        react(self.platform.as_ref(), &msg.target, &msg.message_id, outcome).await;
    }
}

async fn react(platform: &dyn ChannelPlugin, target: &ChannelTarget, message_id: &str, emoji: &str) {
    match tokio::time::timeout(
        REACTION_TIMEOUT,
        platform.add_reaction(target, message_id, emoji),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(message_id = %message_id, emoji = %emoji, error = %e, "failed to react"),
        Err(_) => debug!(message_id = %message_id, emoji = %emoji, "reaction timed out"),
    }
}

fn pairing_reply(ticket: &PairingTicket) -> String {
    match ticket.status {
        PairingStatus::Rejected => PAIRING_REJECTED_REPLY.to_string(),
        _ if ticket.is_new => format!(
            "🔐 You need approval to talk to me here.\n\
             Pairing code: `{code}`\n\
             Ask the bot owner to run: `discord-bridge pairing approve {code}`",
            code = ticket.code
        ),
        _ => format!(
            "⏳ Your pairing request `{}` is still waiting for approval.",
            ticket.code
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessPolicy, ChannelMapping};
    use crate::test_utils::{MockHost, MockPlatform};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<ConfigStore>,
        platform: Arc<MockPlatform>,
        host: Arc<MockHost>,
        manager: Arc<BridgeManager>,
    }

    fn fixture(policy: AccessPolicy) -> Fixture {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.toml")).unwrap();
        store
            .update(|cfg| {
                cfg.default_access = policy;
                Ok(())
            })
            .unwrap();
        let platform = MockPlatform::new();
        let host = MockHost::new();
        let manager = BridgeManager::new(store.clone(), platform.clone(), host.clone());
        Fixture {
            _dir: dir,
            store,
            platform,
            host,
            manager,
        }
    }

    fn inbound(channel: u64, user: u64, content: &str, mentioned: bool) -> InboundMessage {
        InboundMessage {
            target: ChannelTarget::discord(channel, Some(user)).with_username("ada"),
            content: content.to_string(),
            message_id: "in-1".to_string(),
            guild_id: Some("9".to_string()),
            is_dm: false,
            mentioned,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reply() {
        let f = fixture(AccessPolicy::All);
        f.host.push_reply(vec![
            MockHost::text("Hello"),
            MockHost::text(" there"),
            MockHost::done(),
        ]);

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi bot", true))
            .await
            .unwrap();
        assert!(matches!(handled, Handled::Completed(_)));

        let injections = f.host.injections();
        assert_eq!(injections.len(), 1);
        assert_eq!(injections[0].session, "discord-100");
        assert_eq!(injections[0].message, "hi bot");
        assert_eq!(injections[0].options.sender.as_deref(), Some("ada"));

        let created = f.platform.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].reply_to.as_deref(), Some("in-1"));
        assert_eq!(f.platform.final_contents(), vec!["💭 Hello there"]);
        assert_eq!(f.platform.reactions_on("in-1"), vec![REACTION_SUCCESS]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_final_text_used_when_nothing_streamed() {
        let f = fixture(AccessPolicy::All);
        f.host.push_reply(vec![HostEvent::Done {
            final_text: Some("# Answer\n42".to_string()),
        }]);

        f.manager
            .handle_inbound_message(inbound(100, 7, "question", true))
            .await
            .unwrap();
        assert_eq!(f.platform.final_contents(), vec!["# Answer\n42"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_error_keeps_partial_output() {
        let f = fixture(AccessPolicy::All);
        f.host
            .push_reply(vec![MockHost::text("partial"), MockHost::error("boom")]);

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert_eq!(handled, Handled::Failed("boom".to_string()));

        let contents = f.platform.final_contents();
        assert_eq!(contents[0], "💭 partial");
        assert_eq!(contents[1], GENERIC_ERROR_REPLY);
        assert_eq!(f.platform.reactions_on("in-1"), vec![REACTION_FAILURE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_injection() {
        let f = fixture(AccessPolicy::All);
        f.host.push_refusal("session busy");

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert!(matches!(handled, Handled::Failed(ref e) if e.contains("session busy")));
        assert_eq!(f.platform.final_contents(), vec![GENERIC_ERROR_REPLY]);
        assert_eq!(f.platform.reactions_on("in-1"), vec![REACTION_FAILURE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_host_stream_is_failure() {
        let f = fixture(AccessPolicy::All);
        f.host.push_reply(vec![MockHost::text("cut")]);

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert!(matches!(handled, Handled::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaction_failures_do_not_fail_reply() {
        let f = fixture(AccessPolicy::All);
        f.platform.fail_reactions(true);
        f.host.push_reply(vec![MockHost::text("ok"), MockHost::done()]);

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert!(matches!(handled, Handled::Completed(_)));
        assert_eq!(f.platform.final_contents(), vec!["💭 ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaddressed_message_recorded_as_context() {
        let f = fixture(AccessPolicy::All);

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 8, "lunch anyone?", false))
            .await
            .unwrap();
        assert_eq!(handled, Handled::Recorded);
        assert!(f.host.injections().is_empty());
        assert!(f.platform.calls().is_empty());
        // Chatter alone never creates a session
        assert!(f.store.read(|cfg| cfg.mappings.is_empty()));

        f.manager
            .handle_inbound_message(inbound(100, 7, "summarize", true))
            .await
            .unwrap();
        let context = &f.host.injections()[0].options.context;
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content, "lunch anyone?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_to_all_channel() {
        let f = fixture(AccessPolicy::All);
        let mut mapping = ChannelMapping::new("dev");
        mapping.respond_to_all = true;
        SessionRouter::new(f.store.clone())
            .map_channel("100", mapping)
            .unwrap();

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "no mention", false))
            .await
            .unwrap();
        assert!(matches!(handled, Handled::Completed(_)));
        assert_eq!(f.host.injections()[0].session, "dev");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user_gets_pairing_code_then_reminder() {
        let f = fixture(AccessPolicy::Paired);

        let first = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert_eq!(first, Handled::Pairing(PairingStatus::Pending));

        let second = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hello?", true))
            .await
            .unwrap();
        assert_eq!(second, Handled::Pairing(PairingStatus::Pending));

        assert!(f.host.injections().is_empty());
        let replies = f.platform.final_contents();
        assert_eq!(replies.len(), 2);
        assert!(replies[0].contains("Pairing code"));
        assert!(replies[1].contains("still waiting"));

        let gate = AccessGate::new(f.store.clone());
        let pending = gate.list_pairing_requests(Some(PairingStatus::Pending));
        assert_eq!(pending.len(), 1);
        assert!(replies[0].contains(&pending[0].code));

        gate.approve(&pending[0].code).unwrap();
        let third = f
            .manager
            .handle_inbound_message(inbound(100, 7, "now?", true))
            .await
            .unwrap();
        assert!(matches!(third, Handled::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_none_refuses_without_code() {
        let f = fixture(AccessPolicy::None);
        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert_eq!(handled, Handled::Refused);
        assert!(AccessGate::new(f.store.clone())
            .list_pairing_requests(None)
            .is_empty());
        assert_eq!(f.platform.final_contents(), vec![NO_ACCESS_REPLY]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_user_ignored_silently() {
        let f = fixture(AccessPolicy::All);
        AccessGate::new(f.store.clone()).block("7", None).unwrap();

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert_eq!(handled, Handled::Ignored);
        assert!(f.platform.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_guild_ignored() {
        let f = fixture(AccessPolicy::All);
        f.store
            .update(|cfg| {
                cfg.guild_id = Some(1);
                Ok(())
            })
            .unwrap();

        let handled = f
            .manager
            .handle_inbound_message(inbound(100, 7, "hi", true))
            .await
            .unwrap();
        assert_eq!(handled, Handled::Ignored);
        assert!(f.store.read(|cfg| cfg.mappings.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_processes_platform_messages() {
        let f = fixture(AccessPolicy::All);
        f.host.push_reply(vec![MockHost::text("pong"), MockHost::done()]);
        f.manager.start().await.unwrap();

        let runner = tokio::spawn(f.manager.clone().run());
        let ctx = f.platform.context().unwrap();
        ctx.message_tx.send(inbound(100, 7, "ping", true)).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.platform.final_contents(), vec!["💭 pong"]);

        // A second run is refused
        assert!(f.manager.clone().run().await.is_err());

        let status = f.manager.status().await;
        assert_eq!(status.active_streams, Some(0));
        assert_eq!(status.mappings, 1);
        assert!(status.host_available);

        f.manager.stop().await.unwrap();
        assert!(f.platform.context().is_none());
        runner.abort();
    }

    #[test]
    fn test_pairing_reply_texts() {
        let mut ticket = PairingTicket {
            code: "ABC234".to_string(),
            status: PairingStatus::Pending,
            is_new: true,
        };
        assert!(pairing_reply(&ticket).contains("pairing approve ABC234"));
        ticket.is_new = false;
        assert!(pairing_reply(&ticket).contains("ABC234"));
        ticket.status = PairingStatus::Rejected;
        assert_eq!(pairing_reply(&ticket), PAIRING_REJECTED_REPLY);
    }
}
