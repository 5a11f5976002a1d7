//! Streaming output reconciler.
//!
//! Turns an unbounded sequence of text fragments from the assistant host into
//! a bounded series of chat messages:
//!
//! - the message being written is edited in place as text arrives,
//! - content over the platform limit is split into follow-up messages,
//! - small fragments are coalesced behind a short idle deadline,
//! - early "thinking" output is shown with a prefix until the response proper
//!   starts, then frozen and never relabelled.
//!
//! # Architecture
//!
//! ```text
//!  host fragments ──► StreamHandle ──mpsc──► drive task ──► StreamState ──► ChannelPlugin
//!                                             │  select!                     (send / edit)
//!                                             └─ idle deadline
//! ```
//!
//! One drive task owns each [`StreamState`], so flushes for a session are
//! serialized and fragments pile up in the channel while a send is in flight.
//! [`StreamRegistry`] keeps at most one task per session key and aborts the
//! old one when a new stream opens for the same key.

use super::chunker::{split_message, DISCORD_MAX_MESSAGE_LEN};
use super::plugin::{ChannelPlugin, ChannelTarget, OutboundMessage};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tuning for streamed output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Per-message character limit
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Flush as soon as this many characters are waiting
    #[serde(default = "default_coalesce_threshold")]
    pub coalesce_threshold: usize,

    /// Flush at a natural break once more than this many characters wait
    #[serde(default = "default_break_floor")]
    pub break_floor: usize,

    /// Idle delay before a deferred flush
    #[serde(default = "default_coalesce_delay_ms")]
    pub coalesce_delay_ms: u64,

    /// Fragments longer than this count as a response start when they carry
    /// markdown structure
    #[serde(default = "default_long_fragment_threshold")]
    pub long_fragment_threshold: usize,

    /// Prefix marking thinking output
    #[serde(default = "default_thinking_prefix")]
    pub thinking_prefix: String,
}

fn default_max_message_len() -> usize {
    DISCORD_MAX_MESSAGE_LEN
}

fn default_coalesce_threshold() -> usize {
    800
}

fn default_break_floor() -> usize {
    100
}

fn default_coalesce_delay_ms() -> u64 {
    200
}

fn default_long_fragment_threshold() -> usize {
    150
}

fn default_thinking_prefix() -> String {
    "💭 ".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            coalesce_threshold: default_coalesce_threshold(),
            break_floor: default_break_floor(),
            coalesce_delay_ms: default_coalesce_delay_ms(),
            long_fragment_threshold: default_long_fragment_threshold(),
            thinking_prefix: default_thinking_prefix(),
        }
    }
}

impl StreamConfig {
    fn coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.coalesce_delay_ms)
    }

    /// Room left for body text in one message
    fn body_limit(&self, mode: StreamMode) -> usize {
        match mode {
            StreamMode::Thinking => self
                .max_message_len
                .saturating_sub(self.thinking_prefix.chars().count())
                .max(1),
            StreamMode::Responding => self.max_message_len.max(1),
        }
    }
}

/// Which kind of output the stream is currently producing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Thinking,
    Responding,
}

/// Counters reported when a stream closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub messages_created: usize,
    pub edits: usize,
    pub delivery_failures: usize,
    pub switched_to_response: bool,
}

/// Best-effort guess whether a fragment opens the actual response.
///
/// False negatives leave text styled as thinking; false positives switch
/// early. Neither loses content.
pub fn looks_like_response_start(fragment: &str, long_fragment_threshold: usize) -> bool {
    let text = fragment.trim();
    if text.is_empty() {
        return false;
    }

    if text.starts_with('#')
        || text.starts_with("---")
        || text.starts_with("```")
        || text.starts_with('>')
        || text.starts_with('|')
        || text.starts_with("**")
        || starts_with_ordered_marker(text)
        || starts_with_numbered_label(text)
    {
        return true;
    }

    text.chars().count() > long_fragment_threshold
        && (text.contains("```") || text.contains("**") || text.contains('|'))
}

/// "12." at the start
fn starts_with_ordered_marker(text: &str) -> bool {
    let digits = text.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && text[digits..].starts_with('.')
}

/// "Step 2:" style label at the start
fn starts_with_numbered_label(text: &str) -> bool {
    let mut parts = text.splitn(2, ' ');
    let (Some(word), Some(rest)) = (parts.next(), parts.next()) else {
        return false;
    };

    let mut chars = word.chars();
    let capitalized = chars.next().is_some_and(|c| c.is_uppercase())
        && chars.all(char::is_alphabetic);
    if !capitalized {
        return false;
    }

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && rest[digits..].starts_with(':')
}

/// Blank line, or sentence punctuation followed by whitespace
fn has_natural_break(text: &str) -> bool {
    text.contains("\n\n")
        || text
            .as_bytes()
            .windows(2)
            .any(|w| matches!(w[0], b'.' | b'!' | b'?') && matches!(w[1], b' ' | b'\n'))
}

/// Delivery state for one conversation
pub struct StreamState {
    key: String,
    target: ChannelTarget,
    /// Inbound message the first outbound message replies to
    reply_to: Option<String>,
    /// Message currently being edited
    active_message: Option<String>,
    /// Text of the current message segment
    buffer: String,
    /// Characters of `buffer` already on the platform
    displayed_len: usize,
    mode: StreamMode,
    last_activity: Instant,
    /// Pending deferred flush
    deadline: Option<Instant>,
    complete: bool,
    config: StreamConfig,
    summary: StreamSummary,
}

impl StreamState {
    pub fn new(
        key: impl Into<String>,
        target: ChannelTarget,
        reply_to: Option<String>,
        config: StreamConfig,
    ) -> Self {
        Self {
            key: key.into(),
            target,
            reply_to,
            active_message: None,
            buffer: String::new(),
            displayed_len: 0,
            mode: StreamMode::Thinking,
            last_activity: Instant::now(),
            deadline: None,
            complete: false,
            config,
            summary: StreamSummary::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn buffer_len(&self) -> usize {
        self.buffer.chars().count()
    }

    fn unflushed_len(&self) -> usize {
        self.buffer_len().saturating_sub(self.displayed_len)
    }

    fn unflushed_text(&self) -> &str {
        match self.buffer.char_indices().nth(self.displayed_len) {
            Some((idx, _)) => &self.buffer[idx..],
            None => "",
        }
    }

    fn decorate(&self, body: &str) -> String {
        match self.mode {
            StreamMode::Thinking => format!("{}{}", self.config.thinking_prefix, body),
            StreamMode::Responding => body.to_string(),
        }
    }

    /// Accept one fragment from the host
    pub async fn on_fragment(&mut self, text: &str, platform: &dyn ChannelPlugin) {
        if self.complete || text.is_empty() {
            return;
        }
        self.last_activity = Instant::now();

        if self.mode == StreamMode::Thinking
            && looks_like_response_start(text, self.config.long_fragment_threshold)
        {
            self.start_response(platform).await;
        }

        self.buffer.push_str(text);

        if self.should_flush_now() {
            self.deadline = None;
            self.flush(platform).await;
        } else {
            self.deadline = Some(Instant::now() + self.config.coalesce_delay());
        }
    }

    /// The idle deadline passed
    pub async fn on_deadline(&mut self, platform: &dyn ChannelPlugin) {
        self.deadline = None;
        if !self.complete {
            self.flush(platform).await;
        }
    }

    /// Final flush. Returns the stream's counters.
    pub async fn close(&mut self, platform: &dyn ChannelPlugin) -> StreamSummary {
        self.deadline = None;
        if !self.complete {
            self.flush(platform).await;
            self.complete = true;
        }
        self.summary.clone()
    }

    fn should_flush_now(&self) -> bool {
        let unflushed = self.unflushed_len();
        unflushed >= self.config.coalesce_threshold
            || (unflushed > self.config.break_floor && has_natural_break(self.unflushed_text()))
    }

    /// Freeze the thinking output and begin a fresh message for the response
    async fn start_response(&mut self, platform: &dyn ChannelPlugin) {
        debug!(session = %self.key, "stream switching to response output");
        self.deadline = None;
        self.flush(platform).await;
        self.retire();
        self.mode = StreamMode::Responding;
        self.summary.switched_to_response = true;
    }

    /// Drop the current segment; the next content starts a new message
    fn retire(&mut self) {
        self.active_message = None;
        self.buffer.clear();
        self.displayed_len = 0;
    }

    /// Push the buffered segment to the platform
    pub async fn flush(&mut self, platform: &dyn ChannelPlugin) {
        let body = self.buffer.trim();
        if body.is_empty() {
            return;
        }
        if self.active_message.is_some() && self.unflushed_len() == 0 {
            return;
        }

        let limit = self.config.body_limit(self.mode);
        if body.chars().count() <= limit {
            let content = self.decorate(body);
            if self.deliver(platform, content).await {
                self.displayed_len = self.buffer_len();
            }
            return;
        }

        let chunks = match split_message(body, limit) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(session = %self.key, error = %e, "cannot split stream output");
                return;
            }
        };

        let body = body.to_string();
        let mut cursor = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let start = body[cursor..]
                .find(chunk.as_str())
                .map_or(cursor, |off| cursor + off);
            cursor = start + chunk.len();

            if i > 0 {
                self.active_message = None;
            }
            let content = self.decorate(chunk);
            if !self.deliver(platform, content).await {
                // Keep what never reached the platform for the next flush
                self.buffer = body[start..].to_string();
                self.active_message = None;
                self.displayed_len = 0;
                return;
            }
        }
        self.retire();
    }

    /// Edit the active message, or create one. Returns false on failure.
    async fn deliver(&mut self, platform: &dyn ChannelPlugin, content: String) -> bool {
        let mut msg = OutboundMessage::text(content);

        if let Some(message_id) = self.active_message.clone() {
            return match platform.edit_message(&self.target, &message_id, &msg).await {
                Ok(()) => {
                    self.summary.edits += 1;
                    true
                }
                Err(e) => {
                    warn!(
                        session = %self.key,
                        message_id = %message_id,
                        error = %e,
                        "stream edit failed, next flush sends a new message"
                    );
                    self.summary.delivery_failures += 1;
                    self.active_message = None;
                    false
                }
            };
        }

        if let Some(reply_to) = &self.reply_to {
            msg = msg.with_reply(reply_to.clone());
        }
        match platform.send_message(&self.target, &msg).await {
            Ok(sent) => {
                self.reply_to = None;
                self.active_message = Some(sent.id);
                self.summary.messages_created += 1;
                true
            }
            Err(e) => {
                warn!(session = %self.key, error = %e, "stream send failed");
                self.summary.delivery_failures += 1;
                false
            }
        }
    }
}

enum StreamCommand {
    Fragment(String),
    Close(oneshot::Sender<StreamSummary>),
}

struct ActiveStream {
    generation: u64,
    abort: AbortHandle,
}

/// Owner of every live stream of one bridge instance
pub struct StreamRegistry {
    platform: Arc<dyn ChannelPlugin>,
    config: StreamConfig,
    streams: Arc<DashMap<String, ActiveStream>>,
    next_generation: AtomicU64,
}

impl StreamRegistry {
    pub fn new(platform: Arc<dyn ChannelPlugin>, config: StreamConfig) -> Self {
        Self {
            platform,
            config,
            streams: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start a stream for `key`, abandoning any stream already running for it.
    ///
    /// The abandoned stream is not flushed; whatever it had not yet shown is
    /// dropped.
    pub fn open(
        &self,
        key: &str,
        target: ChannelTarget,
        reply_to: Option<String>,
    ) -> StreamHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let state = StreamState::new(key, target, reply_to, self.config.clone());

        let task = tokio::spawn(drive(
            state,
            rx,
            self.platform.clone(),
            self.streams.clone(),
            generation,
        ));

        let previous = self.streams.insert(
            key.to_string(),
            ActiveStream {
                generation,
                abort: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            debug!(session = %key, "superseding active stream");
            previous.abort.abort();
        }

        StreamHandle {
            key: key.to_string(),
            generation,
            tx,
        }
    }

    /// Whether a stream is running for `key`
    pub fn is_active(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    /// Number of running streams
    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    /// Abandon every stream (shutdown)
    pub fn abort_all(&self) {
        for entry in self.streams.iter() {
            entry.abort.abort();
        }
        self.streams.clear();
    }
}

/// Producer side of one stream
pub struct StreamHandle {
    key: String,
    generation: u64,
    tx: mpsc::UnboundedSender<StreamCommand>,
}

impl StreamHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a fragment. Returns false once the stream is gone.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.tx.send(StreamCommand::Fragment(text.into())).is_ok()
    }

    /// Flush everything and finish the stream.
    ///
    /// Returns None when the stream was superseded in the meantime.
    pub async fn close(self) -> Option<StreamSummary> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(StreamCommand::Close(done_tx)).is_err() {
            return None;
        }
        done_rx.await.ok()
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn drive(
    mut state: StreamState,
    mut rx: mpsc::UnboundedReceiver<StreamCommand>,
    platform: Arc<dyn ChannelPlugin>,
    streams: Arc<DashMap<String, ActiveStream>>,
    generation: u64,
) {
    let done = loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(StreamCommand::Fragment(text)) => {
                    state.on_fragment(&text, platform.as_ref()).await;
                }
                Some(StreamCommand::Close(done)) => break Some(done),
                None => break None,
            },
            _ = wait_for(state.deadline()) => {
                state.on_deadline(platform.as_ref()).await;
            }
        }
    };

    let summary = state.close(platform.as_ref()).await;
    streams.remove_if(state.key(), |_, active| active.generation == generation);
    debug!(
        session = %state.key(),
        created = summary.messages_created,
        edits = summary.edits,
        failures = summary.delivery_failures,
        "stream closed"
    );
    if let Some(done) = done {
        let _ = done.send(summary);
    }
}
