use crate::channels::plugin::{
    ChannelContext, ChannelPlugin, ChannelTarget, MessageId, OutboundMessage,
};
use crate::error::{Error, Result};
use crate::host::{AssistantHost, HostEvent, HostStream, InjectOptions};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One successful call made against [`MockPlatform`]
#[derive(Clone, Debug)]
pub enum PlatformCall {
    Send {
        target: ChannelTarget,
        msg: OutboundMessage,
        id: String,
    },
    Edit {
        target: ChannelTarget,
        message_id: String,
        msg: OutboundMessage,
    },
    React {
        message_id: String,
        emoji: String,
    },
    Unreact {
        message_id: String,
        emoji: String,
    },
}

impl PlatformCall {
    /// Text content for sends and edits, empty for reactions
    pub fn content(&self) -> &str {
        match self {
            PlatformCall::Send { msg, .. } | PlatformCall::Edit { msg, .. } => &msg.content,
            _ => "",
        }
    }
}

/// Recording chat platform
#[derive(Debug, Default)]
pub struct MockPlatform {
    calls: Mutex<Vec<PlatformCall>>,
    next_id: AtomicU64,
    fail_sends: AtomicBool,
    fail_edits: AtomicBool,
    fail_reactions: AtomicBool,
    context: Mutex<Option<Arc<ChannelContext>>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reactions(&self, fail: bool) {
        self.fail_reactions.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Messages created, in order
    pub fn created(&self) -> Vec<OutboundMessage> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PlatformCall::Send { msg, .. } => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Latest content of every created message, in creation order
    pub fn final_contents(&self) -> Vec<String> {
        let mut messages: Vec<(String, String)> = Vec::new();
        for call in self.calls() {
            match call {
                PlatformCall::Send { msg, id, .. } => messages.push((id, msg.content)),
                PlatformCall::Edit {
                    message_id, msg, ..
                } => {
                    if let Some(entry) = messages.iter_mut().find(|(id, _)| *id == message_id) {
                        entry.1 = msg.content;
                    }
                }
                _ => {}
            }
        }
        messages.into_iter().map(|(_, content)| content).collect()
    }

    /// Reactions currently on a message, in the order they were added
    pub fn reactions_on(&self, message_id: &str) -> Vec<String> {
        let mut current: Vec<String> = Vec::new();
        for call in self.calls() {
            match call {
                PlatformCall::React {
                    message_id: id,
                    emoji,
                } if id == message_id && !current.contains(&emoji) => current.push(emoji),
                PlatformCall::Unreact {
                    message_id: id,
                    emoji,
                } if id == message_id => current.retain(|e| *e != emoji),
                _ => {}
            }
        }
        current
    }

    /// Context handed to `start`, for pushing inbound messages
    pub fn context(&self) -> Option<Arc<ChannelContext>> {
        self.context.lock().expect("context lock").clone()
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait::async_trait]
impl ChannelPlugin for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, ctx: Arc<ChannelContext>) -> Result<()> {
        *self.context.lock().expect("context lock") = Some(ctx);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.context.lock().expect("context lock").take();
        Ok(())
    }

    async fn send_message(
        &self,
        target: &ChannelTarget,
        msg: &OutboundMessage,
    ) -> Result<MessageId> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::delivery("send", "mock send failure"));
        }
        let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(PlatformCall::Send {
            target: target.clone(),
            msg: msg.clone(),
            id: id.clone(),
        });
        Ok(MessageId {
            id,
            channel: "mock".to_string(),
        })
    }

    async fn edit_message(
        &self,
        target: &ChannelTarget,
        message_id: &str,
        msg: &OutboundMessage,
    ) -> Result<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(Error::delivery("edit", "mock edit failure"));
        }
        self.record(PlatformCall::Edit {
            target: target.clone(),
            message_id: message_id.to_string(),
            msg: msg.clone(),
        });
        Ok(())
    }

    async fn add_reaction(
        &self,
        _target: &ChannelTarget,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        if self.fail_reactions.load(Ordering::SeqCst) {
            return Err(Error::delivery("react", "mock reaction failure"));
        }
        self.record(PlatformCall::React {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }

    async fn remove_reaction(
        &self,
        _target: &ChannelTarget,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        if self.fail_reactions.load(Ordering::SeqCst) {
            return Err(Error::delivery("unreact", "mock reaction failure"));
        }
        self.record(PlatformCall::Unreact {
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }
}

/// One recorded injection
#[derive(Clone, Debug)]
pub struct Injection {
    pub session: String,
    pub message: String,
    pub options: InjectOptions,
}

/// Scripted reply to one injection
enum Script {
    Events(Vec<HostEvent>),
    Refuse(String),
}

/// Assistant host replaying scripted events
#[derive(Default)]
pub struct MockHost {
    scripts: Mutex<VecDeque<Script>>,
    injections: Mutex<Vec<Injection>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next injection with `events`
    pub fn push_reply(&self, events: Vec<HostEvent>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Script::Events(events));
    }

    /// Refuse the next injection outright
    pub fn push_refusal(&self, message: &str) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Script::Refuse(message.to_string()));
    }

    pub fn injections(&self) -> Vec<Injection> {
        self.injections.lock().expect("injections lock").clone()
    }

    pub fn text(content: &str) -> HostEvent {
        HostEvent::Text {
            content: content.to_string(),
        }
    }

    pub fn done() -> HostEvent {
        HostEvent::Done { final_text: None }
    }

    pub fn error(message: &str) -> HostEvent {
        HostEvent::Error {
            message: message.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AssistantHost for MockHost {
    async fn inject(
        &self,
        session: &str,
        message: &str,
        options: InjectOptions,
    ) -> Result<HostStream> {
        self.injections
            .lock()
            .expect("injections lock")
            .push(Injection {
                session: session.to_string(),
                message: message.to_string(),
                options,
            });

        let script = self.scripts.lock().expect("scripts lock").pop_front();
        match script {
            Some(Script::Refuse(message)) => Err(Error::Injection(message)),
            Some(Script::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            None => Ok(futures::stream::iter(vec![MockHost::done()]).boxed()),
        }
    }

    async fn is_available(&self) -> bool {
        true
    }
}
