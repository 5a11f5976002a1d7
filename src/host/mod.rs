//! Boundary to the assistant host that owns sessions and generates replies.

pub mod protocol;
#[cfg(unix)]
pub mod socket;

pub use protocol::{ContextLine, HostEvent};
#[cfg(unix)]
pub use socket::SocketHost;

use crate::error::Result;
use futures::stream::BoxStream;

/// Lazy stream of events for one injection. Ends after a terminal event.
pub type HostStream = BoxStream<'static, HostEvent>;

/// Extra data sent along with an injected message
#[derive(Debug, Clone, Default)]
pub struct InjectOptions {
    /// Display name of the sender
    pub sender: Option<String>,
    /// Recent channel chatter preceding the message
    pub context: Vec<ContextLine>,
}

/// The assistant host
#[async_trait::async_trait]
pub trait AssistantHost: Send + Sync {
    /// Add `message` to `session` and stream the generated reply.
    ///
    /// Fails with [`crate::error::Error::Injection`] when the host cannot be
    /// reached or refuses the request outright; failures after streaming has
    /// begun arrive as [`HostEvent::Error`].
    async fn inject(
        &self,
        session: &str,
        message: &str,
        options: InjectOptions,
    ) -> Result<HostStream>;

    /// Whether the host looks reachable
    async fn is_available(&self) -> bool;
}
