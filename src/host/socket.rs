//! Unix socket client for the assistant host.

use super::protocol::{HostEnvelope, HostEvent, HostRequest};
use super::{AssistantHost, HostStream, InjectOptions};
use crate::error::{Error, Result};
use futures::StreamExt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// How often a silent host connection checks whether anyone is still listening
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Host reached over a Unix socket speaking NDJSON
pub struct SocketHost {
    socket_path: PathBuf,
}

impl SocketHost {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a ping and wait for the pong (blocking, use sparingly)
    pub async fn ping(&self) -> Result<bool> {
        let socket_path = self.socket_path.clone();
        tokio::task::spawn_blocking(move || ping_blocking(&socket_path))
            .await
            .map_err(|e| Error::Injection(e.to_string()))?
            .map_err(|e| Error::Injection(e.to_string()))
    }
}

#[async_trait::async_trait]
impl AssistantHost for SocketHost {
    async fn inject(
        &self,
        session: &str,
        message: &str,
        options: InjectOptions,
    ) -> Result<HostStream> {
        let mut request = HostRequest::inject(session, message);
        request.sender = options.sender;
        request.context = options.context;
        let request_id = request.id.clone();

        // Connect and write up front so an unreachable host fails the call
        let socket_path = self.socket_path.clone();
        let reader = tokio::task::spawn_blocking(move || send_request(&socket_path, &request))
            .await
            .map_err(|e| Error::Injection(e.to_string()))?
            .map_err(|e| {
                Error::Injection(format!(
                    "cannot reach host at {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;

        debug!(session = %session, request_id = %request_id, "injected message");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || read_events(reader, &request_id, tx));

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn is_available(&self) -> bool {
        self.socket_path.exists()
    }
}

fn send_request(socket_path: &Path, request: &HostRequest) -> std::io::Result<BufReader<UnixStream>> {
    let stream = UnixStream::connect(socket_path)?;
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let json = serde_json::to_string(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writeln!(writer, "{}", json)?;
    writer.flush()?;

    Ok(reader)
}

fn read_events(
    mut reader: BufReader<UnixStream>,
    request_id: &str,
    tx: mpsc::UnboundedSender<HostEvent>,
) {
    // Wake up periodically to notice a consumer that went away
    if let Err(e) = reader.get_ref().set_read_timeout(Some(READ_POLL_INTERVAL)) {
        warn!(error = %e, "cannot set host read timeout");
    }

    let mut line = Vec::new();
    loop {
        let event = match reader.read_until(b'\n', &mut line) {
            Ok(0) => HostEvent::Error {
                message: "host closed the connection".to_string(),
            },
            Ok(_) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<HostEnvelope>(&text) {
                    Ok(envelope) => {
                        if envelope.id.as_deref().is_some_and(|id| id != request_id) {
                            warn!(request_id = %request_id, "dropping event for another request");
                            continue;
                        }
                        envelope.event
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to parse host event");
                        continue;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Partial line stays in `line`
                if tx.is_closed() {
                    debug!(request_id = %request_id, "stream dropped, closing host connection");
                    let _ = reader.get_ref().shutdown(Shutdown::Both);
                    return;
                }
                continue;
            }
            Err(e) => HostEvent::Error {
                message: format!("host connection error: {}", e),
            },
        };

        let terminal = event.is_terminal();
        if tx.send(event).is_err() {
            let _ = reader.get_ref().shutdown(Shutdown::Both);
            break;
        }
        if terminal {
            break;
        }
    }
}

fn ping_blocking(socket_path: &Path) -> std::io::Result<bool> {
    let mut reader = send_request(socket_path, &HostRequest::ping())?;
    reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut line = String::new();
    reader.read_line(&mut line)?;

    Ok(serde_json::from_str::<HostEnvelope>(line.trim())
        .is_ok_and(|envelope| envelope.event == HostEvent::Pong))
}
