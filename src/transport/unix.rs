// ABOUTME: Unix domain socket transport speaking newline-delimited JSON-RPC
// ABOUTME: Splits the stream into a locked writer and a reader task that emits TransportEvents

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    Connector, DEFAULT_EVENT_BUFFER, MessageSink, TransportError, TransportEvent, TransportLink,
};
use crate::protocol::{IncomingMessage, OutgoingMessage};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the daemon's Unix socket.
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    socket_path: PathBuf,
    connect_timeout: Duration,
    event_buffer: usize,
}

impl UnixSocketConnector {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect_failed(&self, reason: impl ToString) -> TransportError {
        TransportError::ConnectFailed {
            endpoint: self.socket_path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for UnixSocketConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| self.connect_failed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| self.connect_failed(e))?;

        let (read_half, write_half) = stream.into_split();
        let (event_tx, events) = mpsc::channel(self.event_buffer);
        let endpoint = self.endpoint();
        let reader = tokio::spawn(read_loop(read_half, event_tx, endpoint));

        debug!(socket = %self.socket_path.display(), "Connected to daemon socket");

        Ok(TransportLink {
            sink: Arc::new(UnixSocketSink {
                writer: tokio::sync::Mutex::new(Some(write_half)),
                reader: Mutex::new(Some(reader)),
            }),
            events,
        })
    }

    fn endpoint(&self) -> String {
        self.socket_path.display().to_string()
    }
}

/// Write half of a Unix socket link.
struct UnixSocketSink {
    // Async lock: frames must never interleave and writes await
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MessageSink for UnixSocketSink {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let line = message.to_json_line()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        trace!(method = %message.method(), bytes = line.len(), "Frame written");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let writer = self.writer.lock().await.take();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = reader {
            handle.abort();
        }
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl Drop for UnixSocketSink {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Reads frames until EOF or error, then reports the loss once.
async fn read_loop(read_half: OwnedReadHalf, events: mpsc::Sender<TransportEvent>, endpoint: String) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "connection closed by daemon".to_string(),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match IncomingMessage::from_json_str(trimmed) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).await.is_err() {
                            // Nobody is listening anymore
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(socket = %endpoint, error = %e, "Discarding malformed frame");
                    }
                }
            }
            Err(e) => break e.to_string(),
        }
    };

    debug!(socket = %endpoint, reason = %reason, "Daemon socket reader ended");
    let _ = events.send(TransportEvent::Lost(reason)).await;
}
