// ABOUTME: Transport boundary between the correlator and a physical daemon connection
// ABOUTME: Connector opens links, MessageSink writes frames, inbound traffic arrives as TransportEvents

//! Transport abstraction.
//!
//! The pool never touches sockets directly. A [`Connector`] opens a [`TransportLink`]:
//! a write half behind [`MessageSink`] and a channel of [`TransportEvent`]s produced by
//! whatever reads the other half.
//!
//! ```text
//!   RpcCorrelator ──send()──▶ MessageSink ──▶ daemon
//!        ▲                                      │
//!        └──── mpsc<TransportEvent> ◀── reader ◀┘
//! ```
//!
//! A link reports its own death exactly once, either with [`TransportEvent::Lost`] or by
//! closing the event channel.

pub mod unix;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IncomingMessage, OutgoingMessage, ProtocolError};

pub use unix::UnixSocketConnector;

/// Capacity of the inbound event channel of a link.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach the daemon
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Write attempted on a link that was already closed
    #[error("Transport closed")]
    Closed,

    /// Outgoing message could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Inbound frame could not be understood
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Something that happened on the read side of a link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A well-formed inbound message
    Message(IncomingMessage),
    /// The link is gone; no further events follow
    Lost(String),
}

/// Write half of a live link.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one message as a single frame.
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Close the link. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A freshly opened link.
pub struct TransportLink {
    pub sink: Arc<dyn MessageSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Opens links to the daemon.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, TransportError>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}
