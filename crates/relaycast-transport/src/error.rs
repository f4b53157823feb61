//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur in the network sink.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot run on this host.
    #[error("Network transport not supported on this host")]
    Unsupported,

    /// The named sender could not be opened.
    #[error("Failed to create sender: {0}")]
    SenderCreation(String),

    /// A frame could not be sent.
    #[error("Send failed: {0}")]
    Send(String),

    /// The sink is already running.
    #[error("Sink already started")]
    AlreadyStarted,

    /// The sender thread could not be spawned.
    #[error("Failed to spawn sender thread: {0}")]
    Thread(#[source] std::io::Error),
}
