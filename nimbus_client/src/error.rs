//! Client-specific error types

use nimbus_core::{MarshalError, NimbusError};
use nimbus_network::protocol::FrameError;
use thiserror::Error;

/// Client-specific errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected to server
    #[error("Not connected")]
    NotConnected,

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload could not be unpacked
    #[error("Unpack failed for protocol {id}: {source}")]
    Unpack {
        id: u32,
        #[source]
        source: MarshalError,
    },

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<ClientError> for NimbusError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ConnectionFailed(msg) => NimbusError::network(msg),
            ClientError::NotConnected => NimbusError::network("Not connected"),
            ClientError::SendFailed(msg) => NimbusError::network(msg),
            ClientError::ReceiveFailed(msg) => NimbusError::network(msg),
            ClientError::Frame(e) => NimbusError::protocol(e.to_string()),
            ClientError::Unpack { source, .. } => NimbusError::Marshal(source),
            ClientError::Timeout(_msg) => NimbusError::timeout(),
            ClientError::InvalidConfig(msg) => NimbusError::config(msg),
        }
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
