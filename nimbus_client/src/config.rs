//! Client configuration

use crate::error::{ClientError, Result};
use nimbus_network::RawFrame;
use nimbus_network::rpc::DEFAULT_RPC_TIMEOUT;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Max payload size of a single frame, both directions
    pub max_frame_size: u64,

    /// Capacity of the outbound frame queue
    pub send_queue_size: usize,

    /// How long `call` waits for an RPC response
    pub rpc_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8888)),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: RawFrame::MAX_PAYLOAD_SIZE,
            send_queue_size: 128,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create new client config
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set max frame payload size
    pub fn with_max_frame_size(mut self, size: u64) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set outbound queue capacity
    pub fn with_send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = size;
        self
    }

    /// Set RPC timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Check the configuration before connecting
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(ClientError::InvalidConfig("max_frame_size must be > 0".to_string()));
        }
        if self.send_queue_size == 0 {
            return Err(ClientError::InvalidConfig("send_queue_size must be > 0".to_string()));
        }
        if self.connect_timeout.is_zero() || self.rpc_timeout.is_zero() {
            return Err(ClientError::InvalidConfig("timeouts must be > 0".to_string()));
        }
        Ok(())
    }
}
