//! High-level client API
//!
//! Provides a simplified client interface for common use cases.

use crate::{Error, Result};
use nimbus_client::{ClientConfig, StreamClient as InnerClient};
use nimbus_core::Marshal;
use nimbus_network::RpcHandler;
use std::net::SocketAddr;

/// High-level client
///
/// This is a thin wrapper around [`nimbus_client::StreamClient`] that accepts
/// string addresses and reports errors as [`crate::Error`].
///
/// # Example
///
/// ```rust,no_run,ignore
/// use nimbus::Client;
///
/// #[tokio::main]
/// async fn main() -> nimbus::Result<()> {
///     let mut client = Client::connect("127.0.0.1:8888").await?;
///
///     let verdict = client.call::<JudgeRpc>(&Score { value: 0.5 }).await?;
///     client.send(7, &String::from("hello")).await?;
///
///     client.close().await
/// }
/// ```
pub struct Client {
    inner: InnerClient,
}

impl Client {
    /// Connect to a server
    ///
    /// # Arguments
    ///
    /// * `addr` - Server address (e.g., "127.0.0.1:8888")
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = parse_addr(&addr.into())?;
        Self::connect_with_config(ClientConfig::new(addr)).await
    }

    /// Connect with custom configuration
    pub async fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let inner = InnerClient::connect_with_config(config).await?;
        Ok(Self { inner })
    }

    /// Call an RPC and wait for its result
    pub async fn call<H: RpcHandler>(&mut self, argument: &H::Argument) -> Result<H::Result> {
        Ok(self.inner.call::<H>(argument).await?)
    }

    /// Send a message as the payload of `protocol_id`
    pub async fn send<M: Marshal>(&mut self, protocol_id: u32, message: &M) -> Result<()> {
        Ok(self.inner.send_message(protocol_id, message).await?)
    }

    /// Receive the next message
    pub async fn recv<M: Marshal + Default>(&mut self) -> Result<(u32, M)> {
        Ok(self.inner.recv_message().await?)
    }

    /// Check if connected to the server
    pub async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    /// Get the server address
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr()
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        Ok(self.inner.close().await?)
    }

    /// Get the inner client for advanced use cases
    pub fn inner_mut(&mut self) -> &mut InnerClient {
        &mut self.inner
    }

    /// Consume and return the inner client
    pub fn into_inner(self) -> InnerClient {
        self.inner
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Custom(format!("Invalid address '{}': {}", addr, e)))
}

/// Low-level stream client
///
/// This is a re-export of [`nimbus_client::StreamClient`] for users who need
/// fine-grained control over frames.
pub use nimbus_client::StreamClient;
