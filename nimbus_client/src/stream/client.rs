//! Stream-based client
//!
//! Provides low-level, manual control over frame send/receive and a
//! request/response helper for RPCs.

use crate::config::ClientConfig;
use crate::connection::{ClientConnection, ClientState};
use crate::error::{ClientError, Result};
use bytes::Bytes;
use nimbus_core::{Marshal, MarshalError, OctetsStream};
use nimbus_network::rpc::TraceId;
use nimbus_network::{Protocol, RawFrame, RpcHandler};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::trace;

/// Stream-based client
///
/// Users explicitly call send/receive methods. Frames that arrive while
/// [`StreamClient::call`] waits for its response are kept and returned by
/// later [`StreamClient::recv_frame`] calls, in arrival order.
pub struct StreamClient {
    connection: ClientConnection,
    backlog: VecDeque<RawFrame>,
    next_trace: TraceId,
    rpc_timeout: Duration,
}

impl StreamClient {
    /// Connect to server
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(ClientConfig::new(addr)).await
    }

    /// Connect with custom configuration
    pub async fn connect_with_config(config: ClientConfig) -> Result<Self> {
        let connection = ClientConnection::connect(&config).await?;
        Ok(Self {
            connection,
            backlog: VecDeque::new(),
            next_trace: 1,
            rpc_timeout: config.rpc_timeout,
        })
    }

    /// Send raw frame
    pub async fn send_frame(&mut self, frame: RawFrame) -> Result<()> {
        self.connection.send_frame(frame).await
    }

    /// Send a registered protocol
    pub async fn send_protocol(&mut self, protocol: &dyn Protocol) -> Result<()> {
        self.connection.send_protocol(protocol).await
    }

    /// Pack `message` as the payload of `protocol_id`
    pub async fn send_message<M: Marshal>(&mut self, protocol_id: u32, message: &M) -> Result<()> {
        self.connection.send_message(protocol_id, message).await
    }

    /// Receive next frame (blocking)
    pub async fn recv_frame(&mut self) -> Result<RawFrame> {
        if let Some(frame) = self.backlog.pop_front() {
            return Ok(frame);
        }
        self.connection.recv_frame().await
    }

    /// Receive and unpack the next frame
    pub async fn recv_message<M: Marshal + Default>(&mut self) -> Result<(u32, M)> {
        let frame = self.recv_frame().await?;
        let mut message = M::default();
        frame
            .unpack_into(&mut message)
            .map_err(|source| ClientError::Unpack {
                id: frame.protocol_id,
                source,
            })?;
        Ok((frame.protocol_id, message))
    }

    /// Call an RPC and wait for its result
    ///
    /// Fails with [`ClientError::Timeout`] when no response arrives within the
    /// configured `rpc_timeout`.
    pub async fn call<H: RpcHandler>(&mut self, argument: &H::Argument) -> Result<H::Result> {
        let trace_id = self.next_trace;
        self.next_trace += 1;

        let mut os = OctetsStream::new();
        // 请求方的角色标志取反后为 true
        os.pack(&trace_id).pack(&true).pack(argument);
        let payload = Bytes::copy_from_slice(os.data().as_slice());
        self.connection
            .send_frame(RawFrame::new(H::PROTOCOL_ID, payload))
            .await?;
        trace!(rpc = H::NAME, trace_id, "RPC sent");

        let timeout = self.rpc_timeout;
        tokio::time::timeout(timeout, self.wait_response::<H>(trace_id))
            .await
            .map_err(|_| ClientError::Timeout(format!("RPC {} trace {}", H::NAME, trace_id)))?
    }

    async fn wait_response<H: RpcHandler>(&mut self, trace_id: TraceId) -> Result<H::Result> {
        loop {
            let frame = self.connection.recv_frame().await?;
            if frame.protocol_id == H::PROTOCOL_ID {
                let response = unpack_response::<H>(&frame).map_err(|source| ClientError::Unpack {
                    id: frame.protocol_id,
                    source,
                })?;
                if let Some((id, result)) = response {
                    if id == trace_id {
                        return Ok(result);
                    }
                    trace!(rpc = H::NAME, trace_id = id, "Stale RPC response dropped");
                    continue;
                }
            }
            self.backlog.push_back(frame);
        }
    }

    /// Get connection state
    pub async fn state(&self) -> ClientState {
        self.connection.state().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Get server address
    pub fn server_addr(&self) -> SocketAddr {
        self.connection.server_addr()
    }

    /// Close connection
    pub async fn close(self) -> Result<()> {
        self.connection.close().await
    }

    /// Get connection reference (for advanced usage)
    pub fn connection(&mut self) -> &mut ClientConnection {
        &mut self.connection
    }
}

/// 解析 RPC 帧，服务端发来的请求返回 `None`
fn unpack_response<H: RpcHandler>(
    frame: &RawFrame,
) -> std::result::Result<Option<(TraceId, H::Result)>, MarshalError> {
    let mut os = OctetsStream::new();
    os.append(&frame.payload);
    let trace_id: TraceId = os.unpack()?;
    let is_server: bool = os.unpack()?;
    if is_server {
        return Ok(None);
    }
    let _argument: H::Argument = os.unpack()?;
    let result: H::Result = os.unpack()?;
    Ok(Some((trace_id, result)))
}
