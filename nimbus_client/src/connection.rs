//! Client connection management

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nimbus_core::{Marshal, OctetsStream};
use nimbus_network::{Protocol, ProtocolCodec, RawFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{RwLock, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Client connection - split read/write for concurrent access
pub struct ClientConnection {
    /// Read half for receiving frames
    read_half: FramedRead<OwnedReadHalf, ProtocolCodec>,

    /// Channel sender for sending frames (write half is owned by sender task)
    send_tx: mpsc::Sender<RawFrame>,

    /// Remote server address
    server_addr: SocketAddr,

    /// Connection metadata
    connected_at: Instant,

    /// Last activity timestamp
    last_active: Arc<RwLock<Instant>>,

    /// Connection state
    state: Arc<RwLock<ClientState>>,
}

impl ClientConnection {
    /// Connect to server
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let state = Arc::new(RwLock::new(ClientState::Connecting));

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.server_addr),
        )
        .await
        .map_err(|_| ClientError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::ConnectionFailed(format!("Failed to set nodelay: {}", e)))?;

        let server_addr = stream.peer_addr().map_err(|e| {
            ClientError::ConnectionFailed(format!("Failed to get peer address: {}", e))
        })?;

        let (read_half, write_half) = stream.into_split();
        let read_half =
            FramedRead::new(read_half, ProtocolCodec::with_max_frame_size(config.max_frame_size));
        let mut write_half =
            FramedWrite::new(write_half, ProtocolCodec::with_max_frame_size(config.max_frame_size));

        let (send_tx, mut send_rx) = mpsc::channel::<RawFrame>(config.send_queue_size);

        // Background sender task owns the write half
        let state_clone = state.clone();
        tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                // Frames queued before close are still flushed
                if *state_clone.read().await == ClientState::Disconnected {
                    break;
                }
                if let Err(e) = write_half.send(frame).await {
                    warn!(addr = %server_addr, error = %e, "Send task error");
                    *state_clone.write().await = ClientState::Disconnected;
                    break;
                }
            }
            debug!(addr = %server_addr, "Send task finished");
        });

        let now = Instant::now();
        *state.write().await = ClientState::Connected;

        Ok(Self {
            read_half,
            send_tx,
            server_addr,
            connected_at: now,
            last_active: Arc::new(RwLock::new(now)),
            state,
        })
    }

    async fn ensure_connected(&self) -> Result<()> {
        if *self.state.read().await != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    async fn touch(&self) {
        *self.last_active.write().await = Instant::now();
    }

    /// Send a frame
    pub async fn send_frame(&mut self, frame: RawFrame) -> Result<()> {
        self.ensure_connected().await?;
        self.send_tx
            .send(frame)
            .await
            .map_err(|e| ClientError::SendFailed(e.to_string()))?;
        self.touch().await;
        Ok(())
    }

    /// Send a registered protocol
    pub async fn send_protocol(&mut self, protocol: &dyn Protocol) -> Result<()> {
        self.send_frame(RawFrame::from_protocol(protocol)).await
    }

    /// Pack `message` as the payload of `protocol_id`
    pub async fn send_message<M: Marshal>(&mut self, protocol_id: u32, message: &M) -> Result<()> {
        let mut os = OctetsStream::new();
        os.pack(message);
        let payload = Bytes::copy_from_slice(os.data().as_slice());
        self.send_frame(RawFrame::new(protocol_id, payload)).await
    }

    /// Receive next frame
    pub async fn recv_frame(&mut self) -> Result<RawFrame> {
        self.ensure_connected().await?;
        let frame = match self.read_half.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(e.into());
            }
            None => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::ReceiveFailed("Connection closed".to_string()));
            }
        };
        self.touch().await;
        Ok(frame)
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

    /// Get connection state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Get server address
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Get connected time
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Get last activity time
    pub async fn last_active(&self) -> Instant {
        *self.last_active.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }

    /// Close connection
    pub async fn close(self) -> Result<()> {
        *self.state.write().await = ClientState::ShuttingDown;
        // Dropping the sender ends the sender task, which drops the write half
        drop(self.send_tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    #[test]
    fn test_client_state() {
        let state = ClientState::Disconnected;
        assert_eq!(state, ClientState::Disconnected);
        assert_ne!(state, ClientState::Connected);
    }

    #[tokio::test]
    async fn test_echo_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, ProtocolCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                framed.send(frame).await.unwrap();
            }
        });

        let mut conn = ClientConnection::connect(&ClientConfig::new(addr)).await.unwrap();
        assert!(conn.is_connected().await);
        conn.send_message(7, &String::from("hi")).await.unwrap();
        let (id, text) = conn.recv_message::<String>().await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(text, "hi");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut conn = ClientConnection::connect(&ClientConfig::new(addr)).await.unwrap();
        assert!(conn.recv_frame().await.is_err());
        assert_eq!(conn.state().await, ClientState::Disconnected);
        assert!(matches!(
            conn.send_frame(RawFrame::new(1, Bytes::new())).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = ClientConnection::connect(&ClientConfig::new(addr)).await;
        assert!(matches!(result, Err(ClientError::ConnectionFailed(_))));
    }
}
