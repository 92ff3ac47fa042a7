//! # Nimbus Client
//!
//! Async client library for connecting to Nimbus servers.
//!
//! ## Features
//!
//! - Async frame send/receive over the Nimbus wire format
//! - `Marshal` payloads and registered `Protocol` values
//! - RPC request/response with timeout
//!
//! ## Quick Start
//!
//! ```rust,no_run,ignore
//! use nimbus_client::StreamClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = StreamClient::connect("127.0.0.1:8888".parse()?).await?;
//!
//!     // RPC (requires an RpcHandler type shared with the server)
//!     // let result = client.call::<MyRpc>(&argument).await?;
//!
//!     // Raw message
//!     client.send_message(7, &String::from("hello")).await?;
//!     let (protocol_id, reply) = client.recv_message::<String>().await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;

// Stream API
pub mod stream;

// Re-export main types
pub use crate::config::ClientConfig;
pub use crate::connection::{ClientConnection, ClientState};
pub use crate::error::{ClientError, Result};
pub use crate::stream::StreamClient;

// Prelude module for common imports
pub mod prelude {
    pub use crate::config::ClientConfig;
    pub use crate::connection::{ClientConnection, ClientState};
    pub use crate::error::{ClientError, Result};
    pub use crate::stream::StreamClient;
}
