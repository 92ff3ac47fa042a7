//! # Nimbus - 基于 Reactor 的异步网络引擎
//!
//! Nimbus 用少量线程上的 epoll Reactor 驱动大量 TCP 会话，把收到的协议交给多组工作线程处理，
//! 并在此之上提供带超时和转发能力的 RPC。
//!
//! ## 特性
//!
//! - 主从 Reactor，非阻塞 I/O，跨线程安全地注册和修改事件
//! - 变长整数 + 长度前缀的协议帧，协议原型注册表
//! - 多组线程池，按协议选择线程组
//! - 时间轮定时器，或直接由 Reactor 驱动的定时器
//! - RPC 调用、超时回调和代理转发
//! - 会话保活、断线重连、最大连接数和禁用协议
//!
//! ## 快速开始
//!
//! ### 服务器
//!
//! ```rust,no_run,ignore
//! use nimbus::App;
//!
//! fn main() -> nimbus::Result<()> {
//!     nimbus::init_tracing("info")?;
//!     App::from_file("nimbus.toml")?
//!         .register_rpc(JudgeRpc)?
//!         .listen(Gateway)
//!         .run()
//! }
//! ```
//!
//! ### 客户端
//!
//! ```rust,no_run,ignore
//! use nimbus::Client;
//!
//! #[tokio::main]
//! async fn main() -> nimbus::Result<()> {
//!     let mut client = Client::connect("127.0.0.1:8888").await?;
//!     let verdict = client.call::<JudgeRpc>(&Score { value: 0.5 }).await?;
//!     client.close().await
//! }
//! ```
//!
//! ## 模块组织
//!
//! - `nimbus_config` - TOML 配置与环境变量覆盖
//! - `nimbus_core` - 序列化、线程池、时间轮、对象池
//! - `nimbus_network` - Reactor、协议、会话、RPC、运行时
//! - `nimbus_client` - 基于 Tokio 的异步客户端

mod error;
mod logging;

pub use crate::error::{Error, Result};
pub use crate::logging::init_tracing;

// Server API
#[cfg(feature = "server")]
pub mod app;

#[cfg(feature = "server")]
pub use crate::app::{App, Server};

// Client API
#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "client")]
pub use crate::client::{Client, StreamClient};

// ============================================================================
// Crate Re-exports (for advanced users)
// ============================================================================

#[cfg(feature = "server")]
pub use nimbus_config;

#[cfg(any(feature = "server", feature = "client"))]
pub use nimbus_core;

#[cfg(any(feature = "server", feature = "client"))]
pub use nimbus_network;

#[cfg(feature = "client")]
pub use nimbus_client;

/// 预导出常用类型
///
/// 通过 `use nimbus::prelude::*;` 导入所有常用类型
pub mod prelude {
    pub use crate::error::{Error, Result};

    #[cfg(feature = "server")]
    pub use nimbus_config::{NimbusConfig, SessionManagerConfig};

    #[cfg(any(feature = "server", feature = "client"))]
    pub use nimbus_network::prelude::*;

    #[cfg(feature = "server")]
    pub use crate::app::{App, Server};

    #[cfg(feature = "client")]
    pub use crate::client::{Client, StreamClient};
}

/// Nimbus 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Nimbus 包名
pub const NAME: &str = env!("CARGO_PKG_NAME");
