//! 会话管理
//!
//! 会话、会话管理器，以及监听、连接和收发三种 I/O 事件。

pub mod handler;
pub mod id;
pub mod io;
pub mod manager;
pub mod metrics;
#[allow(clippy::module_inception)]
pub mod session;

// 重新导出主要类型
pub use handler::SessionHandler;
pub use id::{SessionId, SessionIdGenerator};
pub use manager::SessionManager;
pub use metrics::SessionMetrics;
pub use session::{Session, SessionState};
