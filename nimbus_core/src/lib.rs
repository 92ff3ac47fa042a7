//! Nimbus 核心组件
//!
//! 提供错误类型、序列化编解码、对象池、同步原语、线程池和时间轮。

pub mod error;
pub mod marshal;
pub mod pool;
pub mod sync;
pub mod threadpool;
pub mod timewheel;

// 导出主要类型到 crate root
pub use crate::error::{ErrorContext, NimbusError, NimbusErrorKind, Result};
pub use crate::marshal::{Marshal, MarshalError, Octets, OctetsStream, Transaction};
pub use crate::pool::{LockFreePool, ObjectPool, PoolError, PoolKey};
pub use crate::sync::{ChangeList, SpinLock, SpinLockGuard};
pub use crate::threadpool::{Runnable, Task, ThreadPool};
pub use crate::timewheel::{NEAR_SLOTS, Repeat, TimeWheel, TimerId};

// 预导出
pub mod prelude {
    pub use crate::error::{NimbusError, NimbusErrorKind, Result};
    pub use crate::marshal::{Marshal, MarshalError, Octets, OctetsStream};
    pub use crate::threadpool::ThreadPool;
    pub use crate::timewheel::{Repeat, TimeWheel, TimerId};
}
