//! 配置管理系统
//!
//! 提供引擎各子系统（定时器、Reactor、线程池、会话管理器）的配置，
//! 支持 TOML 文件加载与环境变量覆盖。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 解析错误
    #[error("解析配置文件失败: {0}")]
    Parse(String),

    /// 验证错误
    #[error("配置验证失败: {0}")]
    Validation(String),

    /// 环境变量错误
    #[error("环境变量解析失败: {0}")]
    EnvVar(String),

    /// 缺少会话管理器配置段
    #[error("缺少会话管理器配置: managers.{0}")]
    MissingManager(String),
}

/// 配置 Result 类型
pub type Result<T> = std::result::Result<T, ConfigError>;

/// 对象池容量上限
pub const MAX_POOL_SIZE: usize = 4_194_304;

/// 引擎完整配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NimbusConfig {
    /// 时间轮配置
    #[serde(default)]
    pub timer: TimerConfig,

    /// Reactor 配置
    #[serde(default)]
    pub reactor: ReactorConfig,

    /// 线程池配置
    #[serde(default)]
    pub threadpool: ThreadPoolConfig,

    /// 会话管理器配置，键为管理器的 identity
    #[serde(default)]
    pub managers: BTreeMap<String, SessionManagerConfig>,
}

/// 时间轮配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerConfig {
    /// 每个 tick 的间隔（毫秒）
    #[serde(default = "default_timer_interval")]
    pub interval: u64,

    /// 定时器节点池容量
    #[serde(default = "default_timer_poolsize")]
    pub poolsize: usize,
}

/// 负载均衡策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    /// 轮询
    #[default]
    RoundRobin,
    /// 随机
    Random,
    /// 最少连接
    LeastConnections,
}

/// Reactor 配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// 多路复用器类型，目前只支持 "epoller"
    #[serde(default = "default_demultiplexer")]
    pub demultiplexer: String,

    /// 空闲时 dispatch 的最长等待时间（毫秒）
    #[serde(default = "default_reactor_timeout")]
    pub timeout: u64,

    /// 是否使用独立的时间轮线程驱动定时器
    #[serde(default = "default_use_timer_thread")]
    pub use_timer_thread: bool,

    /// 子 Reactor 数量，0 表示所有连接都在主 Reactor 上处理
    #[serde(default)]
    pub sub_reactor_count: usize,

    /// 新连接在子 Reactor 之间的分配策略
    #[serde(default)]
    pub load_balance: LoadBalanceKind,
}

/// 线程池配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// 线程组列表，每项为 (队列容量, 线程数)
    #[serde(default = "default_thread_groups")]
    pub groups: Vec<(usize, usize)>,

    /// 空闲线程是否从其他线程组偷取任务
    #[serde(default)]
    pub steal: bool,
}

/// 会话管理器配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionManagerConfig {
    /// socket 类型，目前只支持 "tcp"
    #[serde(default = "default_socktype")]
    pub socktype: String,

    /// 监听或连接地址
    #[serde(default = "default_address")]
    pub address: String,

    /// 监听或连接端口
    #[serde(default = "default_port")]
    pub port: u16,

    /// 最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// 每个会话的读缓冲区大小
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,

    /// 每个会话的写缓冲区大小
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// 空闲会话超时（毫秒），0 表示不检测
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,

    /// 禁止接收的协议 ID
    #[serde(default)]
    pub forbidden_protocols: Vec<u32>,

    /// 客户端断线重连间隔（毫秒），0 表示不重连
    #[serde(default)]
    pub reconnect_interval: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            interval: default_timer_interval(),
            poolsize: default_timer_poolsize(),
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            demultiplexer: default_demultiplexer(),
            timeout: default_reactor_timeout(),
            use_timer_thread: default_use_timer_thread(),
            sub_reactor_count: 0,
            load_balance: LoadBalanceKind::default(),
        }
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            groups: default_thread_groups(),
            steal: false,
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            socktype: default_socktype(),
            address: default_address(),
            port: default_port(),
            max_connections: default_max_connections(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            keepalive_timeout: default_keepalive_timeout(),
            forbidden_protocols: Vec::new(),
            reconnect_interval: 0,
        }
    }
}

impl TimerConfig {
    /// tick 间隔
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }
}

impl ReactorConfig {
    /// 空闲等待时间
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

impl SessionManagerConfig {
    /// 获取完整的地址字符串
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 空闲超时，未启用时返回 None
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        (self.keepalive_timeout > 0).then(|| Duration::from_millis(self.keepalive_timeout))
    }

    /// 重连间隔，未启用时返回 None
    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval > 0).then(|| Duration::from_millis(self.reconnect_interval))
    }

    /// 验证单个管理器配置
    pub fn validate(&self, identity: &str) -> Result<()> {
        if self.socktype != "tcp" {
            return Err(ConfigError::Validation(format!(
                "managers.{}: 不支持的 socktype {}",
                identity, self.socktype
            )));
        }
        if self.address.is_empty() {
            return Err(ConfigError::Validation(format!("managers.{}: 地址不能为空", identity)));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(format!(
                "managers.{}: 最大连接数不能为 0",
                identity
            )));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(ConfigError::Validation(format!(
                "managers.{}: 读写缓冲区大小不能为 0",
                identity
            )));
        }
        Ok(())
    }
}

impl NimbusConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("读取配置文件失败: {}", e)))?;
        Self::from_toml(&content)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(format!("解析配置文件失败: {}", e)))
    }

    /// 从环境变量加载配置并覆盖
    ///
    /// 支持的环境变量：
    /// - NIMBUS_TIMER_INTERVAL: tick 间隔（毫秒）
    /// - NIMBUS_REACTOR_TIMEOUT: Reactor 空闲等待时间（毫秒）
    /// - NIMBUS_REACTOR_SUB_REACTORS: 子 Reactor 数量
    /// - NIMBUS_REACTOR_USE_TIMER_THREAD: 是否使用时间轮线程 (true/false)
    /// - NIMBUS_THREADPOOL_STEAL: 是否开启任务偷取 (true/false)
    pub fn load_with_env_override(self) -> Result<Self> {
        self.load_with_lookup(|key| std::env::var(key).ok())
    }

    /// 使用自定义查找函数覆盖配置
    pub fn load_with_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NIMBUS_TIMER_INTERVAL") {
            self.timer.interval = v
                .parse()
                .map_err(|_| ConfigError::EnvVar("NIMBUS_TIMER_INTERVAL 必须是有效的 u64 数字".to_string()))?;
        }

        if let Some(v) = lookup("NIMBUS_REACTOR_TIMEOUT") {
            self.reactor.timeout = v
                .parse()
                .map_err(|_| ConfigError::EnvVar("NIMBUS_REACTOR_TIMEOUT 必须是有效的 u64 数字".to_string()))?;
        }

        if let Some(v) = lookup("NIMBUS_REACTOR_SUB_REACTORS") {
            self.reactor.sub_reactor_count = v.parse().map_err(|_| {
                ConfigError::EnvVar("NIMBUS_REACTOR_SUB_REACTORS 必须是有效的 usize 数字".to_string())
            })?;
        }

        if let Some(v) = lookup("NIMBUS_REACTOR_USE_TIMER_THREAD") {
            self.reactor.use_timer_thread = v.parse().map_err(|_| {
                ConfigError::EnvVar("NIMBUS_REACTOR_USE_TIMER_THREAD 必须是 true 或 false".to_string())
            })?;
        }

        if let Some(v) = lookup("NIMBUS_THREADPOOL_STEAL") {
            self.threadpool.steal = v
                .parse()
                .map_err(|_| ConfigError::EnvVar("NIMBUS_THREADPOOL_STEAL 必须是 true 或 false".to_string()))?;
        }

        Ok(self)
    }

    /// 从文件加载并应用环境变量覆盖
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(path)?.load_with_env_override()
    }

    /// 按 identity 查找会话管理器配置
    pub fn manager(&self, identity: &str) -> Result<&SessionManagerConfig> {
        self.managers
            .get(identity)
            .ok_or_else(|| ConfigError::MissingManager(identity.to_string()))
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        if self.timer.interval == 0 {
            return Err(ConfigError::Validation("timer.interval 不能为 0".to_string()));
        }
        if self.timer.poolsize == 0 || self.timer.poolsize > MAX_POOL_SIZE {
            return Err(ConfigError::Validation(format!(
                "timer.poolsize 必须在 1..={} 之间",
                MAX_POOL_SIZE
            )));
        }

        if self.reactor.demultiplexer != "epoller" {
            return Err(ConfigError::Validation(format!(
                "不支持的多路复用器: {}",
                self.reactor.demultiplexer
            )));
        }
        if self.reactor.sub_reactor_count > 256 {
            return Err(ConfigError::Validation("子 Reactor 数量过大 (建议 <= 256)".to_string()));
        }

        if self.threadpool.groups.is_empty() {
            return Err(ConfigError::Validation("threadpool.groups 不能为空".to_string()));
        }
        for (idx, (capacity, threads)) in self.threadpool.groups.iter().enumerate() {
            if *capacity == 0 {
                return Err(ConfigError::Validation(format!("线程组 {} 的队列容量不能为 0", idx)));
            }
            if *threads == 0 {
                return Err(ConfigError::Validation(format!("线程组 {} 的线程数不能为 0", idx)));
            }
            if *threads > 512 {
                return Err(ConfigError::Validation(format!(
                    "线程组 {} 的线程数过大 (建议 <= 512)",
                    idx
                )));
            }
        }

        for (identity, manager) in &self.managers {
            manager.validate(identity)?;
        }

        Ok(())
    }

    /// 获取配置摘要信息
    pub fn summary(&self) -> String {
        let managers = self
            .managers
            .iter()
            .map(|(name, m)| format!("{}@{}", name, m.bind_addr()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Nimbus 引擎配置:\n  时间轮: {}ms x {}\n  Reactor: {} (子 Reactor {}, 时间轮线程 {})\n  线程组: {:?} (偷取 {})\n  会话管理器: [{}]",
            self.timer.interval,
            self.timer.poolsize,
            self.reactor.demultiplexer,
            self.reactor.sub_reactor_count,
            self.reactor.use_timer_thread,
            self.threadpool.groups,
            self.threadpool.steal,
            managers
        )
    }
}

// 默认值函数
fn default_timer_interval() -> u64 {
    10
}

fn default_timer_poolsize() -> usize {
    65536
}

fn default_demultiplexer() -> String {
    "epoller".to_string()
}

fn default_reactor_timeout() -> u64 {
    1000
}

fn default_use_timer_thread() -> bool {
    true
}

fn default_thread_groups() -> Vec<(usize, usize)> {
    vec![(65536, num_cpus::get().max(1))]
}

fn default_socktype() -> String {
    "tcp".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_max_connections() -> usize {
    10000
}

fn default_buffer_size() -> usize {
    65536
}

fn default_keepalive_timeout() -> u64 {
    30000
}
