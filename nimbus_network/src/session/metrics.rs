//! 会话指标
//!
//! 每个会话管理器一份，全部是原子计数。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 会话指标
#[derive(Debug, Default)]
pub struct SessionMetrics {
    current_sessions: AtomicUsize,
    total_sessions: AtomicU64,
    rejected_sessions: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    /// 写缓冲区空间不足而丢弃的帧
    frames_dropped: AtomicU64,
    decode_errors: AtomicU64,
}

impl SessionMetrics {
    /// 创建新的会话指标
    pub fn new() -> Self {
        Self::default()
    }

    /// 新会话建立
    pub fn inc_sessions(&self) {
        self.current_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// 会话关闭
    pub fn dec_sessions(&self) {
        self.current_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// 超过连接上限被拒绝
    pub fn record_rejected(&self) {
        self.rejected_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录接收字节
    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 记录发送字节
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 记录收到一帧
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录发出一帧
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录丢弃一帧
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录解码错误
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 当前会话数
    pub fn current_sessions(&self) -> usize {
        self.current_sessions.load(Ordering::Relaxed)
    }

    /// 累计会话数
    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// 被拒绝的连接数
    pub fn rejected_sessions(&self) -> u64 {
        self.rejected_sessions.load(Ordering::Relaxed)
    }

    /// 接收字节数
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// 发送字节数
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// 接收帧数
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// 发送帧数
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// 丢弃帧数
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// 解码错误数
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// 生成摘要报告
    pub fn summary(&self) -> String {
        format!(
            "会话指标:\n\
             - 当前会话: {}\n\
             - 总会话数: {}\n\
             - 拒绝连接: {}\n\
             - 接收字节: {}\n\
             - 发送字节: {}\n\
             - 接收帧: {}\n\
             - 发送帧: {}\n\
             - 丢弃帧: {}\n\
             - 解码错误: {}",
            self.current_sessions(),
            self.total_sessions(),
            self.rejected_sessions(),
            self.bytes_received(),
            self.bytes_sent(),
            self.frames_received(),
            self.frames_sent(),
            self.frames_dropped(),
            self.decode_errors()
        )
    }
}
