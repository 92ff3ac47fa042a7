//! 信号自管道
//!
//! 异步信号处理函数只把信号编号写进管道，真正的回调由 Reactor 线程在读到管道数据后执行。

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::debug;

/// 当前接收信号的管道写端，-1 表示没有
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // SAFETY: write(2) 是异步信号安全的，缓冲区在栈上且长度为 1
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// 信号管道
///
/// 进程内同一时刻只有最后创建的管道接收信号。
#[derive(Debug)]
pub(crate) struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    installed: Vec<i32>,
}

impl SignalPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds 是长度为 2 的有效数组
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 成功后两个描述符都归我们所有
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        SIGNAL_WRITE_FD.store(write.as_raw_fd(), Ordering::Release);
        Ok(Self {
            read,
            write,
            installed: Vec::new(),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// 安装信号处理函数
    pub(crate) fn install(&mut self, signo: i32) -> io::Result<()> {
        if self.installed.contains(&signo) {
            return Ok(());
        }
        // SAFETY: sigaction 结构体全零是合法初始值，处理函数只调用异步信号安全的函数
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signo, &action, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.installed.push(signo);
        debug!(signo, "已安装信号处理函数");
        Ok(())
    }

    /// 恢复信号的默认处理
    pub(crate) fn uninstall(&mut self, signo: i32) {
        if let Some(pos) = self.installed.iter().position(|&s| s == signo) {
            self.installed.swap_remove(pos);
            // SAFETY: 恢复为 SIG_DFL 总是合法的
            unsafe {
                libc::signal(signo, libc::SIG_DFL);
            }
        }
    }

    /// 读出所有已到达的信号编号
    pub(crate) fn drain(&self) -> Vec<i32> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf 在整个调用期间有效
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            signals.extend(buf[..n as usize].iter().map(|&b| i32::from(b)));
        }
        signals
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for signo in std::mem::take(&mut self.installed) {
            // SAFETY: 同 uninstall
            unsafe {
                libc::signal(signo, libc::SIG_DFL);
            }
        }
        let _ = SIGNAL_WRITE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
