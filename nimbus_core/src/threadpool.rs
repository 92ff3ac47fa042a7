//! 线程池
//!
//! 按线程组划分的工作线程池。每个线程组拥有一个有界队列、若干工作线程、
//! 一个条件变量和一个在途任务计数。
//!
//! 工作线程取任务的顺序：
//! 1. 当前线程的 essential 队列（只能由本线程的任务投递）
//! 2. 本组队列
//! 3. 开启偷取时，从随机偏移的其他组 `try_lock` 偷取一个任务

use crate::error::{NimbusError, Result};
use nimbus_config::ThreadPoolConfig;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 开启偷取时空闲线程的轮询间隔
const STEAL_INTERVAL: Duration = Duration::from_millis(5);

/// 可执行任务
pub trait Runnable: Send {
    /// 执行任务
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> Runnable for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// 装箱的任务
pub type Task = Box<dyn Runnable>;

struct Queued {
    origin: usize,
    task: Task,
}

thread_local! {
    static ESSENTIAL: RefCell<VecDeque<Queued>> = const { RefCell::new(VecDeque::new()) };
    static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

struct ThreadGroup {
    capacity: usize,
    threads: usize,
    queue: Mutex<VecDeque<Queued>>,
    cond: Condvar,
    inflight: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl ThreadGroup {
    fn new(capacity: usize, threads: usize) -> Self {
        Self {
            capacity,
            threads,
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            inflight: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    fn finish_one(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.idle_lock.lock();
        while self.inflight.load(Ordering::Acquire) != 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut guard, deadline).timed_out() {
                        return self.inflight.load(Ordering::Acquire) == 0;
                    }
                }
                None => self.idle.wait(&mut guard),
            }
        }
        true
    }
}

struct Shared {
    groups: Vec<ThreadGroup>,
    stopped: AtomicBool,
    steal: bool,
    executed: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn execute(&self, queued: Queued) {
        let Queued { origin, task } = queued;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            error!(group = origin, "任务执行 panic: {}", panic_message(&*payload));
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.groups[origin].finish_one();
    }

    fn try_steal(&self, own: usize) -> Option<Queued> {
        let count = self.groups.len();
        let offset = rand::thread_rng().gen_range(0..count);
        for i in 0..count {
            let index = (offset + i) % count;
            if index == own {
                continue;
            }
            let group = &self.groups[index];
            let Some(mut queue) = group.queue.try_lock() else {
                continue;
            };
            if let Some(queued) = queue.pop_front() {
                let more = !queue.is_empty();
                drop(queue);
                if more {
                    group.cond.notify_one();
                }
                return Some(queued);
            }
        }
        None
    }

    fn worker_loop(self: Arc<Self>, group: usize) {
        CURRENT.with(|current| current.set(Some((self.id(), group))));
        let own = &self.groups[group];
        loop {
            if let Some(queued) = ESSENTIAL.with(|essential| essential.borrow_mut().pop_front()) {
                self.execute(queued);
                continue;
            }

            let mut queue = own.queue.lock();
            if let Some(queued) = queue.pop_front() {
                drop(queue);
                self.execute(queued);
                continue;
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            if self.steal && self.groups.len() > 1 {
                drop(queue);
                if let Some(queued) = self.try_steal(group) {
                    self.execute(queued);
                    continue;
                }
                queue = own.queue.lock();
                if queue.is_empty() && !self.stopped.load(Ordering::Acquire) {
                    own.cond.wait_for(&mut queue, STEAL_INTERVAL);
                }
            } else {
                own.cond.wait(&mut queue);
            }
        }
        CURRENT.with(|current| current.set(None));
        debug!(group, "工作线程退出");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "未知 panic".to_string()
    }
}

/// 线程池
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// 根据配置创建并启动线程池
    pub fn new(config: &ThreadPoolConfig) -> Result<Self> {
        if config.groups.is_empty() {
            return Err(NimbusError::validation("线程池至少需要一个线程组"));
        }
        let mut groups = Vec::with_capacity(config.groups.len());
        for (index, &(capacity, threads)) in config.groups.iter().enumerate() {
            if capacity == 0 || threads == 0 {
                return Err(NimbusError::validation(format!(
                    "线程组 {} 的队列容量和线程数必须大于 0",
                    index
                )));
            }
            groups.push(ThreadGroup::new(capacity, threads));
        }

        let shared = Arc::new(Shared {
            groups,
            stopped: AtomicBool::new(false),
            steal: config.steal,
            executed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        };
        for (group, tg) in shared.groups.iter().enumerate() {
            for i in 0..tg.threads {
                let worker = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(format!("nimbus-worker-{}-{}", group, i))
                    .spawn(move || worker.worker_loop(group))
                    .map_err(|e| NimbusError::from(e).with_context(("thread_group", group as u64)))?;
                pool.workers.lock().push(handle);
            }
        }

        info!(
            groups = shared.groups.len(),
            threads = pool.workers.lock().len(),
            steal = config.steal,
            "线程池已启动"
        );
        Ok(pool)
    }

    /// 投递任务到线程组 `group`（按组数取模）
    ///
    /// 队列已满或线程池已停止时丢弃任务并返回 `false`。
    pub fn add_task(&self, group: usize, task: Task) -> bool {
        let index = group % self.shared.groups.len();
        if self.shared.stopped.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(group = index, "线程池已停止，丢弃任务");
            return false;
        }

        let tg = &self.shared.groups[index];
        let mut queue = tg.queue.lock();
        if queue.len() >= tg.capacity {
            drop(queue);
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(group = index, capacity = tg.capacity, "线程组队列已满，丢弃任务");
            return false;
        }
        tg.inflight.fetch_add(1, Ordering::AcqRel);
        queue.push_back(Queued {
            origin: index,
            task,
        });
        drop(queue);
        tg.cond.notify_one();
        true
    }

    /// 投递闭包
    pub fn execute<F>(&self, group: usize, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(group, Box::new(f))
    }

    /// 投递到当前工作线程的 essential 队列
    ///
    /// 该任务会在当前线程下一次取任务时优先执行；
    /// 不在本线程池的工作线程上调用时退化为 `add_task(0, task)`。
    pub fn add_essential_task(&self, task: Task) -> bool {
        let id = self.shared.id();
        match CURRENT.with(Cell::get) {
            Some((pool, group)) if pool == id => {
                if self.shared.stopped.load(Ordering::Acquire) {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(group, "线程池已停止，丢弃 essential 任务");
                    return false;
                }
                self.shared.groups[group]
                    .inflight
                    .fetch_add(1, Ordering::AcqRel);
                ESSENTIAL.with(|essential| {
                    essential.borrow_mut().push_back(Queued {
                        origin: group,
                        task,
                    })
                });
                true
            }
            _ => self.add_task(0, task),
        }
    }

    /// 等待线程组 `group` 的在途任务清零
    pub fn wait_group_done(&self, group: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let index = group % self.shared.groups.len();
        self.shared.groups[index].wait_idle(deadline)
    }

    /// 等待所有线程组的在途任务清零，超时返回 `false`
    pub fn wait_for_all_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.shared
            .groups
            .iter()
            .all(|group| group.wait_idle(deadline))
    }

    /// 线程组数量
    pub fn group_count(&self) -> usize {
        self.shared.groups.len()
    }

    /// 线程组中已接受但未执行完的任务数
    pub fn inflight(&self, group: usize) -> usize {
        let index = group % self.shared.groups.len();
        self.shared.groups[index].inflight.load(Ordering::Acquire)
    }

    /// 已执行的任务总数
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// 被丢弃的任务总数
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// 是否已停止
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// 停止接受新任务，执行完队列中的任务后回收工作线程
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            info!("线程池停止中");
        }
        for group in &self.shared.groups {
            let _queue = group.queue.lock();
            group.cond.notify_all();
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("工作线程异常退出");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(groups: Vec<(usize, usize)>, steal: bool) -> ThreadPoolConfig {
        ThreadPoolConfig { groups, steal }
    }

    #[test]
    fn test_all_tasks_run() {
        let pool = ThreadPool::new(&config(vec![(1024, 2), (1024, 1)], false)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..200 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(i, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_for_all_done(Some(Duration::from_secs(5))));
        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(pool.inflight(0), 0);
        assert_eq!(pool.inflight(1), 0);
    }

    /// 多个线程并发投递到多个线程组，任务既不丢失也不重复
    fn assert_conservation(steal: bool) {
        const SUBMITTERS: usize = 4;
        const PER_SUBMITTER: usize = 5_000;
        let pool = Arc::new(
            ThreadPool::new(&config(vec![(100_000, 2), (100_000, 1), (100_000, 3)], steal)).unwrap(),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let submitters: Vec<_> = (0..SUBMITTERS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for i in 0..PER_SUBMITTER {
                        let counter = Arc::clone(&counter);
                        assert!(pool.execute(t + i, move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        let total = SUBMITTERS * PER_SUBMITTER;
        assert!(pool.wait_for_all_done(Some(Duration::from_secs(10))));
        assert_eq!(counter.load(Ordering::SeqCst), total);
        assert_eq!(pool.executed(), total as u64);
        assert_eq!(pool.dropped(), 0);
    }

    #[test]
    fn test_conservation_without_steal() {
        assert_conservation(false);
    }

    #[test]
    fn test_conservation_with_steal() {
        assert_conservation(true);
    }

    #[test]
    fn test_full_queue_drops_task() {
        let pool = ThreadPool::new(&config(vec![(1, 1)], false)).unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();

        // 占住唯一的工作线程
        assert!(pool.execute(0, move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();

        assert!(pool.execute(0, || {}));
        assert!(!pool.execute(0, || {}));
        assert_eq!(pool.dropped(), 1);

        gate_tx.send(()).unwrap();
        assert!(pool.wait_for_all_done(Some(Duration::from_secs(5))));
        assert_eq!(pool.executed(), 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let pool = ThreadPool::new(&config(vec![(16, 1)], false)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.execute(0, || panic!("boom"));
        let c = Arc::clone(&counter);
        pool.execute(0, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pool.wait_for_all_done(Some(Duration::from_secs(5))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_after_stop_is_dropped() {
        let pool = ThreadPool::new(&config(vec![(16, 1)], false)).unwrap();
        pool.stop();
        assert!(pool.is_stopped());
        assert!(!pool.execute(0, || {}));
    }

    #[test]
    fn test_stop_drains_queue() {
        let pool = ThreadPool::new(&config(vec![(1024, 1)], false)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            pool.execute(0, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_essential_task_runs_on_same_thread() {
        let pool = Arc::new(ThreadPool::new(&config(vec![(16, 2)], false)).unwrap());
        let (tx, rx) = std::sync::mpsc::channel();
        let inner_pool = Arc::clone(&pool);
        pool.execute(0, move || {
            let outer = thread::current().id();
            let tx = tx.clone();
            inner_pool.add_essential_task(Box::new(move || {
                tx.send(outer == thread::current().id()).unwrap();
            }));
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(pool.wait_for_all_done(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_essential_task_off_worker_goes_to_group_zero() {
        let pool = ThreadPool::new(&config(vec![(16, 1), (16, 1)], false)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        pool.add_essential_task(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("nimbus-worker-0-0"));
    }

    #[test]
    fn test_wait_times_out_while_busy() {
        let pool = ThreadPool::new(&config(vec![(16, 1)], false)).unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        pool.execute(0, move || {
            gate_rx.recv().unwrap();
        });
        assert!(!pool.wait_for_all_done(Some(Duration::from_millis(20))));
        gate_tx.send(()).unwrap();
        assert!(pool.wait_group_done(0, Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_invalid_config() {
        assert!(ThreadPool::new(&config(vec![], false)).is_err());
        assert!(ThreadPool::new(&config(vec![(0, 1)], false)).is_err());
        assert!(ThreadPool::new(&config(vec![(1, 0)], false)).is_err());
    }
}
