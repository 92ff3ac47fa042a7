//! 时间轮
//!
//! `NEAR_SLOTS` 个近槽位按 `tick % NEAR_SLOTS` 索引，距离不小于 `NEAR_SLOTS`
//! 的定时器挂在 hanging 链表上，每转一圈重新分组一次。
//!
//! 任意线程都可以添加、删除、修改定时器：节点在对象池中分配，
//! 状态变更写入双缓冲变更队列，由 tick 线程在下一次 tick 开始时统一处理。
//! 槽位链表只由 tick 线程修改，链表指针保存在时间轮自己的数组里。

use crate::error::{NimbusError, Result};
use crate::pool::{LockFreePool, PoolError, PoolKey};
use crate::sync::ChangeList;
use nimbus_config::TimerConfig;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// 近槽位数量
pub const NEAR_SLOTS: usize = 4096;

const NIL: u32 = u32::MAX;

/// 定时器句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(PoolKey);

impl TimerId {
    /// 节点在对象池中的下标
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// 重复次数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// 直到回调返回 `false`
    Forever,
    /// 最多触发 n 次，`Times(0)` 与 `Times(1)` 相同
    Times(u32),
}

impl Repeat {
    /// 消耗一次触发，返回是否还需要继续
    pub fn next(&mut self) -> bool {
        match self {
            Repeat::Forever => true,
            Repeat::Times(n) => {
                *n = n.saturating_sub(1);
                *n > 0
            }
        }
    }
}

/// 定时器回调，返回 `true` 表示继续
pub type TimerHandler = Box<dyn FnMut() -> bool + Send>;

/// 节点状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// 未使用
    None,
    /// 已挂到槽位上
    Active,
    /// 等待加入
    Add,
    /// 等待删除
    Del,
    /// 等待修改
    Mod,
}

struct TimerNode {
    state: TimerState,
    expire: u64,
    timeout: u64,
    repeat: Repeat,
    handler: Option<TimerHandler>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Near(usize),
    Hanging,
}

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
    expire: u64,
    bucket: Option<Bucket>,
    key: Option<PoolKey>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            expire: 0,
            bucket: None,
            key: None,
        }
    }
}

#[derive(Clone, Copy)]
struct List {
    head: u32,
    tail: u32,
    len: usize,
}

impl Default for List {
    fn default() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

/// 只由 tick 线程访问的槽位链表
struct Slots {
    links: Vec<Link>,
    near: Vec<List>,
    hanging: List,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        Self {
            links: vec![Link::default(); capacity],
            near: vec![List::default(); NEAR_SLOTS],
            hanging: List::default(),
        }
    }

    fn list_mut(&mut self, bucket: Bucket) -> &mut List {
        match bucket {
            Bucket::Near(slot) => &mut self.near[slot],
            Bucket::Hanging => &mut self.hanging,
        }
    }

    fn place(expire: u64, tick: u64) -> Bucket {
        let dist = expire.saturating_sub(tick);
        if dist >= NEAR_SLOTS as u64 {
            Bucket::Hanging
        } else if dist == 0 {
            Bucket::Near((tick % NEAR_SLOTS as u64) as usize)
        } else {
            Bucket::Near((expire % NEAR_SLOTS as u64) as usize)
        }
    }

    fn push_back(&mut self, key: PoolKey, expire: u64, bucket: Bucket) {
        let index = key.index() as u32;
        let tail = self.list_mut(bucket).tail;
        self.links[index as usize] = Link {
            prev: tail,
            next: NIL,
            expire,
            bucket: Some(bucket),
            key: Some(key),
        };
        if tail != NIL {
            self.links[tail as usize].next = index;
        }
        let list = self.list_mut(bucket);
        if list.head == NIL {
            list.head = index;
        }
        list.tail = index;
        list.len += 1;
    }

    fn link(&mut self, key: PoolKey, expire: u64, tick: u64) {
        self.push_back(key, expire, Self::place(expire, tick));
    }

    fn unlink(&mut self, key: PoolKey) {
        let index = key.index();
        let link = self.links[index];
        let Some(bucket) = link.bucket else {
            return;
        };
        if link.prev != NIL {
            self.links[link.prev as usize].next = link.next;
        }
        if link.next != NIL {
            self.links[link.next as usize].prev = link.prev;
        }
        let list = self.list_mut(bucket);
        if list.head == index as u32 {
            list.head = link.next;
        }
        if list.tail == index as u32 {
            list.tail = link.prev;
        }
        list.len -= 1;
        self.links[index] = Link::default();
    }

    /// 摘下整个链表，返回其中的节点
    fn take(&mut self, bucket: Bucket) -> Vec<(PoolKey, u64)> {
        let list = std::mem::take(self.list_mut(bucket));
        let mut taken = Vec::with_capacity(list.len);
        let mut cursor = list.head;
        while cursor != NIL {
            let link = std::mem::take(&mut self.links[cursor as usize]);
            if let Some(key) = link.key {
                taken.push((key, link.expire));
            }
            cursor = link.next;
        }
        taken
    }
}

enum Change {
    Skip,
    Link(u64),
    Relink(u64),
    Free,
}

/// 时间轮
pub struct TimeWheel {
    interval: Duration,
    pool: LockFreePool<TimerNode>,
    changes: ChangeList<TimerId>,
    slots: Mutex<Slots>,
    tick: AtomicU64,
    running: AtomicBool,
}

impl TimeWheel {
    /// 根据配置创建时间轮
    pub fn new(config: &TimerConfig) -> Result<Self> {
        if config.interval == 0 {
            return Err(NimbusError::validation("时间轮 tick 间隔必须大于 0"));
        }
        let pool = LockFreePool::new(config.poolsize)?;
        let capacity = pool.capacity();
        Ok(Self {
            interval: config.interval(),
            pool,
            changes: ChangeList::new(),
            slots: Mutex::new(Slots::new(capacity)),
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// tick 间隔
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 当前 tick 计数
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// 已分配的定时器数量（包括等待加入和等待删除的）
    pub fn active_timers(&self) -> usize {
        self.pool.len()
    }

    /// 把时长换算为 tick 数，至少为 1
    pub fn ticks_for(&self, timeout: Duration) -> u64 {
        let interval = self.interval.as_millis().max(1);
        ((timeout.as_millis() / interval) as u64).max(1)
    }

    /// 添加定时器
    ///
    /// `delay` 为 `false` 时第一次触发发生在下一次 tick，之后每隔 `timeout` 触发。
    pub fn add_timer<F>(
        &self,
        delay: bool,
        timeout: Duration,
        repeat: Repeat,
        handler: F,
    ) -> std::result::Result<TimerId, PoolError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.add_timer_ticks(delay, self.ticks_for(timeout), repeat, handler)
    }

    /// 以 tick 数添加定时器
    pub fn add_timer_ticks<F>(
        &self,
        delay: bool,
        ticks: u64,
        repeat: Repeat,
        handler: F,
    ) -> std::result::Result<TimerId, PoolError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let ticks = ticks.max(1);
        let now = self.current_tick();
        let key = self.pool.insert(TimerNode {
            state: TimerState::Add,
            expire: if delay { now + ticks } else { now },
            timeout: ticks,
            repeat,
            handler: Some(Box::new(handler)),
        })?;
        let id = TimerId(key);
        self.changes.push(id);
        trace!(timer = ?id, ticks, "添加定时器");
        Ok(id)
    }

    /// 删除定时器，下一次 tick 时真正释放
    pub fn del_timer(&self, id: TimerId) -> bool {
        let marked = self.pool.with(id.0, |node| match node.state {
            TimerState::Active | TimerState::Add | TimerState::Mod => {
                node.state = TimerState::Del;
                true
            }
            _ => false,
        });
        if marked == Some(true) {
            self.changes.push(id);
            trace!(timer = ?id, "删除定时器");
            true
        } else {
            false
        }
    }

    /// 修改定时器间隔，从下一次 tick 起重新计时
    pub fn modify_timer(&self, id: TimerId, timeout: Duration) -> bool {
        let ticks = self.ticks_for(timeout);
        let now = self.current_tick();
        let queued = self.pool.with(id.0, |node| match node.state {
            TimerState::Active | TimerState::Mod => {
                node.timeout = ticks;
                node.state = TimerState::Mod;
                Some(true)
            }
            TimerState::Add => {
                node.timeout = ticks;
                node.expire = now + ticks;
                Some(false)
            }
            _ => None,
        });
        match queued.flatten() {
            Some(true) => {
                self.changes.push(id);
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    fn free(&self, key: PoolKey) {
        // 回调在这里析构，不持有槽位锁
        drop(self.pool.remove(key));
    }

    fn apply_change(&self, slots: &mut Slots, now: u64, id: TimerId) {
        let change = self.pool.with(id.0, |node| match node.state {
            TimerState::Add => {
                node.state = TimerState::Active;
                Change::Link(node.expire)
            }
            TimerState::Mod => {
                node.expire = now + node.timeout;
                node.state = TimerState::Active;
                Change::Relink(node.expire)
            }
            TimerState::Del => Change::Free,
            _ => Change::Skip,
        });
        match change {
            None | Some(Change::Skip) => {}
            Some(Change::Link(expire)) => slots.link(id.0, expire, now),
            Some(Change::Relink(expire)) => {
                slots.unlink(id.0);
                slots.link(id.0, expire, now);
            }
            Some(Change::Free) => {
                slots.unlink(id.0);
                self.free(id.0);
            }
        }
    }

    fn fire(&self, slots: &mut Slots, now: u64, key: PoolKey) {
        let taken = self.pool.with(key, |node| match node.state {
            TimerState::Active => (Change::Skip, node.handler.take()),
            TimerState::Mod => {
                node.expire = now + node.timeout;
                node.state = TimerState::Active;
                (Change::Relink(node.expire), None)
            }
            _ => (Change::Free, None),
        });
        let handler = match taken {
            None => return,
            Some((Change::Relink(expire), _)) => {
                slots.link(key, expire, now);
                return;
            }
            Some((Change::Skip, Some(handler))) => handler,
            Some(_) => {
                self.free(key);
                return;
            }
        };

        let mut handler = handler;
        let keep = handler();

        let next = self.pool.with(key, move |node| {
            node.handler = Some(handler);
            match node.state {
                TimerState::Del => Change::Free,
                TimerState::Mod => {
                    node.expire = now + node.timeout;
                    node.state = TimerState::Active;
                    Change::Link(node.expire)
                }
                _ if keep && node.repeat.next() => {
                    node.expire += node.timeout;
                    Change::Link(node.expire)
                }
                _ => Change::Free,
            }
        });
        match next {
            Some(Change::Link(expire)) => slots.link(key, expire, now),
            Some(Change::Free) => self.free(key),
            _ => {}
        }
    }

    fn regroup(&self, slots: &mut Slots, now: u64) {
        let mut moved = 0usize;
        for (key, expire) in slots.take(Bucket::Hanging) {
            if expire.saturating_sub(now) < NEAR_SLOTS as u64 {
                moved += 1;
            }
            slots.link(key, expire, now);
        }
        if moved > 0 {
            debug!(tick = now, moved, "hanging 定时器重新分组");
        }
    }

    /// 推进一个 tick
    pub fn tick(&self) {
        let mut slots = self.slots.lock();
        let now = self.current_tick();

        self.changes
            .drain(|id| self.apply_change(&mut slots, now, id));

        let slot = (now % NEAR_SLOTS as u64) as usize;
        for (key, _) in slots.take(Bucket::Near(slot)) {
            self.fire(&mut slots, now, key);
        }

        let next = now + 1;
        self.tick.store(next, Ordering::Release);
        if next % NEAR_SLOTS as u64 == 0 {
            self.regroup(&mut slots, next);
        }
    }

    /// 在独立线程上按间隔驱动时间轮
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let wheel = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("nimbus-timer".to_string())
            .spawn(move || {
                info!(interval_ms = wheel.interval.as_millis() as u64, "时间轮线程启动");
                let start = Instant::now();
                let mut ticks: u32 = 0;
                while wheel.running.load(Ordering::Acquire) {
                    wheel.tick();
                    ticks = ticks.wrapping_add(1);
                    // 按起始时间补偿漂移
                    let target = start + wheel.interval * ticks;
                    let now = Instant::now();
                    if target > now {
                        thread::sleep(target - now);
                    }
                }
                info!("时间轮线程退出");
            })?;
        Ok(handle)
    }

    /// 是否正在由独立线程驱动
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止独立线程
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl fmt::Debug for TimeWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeWheel")
            .field("interval", &self.interval)
            .field("tick", &self.current_tick())
            .field("timers", &self.active_timers())
            .finish()
    }
}
