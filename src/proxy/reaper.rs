//! 握手超时回收
//!
//! 超时时长固定，截止时间按接入顺序单调递增，所以用 FIFO 队列即可；
//! 已桥接或已拆除的连接留在队列中，到达队首时惰性丢弃。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::registry::ConnId;

/// 未桥接连接的截止时间队列
#[derive(Debug)]
pub struct HandshakeReaper {
    timeout: Duration,
    queue: VecDeque<(Instant, ConnId)>,
}

impl HandshakeReaper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            queue: VecDeque::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 记录新接入的连接；截止时间超出 `Instant` 表示范围时视为永不过期
    pub fn track(&mut self, id: ConnId, accepted_at: Instant) {
        if let Some(deadline) = accepted_at.checked_add(self.timeout) {
            self.queue.push_back((deadline, id));
        }
    }

    /// 距最早截止时间的等待时长
    ///
    /// `pending` 判断连接是否仍需回收，不再需要的队首条目被丢弃
    pub fn next_timeout(
        &mut self,
        now: Instant,
        pending: impl Fn(ConnId) -> bool,
    ) -> Option<Duration> {
        while let Some(&(deadline, id)) = self.queue.front() {
            if pending(id) {
                return Some(deadline.saturating_duration_since(now));
            }
            self.queue.pop_front();
        }
        None
    }

    /// 取出一个已到期的连接
    pub fn pop_expired(&mut self, now: Instant) -> Option<ConnId> {
        match self.queue.front() {
            Some(&(deadline, _)) if deadline <= now => self.queue.pop_front().map(|(_, id)| id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
