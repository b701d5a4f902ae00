//! Idle keep-alive connections of one session.
//!
//! Bounded most-recently-used cache. A finished transfer parks its
//! connection here; the next transfer to the same scheme, host and port
//! checks it out again.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::target::PoolKey;

struct Idle<T> {
    key: PoolKey,
    since: Instant,
    conn: T,
}

pub(crate) struct IdlePool<T> {
    max_idle: usize,
    /// Oldest first.
    idle: VecDeque<Idle<T>>,
}

impl<T> IdlePool<T> {
    pub(crate) fn new(max_idle: usize) -> Self {
        IdlePool {
            max_idle,
            idle: VecDeque::with_capacity(max_idle),
        }
    }

    /// Take the most recently parked connection for `key`.
    pub(crate) fn checkout(&mut self, key: &PoolKey) -> Option<T> {
        let pos = self.idle.iter().rposition(|entry| &entry.key == key)?;
        self.idle.remove(pos).map(|entry| entry.conn)
    }

    /// Park a connection. Returns whatever no longer fits, oldest first;
    /// the caller closes those.
    pub(crate) fn park(&mut self, key: PoolKey, conn: T, now: Instant) -> Vec<T> {
        self.idle.push_back(Idle {
            key,
            since: now,
            conn,
        });
        let mut evicted = Vec::new();
        while self.idle.len() > self.max_idle {
            if let Some(entry) = self.idle.pop_front() {
                evicted.push(entry.conn);
            }
        }
        evicted
    }

    /// Remove connections idle for longer than `ttl`.
    pub(crate) fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(front) = self.idle.front() {
            if now.saturating_duration_since(front.since) < ttl {
                break;
            }
            if let Some(entry) = self.idle.pop_front() {
                expired.push(entry.conn);
            }
        }
        expired
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.idle.drain(..).map(|entry| entry.conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.idle.len()
    }
}
