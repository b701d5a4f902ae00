//! Per-session host resolution cache.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::HttpError;
use crate::metrics;
use crate::target::Target;

struct Entry {
    resolved_at: Instant,
    addrs: Vec<SocketAddr>,
}

/// Resolved addresses keyed by host and port, valid for a fixed TTL.
///
/// Names go through the system resolver on a miss. IP literals never touch
/// the cache.
pub(crate) struct DnsCache {
    ttl: Duration,
    entries: HashMap<(String, u16), Entry>,
}

impl DnsCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        DnsCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn resolve(
        &mut self,
        target: &Target,
        now: Instant,
    ) -> Result<Vec<SocketAddr>, HttpError> {
        if let Some(addr) = target.literal_addr() {
            return Ok(vec![addr]);
        }
        let key = (target.host().to_ascii_lowercase(), target.port);
        if let Some(entry) = self.entries.get(&key)
            && now.duration_since(entry.resolved_at) < self.ttl
        {
            metrics::DNS_HITS.increment();
            return Ok(entry.addrs.clone());
        }

        metrics::DNS_MISSES.increment();
        let addrs: Vec<SocketAddr> = (key.0.as_str(), key.1)
            .to_socket_addrs()
            .map_err(|_| HttpError::Resolve(key.0.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(HttpError::Resolve(key.0));
        }
        debug!(host = %key.0, count = addrs.len(), "resolved");
        self.entries.insert(
            key,
            Entry {
                resolved_at: now,
                addrs: addrs.clone(),
            },
        );
        Ok(addrs)
    }

    /// Drop expired entries.
    pub(crate) fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.resolved_at) < ttl);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
