use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Server-wide counters reported by `stats` and the status endpoint.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    started_at_secs: u64,
    current_connections: AtomicU64,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    lock_granted: AtomicU64,
    lock_denied: AtomicU64,
    lock_blocked: AtomicU64,
    unlock_commands: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Unix seconds at server start.
    pub started_at: u64,
    pub uptime_ms: u64,
    pub current_connections: u64,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub lock_granted: u64,
    pub lock_denied: u64,
    pub lock_blocked: u64,
    pub unlock_commands: u64,
    pub protocol_errors: u64,
}

/// Decrements the open-connection gauge when dropped.
pub struct ConnectionGuard {
    inner: Arc<MetricsInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner
            .current_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                started_at_secs: now_secs(),
                current_connections: AtomicU64::new(0),
                total_connections: AtomicU64::new(0),
                rejected_connections: AtomicU64::new(0),
                lock_granted: AtomicU64::new(0),
                lock_denied: AtomicU64::new(0),
                lock_blocked: AtomicU64::new(0),
                unlock_commands: AtomicU64::new(0),
                protocol_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_opened(&self) -> ConnectionGuard {
        self.inner
            .current_connections
            .fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn connection_rejected(&self) {
        self.inner
            .rejected_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_granted(&self) {
        self.inner.lock_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_denied(&self) {
        self.inner.lock_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_blocked(&self) {
        self.inner.lock_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unlock(&self) {
        self.inner.unlock_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.inner.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            started_at: self.inner.started_at_secs,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            current_connections: load(&self.inner.current_connections),
            total_connections: load(&self.inner.total_connections),
            rejected_connections: load(&self.inner.rejected_connections),
            lock_granted: load(&self.inner.lock_granted),
            lock_denied: load(&self.inner.lock_denied),
            lock_blocked: load(&self.inner.lock_blocked),
            unlock_commands: load(&self.inner.unlock_commands),
            protocol_errors: load(&self.inner.protocol_errors),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
