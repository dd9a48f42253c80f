use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by all connections of a server.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    open_connections: AtomicU64,
    total_connections: AtomicU64,
    queries: AtomicU64,
    exceptions: AtomicU64,
}

impl ConnectionMetrics {
    /// Count a new connection until the returned guard is dropped.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            metrics: self.clone(),
        }
    }

    pub fn query_started(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exception_sent(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn exceptions(&self) -> u64 {
        self.exceptions.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    metrics: Arc<ConnectionMetrics>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.open_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_open_connections() {
        let metrics = Arc::new(ConnectionMetrics::default());
        let a = metrics.connection_opened();
        let b = metrics.connection_opened();
        assert_eq!(2, metrics.open_connections());
        drop(a);
        assert_eq!(1, metrics.open_connections());
        drop(b);
        assert_eq!(0, metrics.open_connections());
        assert_eq!(2, metrics.total_connections());
    }
}
