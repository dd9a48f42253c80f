use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Socket timeouts of a connection, read by both halves.
#[derive(Debug)]
pub struct ConnectionTimeouts {
    send_us: AtomicU64,
    receive_us: AtomicU64,
}

impl ConnectionTimeouts {
    pub fn new(send: Duration, receive: Duration) -> Self {
        ConnectionTimeouts {
            send_us: AtomicU64::new(send.as_micros() as u64),
            receive_us: AtomicU64::new(receive.as_micros() as u64),
        }
    }

    pub fn send(&self) -> Duration {
        Duration::from_micros(self.send_us.load(Ordering::Relaxed))
    }

    pub fn receive(&self) -> Duration {
        Duration::from_micros(self.receive_us.load(Ordering::Relaxed))
    }

    pub fn set(&self, send: Duration, receive: Duration) {
        self.send_us.store(send.as_micros() as u64, Ordering::Relaxed);
        self.receive_us.store(receive.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Overrides the connection's timeouts for the lifetime of a query, and puts
/// the previous ones back when dropped.
#[derive(Debug)]
pub struct TimeoutSetter {
    timeouts: Arc<ConnectionTimeouts>,
    prev_send: Duration,
    prev_receive: Duration,
}

impl TimeoutSetter {
    pub fn new(timeouts: Arc<ConnectionTimeouts>, send: Duration, receive: Duration) -> Self {
        let prev_send = timeouts.send();
        let prev_receive = timeouts.receive();
        timeouts.set(send, receive);
        TimeoutSetter {
            timeouts,
            prev_send,
            prev_receive,
        }
    }
}

impl Drop for TimeoutSetter {
    fn drop(&mut self) {
        self.timeouts.set(self.prev_send, self.prev_receive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setter_restores_on_drop() {
        let timeouts = Arc::new(ConnectionTimeouts::new(
            Duration::from_secs(300),
            Duration::from_secs(300),
        ));
        {
            let _setter = TimeoutSetter::new(
                timeouts.clone(),
                Duration::from_secs(5),
                Duration::from_millis(1500),
            );
            assert_eq!(Duration::from_secs(5), timeouts.send());
            assert_eq!(Duration::from_millis(1500), timeouts.receive());
        }
        assert_eq!(Duration::from_secs(300), timeouts.send());
        assert_eq!(Duration::from_secs(300), timeouts.receive());
    }
}
