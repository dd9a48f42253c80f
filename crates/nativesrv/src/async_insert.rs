//! Hookup to a queue that batches small inserts.
//!
//! With `async_insert` set the handler reads all of an insert's data, then
//! hands it to the engine's [`AsyncInsertQueue`]. The queue either flushes
//! it with other inserts of the same shape later, or asks the handler to
//! apply it right away.

use std::fmt;
use std::hash::Hasher;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use twox_hash::XxHash64;

use crate::block::Block;
use crate::errors::{ExecError, NativeSrvError, Result};
use crate::messages::SettingChange;
use crate::settings::Settings;

/// Inserts with equal keys may be batched together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsyncInsertKey {
    /// Query with whitespace collapsed.
    pub query: String,
    pub database: String,
    pub user: String,
    pub settings: Vec<SettingChange>,
    signature: u64,
}

impl AsyncInsertKey {
    pub fn new(query: &str, database: &str, user: &str, mut settings: Vec<SettingChange>) -> Self {
        let query = normalize_query(query);
        settings.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = XxHash64::with_seed(0);
        for part in [query.as_str(), database, user] {
            hasher.write(part.as_bytes());
            hasher.write_u8(0);
        }
        for change in &settings {
            hasher.write(change.name.as_bytes());
            hasher.write_u8(b'=');
            hasher.write(change.value.as_bytes());
            hasher.write_u8(0);
        }

        AsyncInsertKey {
            query,
            database: database.to_string(),
            user: user.to_string(),
            settings,
            signature: hasher.finish(),
        }
    }

    /// Signature of the insert, stable for equal keys.
    pub fn signature(&self) -> u64 {
        self.signature
    }
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub enum PushResult {
    /// Apply the data through the regular pipeline.
    Inline(Vec<Block>),
    /// The data was queued.
    Deferred(InsertTicket),
}

impl fmt::Debug for PushResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(blocks) => f.debug_tuple("Inline").field(&blocks.len()).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Resolves once queued data was flushed.
#[derive(Debug)]
pub struct InsertTicket {
    rx: oneshot::Receiver<Result<(), ExecError>>,
}

impl InsertTicket {
    /// Create a ticket and the sender the queue resolves it with.
    pub fn channel() -> (oneshot::Sender<Result<(), ExecError>>, InsertTicket) {
        let (tx, rx) = oneshot::channel();
        (tx, InsertTicket { rx })
    }

    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(res)) => Ok(res?),
            Ok(Err(_)) => Err(ExecError::logical("async insert was dropped before flushing").into()),
            Err(_) => Err(NativeSrvError::AsyncInsertTimeout(timeout)),
        }
    }
}

#[async_trait]
pub trait AsyncInsertQueue: Sync + Send + fmt::Debug {
    /// Queue data for the insert identified by `key`.
    async fn push(
        &self,
        key: AsyncInsertKey,
        blocks: Vec<Block>,
        settings: &Settings,
    ) -> Result<PushResult, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_whitespace_and_setting_order() {
        let a = AsyncInsertKey::new(
            "INSERT  INTO t\n VALUES",
            "default",
            "u",
            vec![SettingChange::new("b", "1"), SettingChange::new("a", "2")],
        );
        let b = AsyncInsertKey::new(
            "INSERT INTO t VALUES",
            "default",
            "u",
            vec![SettingChange::new("a", "2"), SettingChange::new("b", "1")],
        );
        assert_eq!(a, b);
        assert_eq!(a.signature(), b.signature());

        let c = AsyncInsertKey::new("INSERT INTO t VALUES", "default", "other", Vec::new());
        assert_ne!(a.signature(), c.signature());
    }

    #[tokio::test]
    async fn ticket_resolution() {
        let (tx, ticket) = InsertTicket::channel();
        tx.send(Ok(())).unwrap();
        ticket.wait(Duration::from_secs(1)).await.unwrap();

        let (tx, ticket) = InsertTicket::channel();
        tx.send(Err(ExecError::too_many_parts(2, 2))).unwrap();
        let err = ticket.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(crate::errors::codes::TOO_MANY_PARTS, err.code());

        let (tx, ticket) = InsertTicket::channel();
        drop(tx);
        ticket.wait(Duration::from_secs(1)).await.unwrap_err();
    }

    #[tokio::test(start_paused = true)]
    async fn ticket_times_out() {
        let (_tx, ticket) = InsertTicket::channel();
        let err = ticket.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, NativeSrvError::AsyncInsertTimeout(_)));
    }
}
