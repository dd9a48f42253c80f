//! Batching of small inserts.
//!
//! Inserts with the same key are buffered together and written as one part,
//! either once the buffer grows past `async_insert_max_data_size` or once
//! `async_insert_busy_timeout` passed since the first insert was buffered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nativesrv::async_insert::{AsyncInsertKey, AsyncInsertQueue, InsertTicket, PushResult};
use nativesrv::block::Block;
use nativesrv::errors::ExecError;
use nativesrv::settings::Settings;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::statement::{self, Statement};
use crate::storage::{DEFAULT_DATABASE, MemStorage};

#[derive(Debug)]
struct PendingInsert {
    /// Distinguishes buffers for the same key across flushes.
    id: u64,
    key: AsyncInsertKey,
    blocks: Vec<Block>,
    bytes: u64,
    waiters: Vec<oneshot::Sender<Result<(), ExecError>>>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    pending: HashMap<u64, PendingInsert>,
}

#[derive(Debug)]
pub struct MemAsyncInsertQueue {
    storage: Arc<MemStorage>,
    state: Arc<Mutex<QueueState>>,
}

impl MemAsyncInsertQueue {
    pub fn new(storage: Arc<MemStorage>) -> Self {
        MemAsyncInsertQueue {
            storage,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Number of keys with buffered data.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn spawn_flush_timer(&self, signature: u64, id: u64, busy_timeout: Duration) {
        let state = self.state.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(busy_timeout).await;
            let pending = {
                let mut state = state.lock();
                match state.pending.get(&signature) {
                    Some(pending) if pending.id == id => state.pending.remove(&signature),
                    _ => None,
                }
            };
            if let Some(pending) = pending {
                flush(&storage, pending);
            }
        });
    }
}

/// Write buffered data and tell everyone waiting on it how it went.
fn flush(storage: &MemStorage, pending: PendingInsert) {
    let PendingInsert {
        key,
        blocks,
        bytes,
        waiters,
        ..
    } = pending;
    debug!(query = %key.query, blocks = blocks.len(), bytes, "flushing async insert");

    let res = write(storage, &key, blocks);
    if let Err(e) = &res {
        warn!(query = %key.query, %e, "async insert flush failed");
    }
    for waiter in waiters {
        // The client may not be waiting.
        let _ = waiter.send(res.clone());
    }
}

fn write(storage: &MemStorage, key: &AsyncInsertKey, blocks: Vec<Block>) -> Result<(), ExecError> {
    let table = match statement::parse(&key.query)? {
        Statement::Insert(table) => table,
        other => {
            return Err(ExecError::logical(format!(
                "Statement {other:?} can't be inserted asynchronously"
            )));
        }
    };
    let current = if key.database.is_empty() {
        DEFAULT_DATABASE
    } else {
        key.database.as_str()
    };
    storage
        .table(table.database_or(current), &table.table)?
        .commit(blocks)?;
    Ok(())
}

#[async_trait]
impl AsyncInsertQueue for MemAsyncInsertQueue {
    async fn push(
        &self,
        key: AsyncInsertKey,
        blocks: Vec<Block>,
        settings: &Settings,
    ) -> Result<PushResult, ExecError> {
        let bytes: u64 = blocks.iter().map(|b| b.byte_size() as u64).sum();
        if bytes >= settings.async_insert_max_data_size {
            debug!(bytes, "insert too large to batch");
            return Ok(PushResult::Inline(blocks));
        }

        let (tx, ticket) = InsertTicket::channel();
        let signature = key.signature();
        let (full, started) = {
            let mut state = self.state.lock();
            let next_id = state.next_id;
            let pending = state.pending.entry(signature).or_insert_with(|| PendingInsert {
                id: next_id,
                key,
                blocks: Vec::new(),
                bytes: 0,
                waiters: Vec::new(),
            });
            let started = pending.id == next_id && pending.waiters.is_empty();
            pending.blocks.extend(blocks);
            pending.bytes += bytes;
            pending.waiters.push(tx);
            let full = pending.bytes >= settings.async_insert_max_data_size;
            if started {
                state.next_id += 1;
            }
            let full = if full {
                state.pending.remove(&signature)
            } else {
                None
            };
            (full, started.then_some(next_id))
        };

        match full {
            Some(pending) => flush(&self.storage, pending),
            None => {
                if let Some(id) = started {
                    self.spawn_flush_timer(signature, id, settings.async_insert_busy_timeout);
                }
            }
        }
        Ok(PushResult::Deferred(ticket))
    }
}

#[cfg(test)]
mod tests {
    use nativesrv::block::{Column, DataType};

    use super::*;
    use crate::statement::TableSettings;

    fn setup() -> (Arc<MemStorage>, MemAsyncInsertQueue) {
        let storage = Arc::new(MemStorage::default());
        storage
            .create_table(
                DEFAULT_DATABASE,
                "t",
                &[("a".to_string(), DataType::UInt64)],
                TableSettings::default(),
            )
            .unwrap();
        let queue = MemAsyncInsertQueue::new(storage.clone());
        (storage, queue)
    }

    fn key() -> AsyncInsertKey {
        AsyncInsertKey::new("INSERT INTO t VALUES", "", "u", Vec::new())
    }

    fn rows(n: u64) -> Vec<Block> {
        vec![Block::new(vec![Column::new("a", (0..n).collect::<Vec<_>>())])]
    }

    #[tokio::test(start_paused = true)]
    async fn batches_until_busy_timeout() {
        let (storage, queue) = setup();
        let settings = Settings::default();

        let first = match queue.push(key(), rows(2), &settings).await.unwrap() {
            PushResult::Deferred(ticket) => ticket,
            other => panic!("unexpected {other:?}"),
        };
        let second = match queue.push(key(), rows(3), &settings).await.unwrap() {
            PushResult::Deferred(ticket) => ticket,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(1, queue.pending());

        first.wait(Duration::from_secs(5)).await.unwrap();
        second.wait(Duration::from_secs(5)).await.unwrap();

        let table = storage.table(DEFAULT_DATABASE, "t").unwrap();
        assert_eq!(1, table.parts().len());
        assert_eq!(5, table.num_rows());
        assert_eq!(0, queue.pending());
    }

    #[tokio::test]
    async fn flushes_when_full() {
        let (storage, queue) = setup();
        let mut settings = Settings::default();
        settings.async_insert_max_data_size = 100;

        let ticket = match queue.push(key(), rows(8), &settings).await.unwrap() {
            PushResult::Deferred(ticket) => ticket,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(1, queue.pending());
        queue.push(key(), rows(8), &settings).await.unwrap();
        assert_eq!(0, queue.pending());
        ticket.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(16, storage.table(DEFAULT_DATABASE, "t").unwrap().num_rows());
    }

    #[tokio::test]
    async fn large_inserts_go_inline() {
        let (_storage, queue) = setup();
        let mut settings = Settings::default();
        settings.async_insert_max_data_size = 16;
        let res = queue.push(key(), rows(100), &settings).await.unwrap();
        assert!(matches!(res, PushResult::Inline(blocks) if blocks.len() == 1));
        assert_eq!(0, queue.pending());
    }

    #[tokio::test]
    async fn flush_errors_reach_waiters() {
        let (_storage, queue) = setup();
        let mut settings = Settings::default();
        settings.async_insert_max_data_size = 10;
        let key = AsyncInsertKey::new("INSERT INTO missing VALUES", "", "u", Vec::new());
        let ticket = match queue.push(key.clone(), rows(1), &settings).await.unwrap() {
            PushResult::Deferred(ticket) => ticket,
            other => panic!("unexpected {other:?}"),
        };
        queue.push(key, rows(1), &settings).await.unwrap();
        let err = ticket.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(nativesrv::errors::codes::UNKNOWN_TABLE, err.code());
    }
}
