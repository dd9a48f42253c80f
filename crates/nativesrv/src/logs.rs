//! Forwarding of server logs to the client that issued a query.
//!
//! Each query with `send_logs_level` set gets a [`LogsQueue`]. The query runs
//! inside a span created by [`query_span`], and [`ClientLogsLayer`] copies
//! every event emitted within that span into the queue. The handler drains
//! the queue into Log packets.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Span, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::block::{Block, Column, ColumnData};
use crate::settings::LogsLevel;

/// Name of the span every query runs in.
pub const QUERY_SPAN_NAME: &str = "query";
const LOGS_KEY_FIELD: &str = "logs_key";

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small numeric id of the current thread, stable for the thread's lifetime.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Priority sent for a tracing level.
pub fn priority(level: &Level) -> i8 {
    match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG => 7,
        Level::TRACE => 8,
    }
}

#[derive(Debug, Clone)]
struct LogRow {
    time: u32,
    micros: u32,
    thread_id: u64,
    priority: i8,
    source: String,
    text: String,
}

/// Log rows collected for one query.
#[derive(Debug)]
pub struct LogsQueue {
    query_id: String,
    host_name: String,
    max_level: Level,
    rows: Mutex<Vec<LogRow>>,
}

impl LogsQueue {
    /// Create a queue, or `None` if the level disables logs.
    pub fn new(query_id: &str, host_name: &str, level: LogsLevel) -> Option<Arc<Self>> {
        let max_level = level.max_tracing_level()?;
        Some(Arc::new(LogsQueue {
            query_id: query_id.to_string(),
            host_name: host_name.to_string(),
            max_level,
            rows: Mutex::new(Vec::new()),
        }))
    }

    fn accepts(&self, level: &Level) -> bool {
        *level <= self.max_level
    }

    fn push(&self, row: LogRow) {
        self.rows.lock().push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Take all queued rows as a block.
    pub fn drain_block(&self) -> Option<Block> {
        let rows = std::mem::take(&mut *self.rows.lock());
        if rows.is_empty() {
            return None;
        }

        let n = rows.len();
        Some(Block::new(vec![
            Column::new(
                "event_time",
                ColumnData::DateTime(rows.iter().map(|r| r.time).collect()),
            ),
            Column::new(
                "event_time_microseconds",
                rows.iter().map(|r| r.micros).collect::<Vec<_>>(),
            ),
            Column::new("host_name", vec![self.host_name.clone(); n]),
            Column::new("query_id", vec![self.query_id.clone(); n]),
            Column::new("thread_id", rows.iter().map(|r| r.thread_id).collect::<Vec<_>>()),
            Column::new("priority", rows.iter().map(|r| r.priority).collect::<Vec<_>>()),
            Column::new("source", rows.iter().map(|r| r.source.clone()).collect::<Vec<_>>()),
            Column::new("text", rows.into_iter().map(|r| r.text).collect::<Vec<_>>()),
        ]))
    }
}

static REGISTERED_QUEUES: LazyLock<RwLock<HashMap<u64, Arc<LogsQueue>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));
static NEXT_LOGS_KEY: AtomicU64 = AtomicU64::new(1);

/// Makes a queue visible to [`ClientLogsLayer`] until dropped.
#[derive(Debug)]
pub struct LogsRegistration {
    key: u64,
    queue: Arc<LogsQueue>,
}

impl LogsRegistration {
    pub fn register(queue: Arc<LogsQueue>) -> Self {
        let key = NEXT_LOGS_KEY.fetch_add(1, Ordering::Relaxed);
        REGISTERED_QUEUES.write().insert(key, queue.clone());
        LogsRegistration { key, queue }
    }

    pub fn queue(&self) -> &Arc<LogsQueue> {
        &self.queue
    }
}

impl Drop for LogsRegistration {
    fn drop(&mut self) {
        REGISTERED_QUEUES.write().remove(&self.key);
    }
}

/// Span a query runs in. Events inside it are forwarded to `logs` if given.
pub fn query_span(query_id: &str, logs: Option<&LogsRegistration>) -> Span {
    let key = logs.map(|l| l.key).unwrap_or(0);
    tracing::info_span!(QUERY_SPAN_NAME, %query_id, logs_key = key)
}

struct QueryLogs(Arc<LogsQueue>);

#[derive(Default)]
struct KeyVisitor {
    key: Option<u64>,
}

impl Visit for KeyVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == LOGS_KEY_FIELD {
            self.key = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

#[derive(Default)]
struct TextVisitor {
    message: String,
    fields: String,
}

impl Visit for TextVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Tracing layer that copies events into the logs queue of the query they
/// were emitted in.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientLogsLayer;

impl<S> Layer<S> for ClientLogsLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != QUERY_SPAN_NAME {
            return;
        }
        let mut visitor = KeyVisitor::default();
        attrs.record(&mut visitor);
        let Some(key) = visitor.key.filter(|k| *k != 0) else {
            return;
        };
        let Some(queue) = REGISTERED_QUEUES.read().get(&key).cloned() else {
            return;
        };
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(QueryLogs(queue));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        for span in scope {
            let extensions = span.extensions();
            let Some(QueryLogs(queue)) = extensions.get::<QueryLogs>() else {
                continue;
            };

            let meta = event.metadata();
            if !queue.accepts(meta.level()) {
                return;
            }

            let mut visitor = TextVisitor::default();
            event.record(&mut visitor);
            let mut text = visitor.message;
            text.push_str(&visitor.fields);

            let now = Utc::now();
            queue.push(LogRow {
                time: now.timestamp() as u32,
                micros: now.timestamp_subsec_micros(),
                thread_id: current_thread_id(),
                priority: priority(meta.level()),
                source: meta.target().to_string(),
                text,
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::{debug, info, trace, warn};
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn events_in_query_span_are_collected() {
        let subscriber = tracing_subscriber::registry().with(ClientLogsLayer);
        let _guard = tracing::subscriber::set_default(subscriber);

        let queue = LogsQueue::new("q1", "host", LogsLevel::Debug).unwrap();
        let registration = LogsRegistration::register(queue.clone());

        info!("outside any query");
        {
            let span = query_span("q1", Some(&registration));
            let _enter = span.enter();
            warn!(rows = 3, "hello");
            debug!("details");
            trace!("too verbose");
        }
        {
            let span = query_span("q2", None);
            let _enter = span.enter();
            info!("no logs for this one");
        }

        let block = queue.drain_block().unwrap();
        assert_eq!(2, block.num_rows());
        assert_eq!(
            &ColumnData::String(vec!["hello rows=3".to_string(), "details".to_string()]),
            &block.column("text").unwrap().data
        );
        assert_eq!(
            &ColumnData::Int8(vec![4, 7]),
            &block.column("priority").unwrap().data
        );
        assert_eq!(
            &ColumnData::String(vec!["q1".to_string(), "q1".to_string()]),
            &block.column("query_id").unwrap().data
        );
        assert!(queue.drain_block().is_none());
    }

    #[test]
    fn none_level_disables_logs() {
        assert!(LogsQueue::new("q", "h", LogsLevel::None).is_none());
    }

    #[test]
    fn thread_ids_are_stable() {
        let a = current_thread_id();
        assert_eq!(a, current_thread_id());
        let b = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(a, b);
    }
}
