//! Per query profile event counters, sent to the client as blocks of deltas.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::block::{Block, Column, ColumnData};
use crate::logs::current_thread_id;

/// Well known event names.
pub mod events {
    pub const QUERY: &str = "Query";
    pub const SELECT_QUERY: &str = "SelectQuery";
    pub const INSERT_QUERY: &str = "InsertQuery";
    pub const SELECTED_ROWS: &str = "SelectedRows";
    pub const SELECTED_BYTES: &str = "SelectedBytes";
    pub const INSERTED_ROWS: &str = "InsertedRows";
    pub const INSERTED_BYTES: &str = "InsertedBytes";
    pub const ASYNC_INSERT_QUERY: &str = "AsyncInsertQuery";
    pub const PARALLEL_REPLICAS_READ_REQUESTS: &str = "ParallelReplicasReadRequestMicroseconds";
    pub const MEMORY_TRACKER_USAGE: &str = "MemoryTrackerUsage";
    pub const MEMORY_TRACKER_PEAK_USAGE: &str = "MemoryTrackerPeakUsage";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileEventKind {
    Increment = 1,
    Gauge = 2,
}

#[derive(Debug, Default)]
struct Counters {
    increments: BTreeMap<&'static str, i64>,
    gauges: BTreeMap<&'static str, i64>,
}

/// Counters of a single query.
#[derive(Debug, Default)]
pub struct ProfileEventCounters {
    inner: Mutex<Counters>,
}

impl ProfileEventCounters {
    pub fn increment(&self, name: &'static str, amount: i64) {
        *self.inner.lock().increments.entry(name).or_default() += amount;
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        let mut inner = self.inner.lock();
        inner.gauges.insert(name, value);
        if name == events::MEMORY_TRACKER_USAGE {
            let peak = inner
                .gauges
                .entry(events::MEMORY_TRACKER_PEAK_USAGE)
                .or_default();
            *peak = (*peak).max(value);
        }
    }

    pub fn get(&self, name: &str) -> i64 {
        let inner = self.inner.lock();
        inner
            .increments
            .get(name)
            .or_else(|| inner.gauges.get(name))
            .copied()
            .unwrap_or_default()
    }
}

/// Remembers what was already sent so each block only carries changes.
#[derive(Debug, Default)]
pub struct ProfileEventsSender {
    sent: BTreeMap<&'static str, i64>,
}

impl ProfileEventsSender {
    /// Build a block of everything that changed since the last call, or
    /// `None` if nothing did.
    pub fn delta_block(
        &mut self,
        counters: &ProfileEventCounters,
        host_name: &str,
        now: u32,
    ) -> Option<Block> {
        let mut rows: Vec<(ProfileEventKind, &'static str, i64)> = Vec::new();
        {
            let inner = counters.inner.lock();
            for (&name, &value) in &inner.increments {
                let sent = self.sent.entry(name).or_default();
                if value != *sent {
                    rows.push((ProfileEventKind::Increment, name, value - *sent));
                    *sent = value;
                }
            }
            // Gauges are always sent as their current value.
            for (&name, &value) in &inner.gauges {
                rows.push((ProfileEventKind::Gauge, name, value));
            }
        }

        if rows.is_empty() {
            return None;
        }

        let thread_id = current_thread_id();
        Some(Block::new(vec![
            Column::new("host_name", vec![host_name.to_string(); rows.len()]),
            Column::new("current_time", ColumnData::DateTime(vec![now; rows.len()])),
            Column::new("thread_id", vec![thread_id; rows.len()]),
            Column::new(
                "type",
                rows.iter().map(|(kind, _, _)| *kind as i8).collect::<Vec<_>>(),
            ),
            Column::new(
                "name",
                rows.iter()
                    .map(|(_, name, _)| name.to_string())
                    .collect::<Vec<_>>(),
            ),
            Column::new(
                "value",
                rows.iter().map(|(_, _, value)| *value).collect::<Vec<_>>(),
            ),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_deltas_are_sent() {
        let counters = ProfileEventCounters::default();
        let mut sender = ProfileEventsSender::default();
        assert!(sender.delta_block(&counters, "h", 0).is_none());

        counters.increment(events::SELECTED_ROWS, 10);
        counters.increment(events::SELECTED_ROWS, 5);
        let block = sender.delta_block(&counters, "h", 0).unwrap();
        assert_eq!(1, block.num_rows());
        assert_eq!(
            &ColumnData::Int64(vec![15]),
            &block.column("value").unwrap().data
        );

        counters.increment(events::SELECTED_ROWS, 1);
        let block = sender.delta_block(&counters, "h", 0).unwrap();
        assert_eq!(
            &ColumnData::Int64(vec![1]),
            &block.column("value").unwrap().data
        );
        assert!(sender.delta_block(&counters, "h", 0).is_none());
    }

    #[test]
    fn gauges_track_peak() {
        let counters = ProfileEventCounters::default();
        counters.set_gauge(events::MEMORY_TRACKER_USAGE, 100);
        counters.set_gauge(events::MEMORY_TRACKER_USAGE, 40);
        assert_eq!(40, counters.get(events::MEMORY_TRACKER_USAGE));
        assert_eq!(100, counters.get(events::MEMORY_TRACKER_PEAK_USAGE));

        let mut sender = ProfileEventsSender::default();
        let block = sender.delta_block(&counters, "h", 0).unwrap();
        assert_eq!(
            &ColumnData::Int8(vec![2, 2]),
            &block.column("type").unwrap().data
        );
    }
}
