//! Pipelines producing result blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use nativesrv::block::{Block, Column, DataType};
use nativesrv::cancel::CancellationStatus;
use nativesrv::engine::{PullingPipeline, QueryContext};
use nativesrv::errors::ExecError;
use nativesrv::messages::ProfileInfo;
use nativesrv::parallel_read::types::{
    CoordinationMode, InitialAllRangesAnnouncement, MarkRange, ParallelReadRequest, PartInfo,
    RangesInDataPartsDescription,
};
use nativesrv::profile_events::events;
use tracing::{debug, trace};

use crate::storage::{MemTable, Part};

/// Split `block` into blocks of at most `max_rows` rows.
fn split_block(block: &Block, max_rows: usize) -> impl Iterator<Item = Block> + '_ {
    let rows = block.num_rows();
    let max_rows = max_rows.max(1);
    (0..rows)
        .step_by(max_rows)
        .map(move |start| block.slice(start, (start + max_rows).min(rows)))
}

fn is_read_cancelled(ctx: &QueryContext) -> bool {
    ctx.cancellation_status() <= CancellationStatus::ReadCancelled
}

/// Returns blocks computed up front.
#[derive(Debug)]
pub struct ValuesSource {
    header: Block,
    blocks: VecDeque<Block>,
}

impl ValuesSource {
    pub fn single(block: Block) -> Self {
        ValuesSource {
            header: block.to_header(),
            blocks: VecDeque::from([block]),
        }
    }
}

#[async_trait]
impl PullingPipeline for ValuesSource {
    fn header(&self) -> Block {
        self.header.clone()
    }

    async fn pull(&mut self) -> Result<Option<Block>, ExecError> {
        Ok(self.blocks.pop_front())
    }
}

/// `SELECT <int>`
pub fn literal(text: &str, value: i64) -> ValuesSource {
    let column = if value >= 0 {
        Column::new(text, vec![value as u64])
    } else {
        Column::new(text, vec![value])
    };
    ValuesSource::single(Block::new(vec![column]))
}

/// `SELECT count() FROM <table>`
pub fn count(table: &MemTable) -> ValuesSource {
    let rows = table.num_rows() as u64;
    ValuesSource::single(Block::new(vec![Column::new("count()", vec![rows])]))
}

#[derive(Debug)]
enum ScanMode {
    /// Read every part of the local table.
    Local,
    /// Read whatever ranges the initiator hands out.
    Parallel { announced: bool, finished: bool },
}

/// Full scan of a table.
#[derive(Debug)]
pub struct ScanSource {
    ctx: Arc<QueryContext>,
    table: Arc<MemTable>,
    parts: HashMap<PartInfo, Arc<Part>>,
    mode: ScanMode,
    queue: VecDeque<Block>,
}

impl ScanSource {
    pub fn new(ctx: Arc<QueryContext>, table: Arc<MemTable>) -> Self {
        let mut parts = HashMap::new();
        for part in table.parts() {
            if ctx.is_part_ignored(&part.uuid) {
                debug!(part = %part.info.name(), "skipping ignored part");
                continue;
            }
            ctx.add_part_uuid(part.uuid);
            parts.insert(part.info.clone(), part);
        }

        let max_rows = ctx.settings.max_block_size as usize;
        let mut queue = VecDeque::new();
        let mode = if ctx.has_read_tasks() {
            ScanMode::Parallel {
                announced: false,
                finished: false,
            }
        } else {
            let mut sorted: Vec<_> = parts.values().collect();
            sorted.sort_by(|a, b| a.info.cmp(&b.info));
            for part in sorted {
                ctx.progress()
                    .add_total(part.num_rows() as u64, part.block.byte_size() as u64);
                queue.extend(split_block(&part.block, max_rows));
            }
            ScanMode::Local
        };

        ScanSource {
            ctx,
            table,
            parts,
            mode,
            queue,
        }
    }

    fn replica_num(&self) -> u64 {
        self.ctx.client_info.number_of_current_replica
    }

    async fn announce(&self) -> Result<(), ExecError> {
        let granularity = self.table.settings().index_granularity;
        let mut description = RangesInDataPartsDescription::default();
        for part in self.parts.values() {
            let marks = part.num_marks(granularity);
            if marks > 0 {
                description.push(&part.info, MarkRange::new(0, marks));
            }
        }
        self.ctx
            .announce_ranges(InitialAllRangesAnnouncement {
                mode: CoordinationMode::Default,
                description,
                replica_num: self.replica_num(),
            })
            .await
    }

    /// Ask for more ranges. Returns false once there's nothing left.
    async fn request_more(&mut self) -> Result<bool, ExecError> {
        let granularity = self.table.settings().index_granularity;
        let max_rows = self.ctx.settings.max_block_size;
        let request = ParallelReadRequest {
            mode: CoordinationMode::Default,
            replica_num: self.replica_num(),
            min_number_of_marks: (max_rows / granularity).max(1),
            description: RangesInDataPartsDescription::default(),
        };
        let Some(response) = self.ctx.request_ranges(request).await? else {
            return Ok(false);
        };
        if response.finish {
            return Ok(false);
        }

        for ranges in response.description.parts {
            let part = self.parts.get(&ranges.part).ok_or_else(|| {
                ExecError::logical(format!(
                    "Assigned part {} which this replica doesn't have",
                    ranges.part.name()
                ))
            })?;
            for range in ranges.ranges {
                trace!(part = %ranges.part.name(), begin = range.begin, end = range.end, "reading assigned range");
                let block = part.rows_in(range, granularity);
                self.queue
                    .extend(split_block(&block, max_rows as usize).collect::<Vec<_>>());
            }
        }
        Ok(true)
    }

    fn account(&self, block: &Block) {
        let rows = block.num_rows() as u64;
        let bytes = block.byte_size() as u64;
        self.ctx.progress().add_read(rows, bytes);
        let counters = self.ctx.profile_events();
        counters.increment(events::SELECTED_ROWS, rows as i64);
        counters.increment(events::SELECTED_BYTES, bytes as i64);
    }
}

#[async_trait]
impl PullingPipeline for ScanSource {
    fn header(&self) -> Block {
        self.table.header().clone()
    }

    async fn pull(&mut self) -> Result<Option<Block>, ExecError> {
        loop {
            if is_read_cancelled(&self.ctx) {
                return Ok(None);
            }
            if let Some(block) = self.queue.pop_front() {
                self.account(&block);
                return Ok(Some(block));
            }

            match self.mode {
                ScanMode::Local => return Ok(None),
                ScanMode::Parallel { finished: true, .. } => return Ok(None),
                ScanMode::Parallel {
                    announced: false, ..
                } => {
                    self.announce().await?;
                    self.mode = ScanMode::Parallel {
                        announced: true,
                        finished: false,
                    };
                }
                ScanMode::Parallel { .. } => {
                    if !self.request_more().await? {
                        self.mode = ScanMode::Parallel {
                            announced: true,
                            finished: true,
                        };
                    }
                }
            }
        }
    }
}

/// `SELECT number FROM system.numbers [LIMIT n]`
#[derive(Debug)]
pub struct NumbersSource {
    ctx: Arc<QueryContext>,
    next: u64,
    limit: Option<u64>,
    info: ProfileInfo,
}

impl NumbersSource {
    pub fn new(ctx: Arc<QueryContext>, limit: Option<u64>) -> Self {
        if let Some(limit) = limit {
            ctx.progress().add_total(limit, limit * 8);
        }
        NumbersSource {
            ctx,
            next: 0,
            limit,
            info: ProfileInfo::default(),
        }
    }
}

#[async_trait]
impl PullingPipeline for NumbersSource {
    fn header(&self) -> Block {
        Block::header([("number", DataType::UInt64)])
    }

    async fn pull(&mut self) -> Result<Option<Block>, ExecError> {
        // Yield so an unbounded query doesn't starve the connection.
        tokio::task::yield_now().await;
        if is_read_cancelled(&self.ctx) {
            return Ok(None);
        }

        let end = match self.limit {
            Some(limit) => limit.min(self.next + self.ctx.settings.max_block_size),
            None => self.next + self.ctx.settings.max_block_size,
        };
        if end <= self.next {
            return Ok(None);
        }

        let block = Block::new(vec![Column::new(
            "number",
            (self.next..end).collect::<Vec<u64>>(),
        )]);
        self.next = end;

        let rows = block.num_rows() as u64;
        let bytes = block.byte_size() as u64;
        self.ctx.progress().add_read(rows, bytes);
        self.info.rows += rows;
        self.info.blocks += 1;
        self.info.bytes += bytes;
        Ok(Some(block))
    }

    fn extremes(&mut self) -> Option<Block> {
        if !self.ctx.settings.extremes || self.next == 0 {
            return None;
        }
        Some(Block::new(vec![Column::new(
            "number",
            vec![0u64, self.next - 1],
        )]))
    }

    fn profile_info(&self) -> Option<ProfileInfo> {
        Some(ProfileInfo {
            applied_limit: self.limit.is_some(),
            rows_before_limit: self.info.rows,
            calculated_rows_before_limit: self.limit.is_some(),
            ..self.info
        })
    }
}

/// `SELECT sum(number) FROM system.numbers [LIMIT n]`
///
/// Sums in batches of `max_block_size`. Cancelling the read stops summing and
/// returns what was summed so far.
#[derive(Debug)]
pub struct SumNumbersSource {
    ctx: Arc<QueryContext>,
    limit: Option<u64>,
    done: bool,
}

impl SumNumbersSource {
    pub fn new(ctx: Arc<QueryContext>, limit: Option<u64>) -> Self {
        SumNumbersSource {
            ctx,
            limit,
            done: false,
        }
    }
}

/// Sum of `[start, end)`, wrapping like a UInt64 column would.
fn sum_range(start: u64, end: u64) -> u64 {
    let (start, end) = (start as u128, end as u128);
    ((start + end - 1) * (end - start) / 2) as u64
}

#[async_trait]
impl PullingPipeline for SumNumbersSource {
    fn header(&self) -> Block {
        Block::header([("sum(number)", DataType::UInt64)])
    }

    async fn pull(&mut self) -> Result<Option<Block>, ExecError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let batch = self.ctx.settings.max_block_size.max(1);
        let mut next = 0u64;
        let mut sum = 0u64;
        loop {
            match self.ctx.cancellation_status() {
                CancellationStatus::FullyCancelled => return Ok(None),
                CancellationStatus::ReadCancelled => {
                    debug!(rows = next, "read cancelled, returning partial sum");
                    break;
                }
                CancellationStatus::NotCancelled => (),
            }

            let end = match self.limit {
                Some(limit) => limit.min(next + batch),
                None => next + batch,
            };
            if end <= next {
                break;
            }
            sum = sum.wrapping_add(sum_range(next, end));
            self.ctx.progress().add_read(end - next, (end - next) * 8);
            next = end;
            tokio::task::yield_now().await;
        }

        Ok(Some(Block::new(vec![Column::new("sum(number)", vec![sum])])))
    }
}

#[cfg(test)]
mod tests {
    use nativesrv::settings::Settings;

    use super::*;

    fn context(max_block_size: u64) -> Arc<QueryContext> {
        let mut settings = Settings::default();
        settings.max_block_size = max_block_size;
        Arc::new(QueryContext::new("q", "").with_settings(settings))
    }

    async fn collect(pipeline: &mut dyn PullingPipeline) -> Vec<Block> {
        let mut blocks = Vec::new();
        while let Some(block) = pipeline.pull().await.unwrap() {
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn literal_types() {
        let source = literal("1", 1);
        assert_eq!(Block::header([("1", DataType::UInt64)]), source.header());
        let source = literal("-1", -1);
        assert_eq!(Block::header([("-1", DataType::Int64)]), source.header());
    }

    #[test]
    fn split_sizes() {
        let block = Block::new(vec![Column::new("a", (0..10u64).collect::<Vec<_>>())]);
        let sizes: Vec<_> = split_block(&block, 4).map(|b| b.num_rows()).collect();
        assert_eq!(vec![4, 4, 2], sizes);
        assert_eq!(0, split_block(&block.to_header(), 4).count());
    }

    #[tokio::test]
    async fn numbers_with_limit() {
        let ctx = context(4);
        let mut source = NumbersSource::new(ctx.clone(), Some(10));
        let blocks = collect(&mut source).await;
        assert_eq!(vec![4, 4, 2], blocks.iter().map(|b| b.num_rows()).collect::<Vec<_>>());

        let info = source.profile_info().unwrap();
        assert_eq!(10, info.rows);
        assert_eq!(3, info.blocks);
        assert!(info.applied_limit);
        assert_eq!(10, ctx.progress().fetch_and_reset().read_rows);
        assert!(source.extremes().is_none());
    }

    #[tokio::test]
    async fn numbers_stop_when_read_cancelled() {
        let ctx = context(4);
        let mut source = NumbersSource::new(ctx.clone(), None);
        assert!(source.pull().await.unwrap().is_some());
        ctx.callbacks().lower_to(CancellationStatus::ReadCancelled);
        assert!(source.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sum_with_limit() {
        let mut source = SumNumbersSource::new(context(7), Some(100));
        let blocks = collect(&mut source).await;
        assert_eq!(1, blocks.len());
        assert_eq!(Some(4950), blocks[0].columns[0].data.get_u64(0));
    }

    #[tokio::test]
    async fn sum_returns_partial_result_on_read_cancel() {
        let ctx = context(1000);
        ctx.callbacks().lower_to(CancellationStatus::ReadCancelled);
        let mut source = SumNumbersSource::new(ctx, None);
        let block = source.pull().await.unwrap().unwrap();
        assert_eq!(Some(0), block.columns[0].data.get_u64(0));
        assert!(source.pull().await.unwrap().is_none());
    }

    #[test]
    fn range_sums() {
        assert_eq!(0, sum_range(0, 1));
        assert_eq!(45, sum_range(0, 10));
        assert_eq!(45 - 10, sum_range(5, 10));
    }
}
