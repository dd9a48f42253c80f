//! Pipelines writing client data into tables.

use std::sync::Arc;

use async_trait::async_trait;
use nativesrv::block::Block;
use nativesrv::engine::{InputReader, PullingPipeline, PushingPipeline, QueryContext};
use nativesrv::errors::ExecError;
use tracing::debug;

use crate::storage::MemTable;

/// `INSERT INTO <table>` with data sent by the client. Everything pushed
/// becomes one part when the insert finishes.
#[derive(Debug)]
pub struct TableWriter {
    table: Arc<MemTable>,
    blocks: Vec<Block>,
}

impl TableWriter {
    pub fn new(table: Arc<MemTable>) -> Self {
        TableWriter {
            table,
            blocks: Vec::new(),
        }
    }
}

#[async_trait]
impl PushingPipeline for TableWriter {
    fn header(&self) -> Block {
        self.table.header().clone()
    }

    fn table_name(&self) -> String {
        self.table.name().to_string()
    }

    fn columns_description(&self) -> Option<String> {
        Some(self.table.header().columns_description())
    }

    async fn push(&mut self, block: Block) -> Result<(), ExecError> {
        block.check_matches_header(self.table.header())?;
        self.blocks.push(block);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ExecError> {
        let blocks = std::mem::take(&mut self.blocks);
        debug!(table = %self.table.name(), blocks = blocks.len(), "finishing insert");
        self.table.commit(blocks)?;
        Ok(())
    }
}

/// `INSERT INTO <table> SELECT * FROM input()`
///
/// Produces no rows. Reads the client's data through the query context and
/// writes it once the client is done, unless the query was cancelled.
#[derive(Debug)]
pub struct InputInsertSource {
    ctx: Arc<QueryContext>,
    table: Arc<MemTable>,
    input: InputReader,
    blocks: Vec<Block>,
    done: bool,
}

impl InputInsertSource {
    pub fn new(ctx: Arc<QueryContext>, table: Arc<MemTable>) -> Result<Self, ExecError> {
        let input = ctx.take_input(table.header().clone())?;
        Ok(InputInsertSource {
            ctx,
            table,
            input,
            blocks: Vec::new(),
            done: false,
        })
    }
}

#[async_trait]
impl PullingPipeline for InputInsertSource {
    fn header(&self) -> Block {
        Block::default()
    }

    async fn pull(&mut self) -> Result<Option<Block>, ExecError> {
        if self.done {
            return Ok(None);
        }
        while let Some(block) = self.input.next().await {
            block.check_matches_header(self.table.header())?;
            self.blocks.push(block);
        }
        self.done = true;

        if self.ctx.is_fully_cancelled() {
            debug!(table = %self.table.name(), "input() insert cancelled, discarding data");
            return Ok(None);
        }
        self.table.commit(std::mem::take(&mut self.blocks))?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use nativesrv::block::{Column, DataType};

    use super::*;
    use crate::statement::TableSettings;
    use crate::storage::{DEFAULT_DATABASE, MemStorage};

    fn table(storage: &MemStorage) -> Arc<MemTable> {
        storage
            .create_table(
                DEFAULT_DATABASE,
                "t",
                &[("a".to_string(), DataType::UInt64)],
                TableSettings::default(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn writer_commits_on_finish() {
        let storage = MemStorage::default();
        let table = table(&storage);
        let mut writer = TableWriter::new(table.clone());
        assert_eq!("default.t", writer.table_name());

        writer
            .push(Block::new(vec![Column::new("a", vec![1u64, 2])]))
            .await
            .unwrap();
        writer
            .push(Block::new(vec![Column::new("b", vec![1u64])]))
            .await
            .unwrap_err();
        assert_eq!(0, table.num_rows());

        writer.finish().await.unwrap();
        assert_eq!(2, table.num_rows());
        assert_eq!(1, table.parts().len());
    }
}
