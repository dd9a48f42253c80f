//! In memory tables made of immutable parts.

use std::collections::HashMap;
use std::sync::Arc;

use nativesrv::block::{Block, DataType};
use nativesrv::messages::TableStatus;
use nativesrv::parallel_read::types::{MarkRange, PartInfo};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{MemEngineError, Result};
use crate::statement::TableSettings;

pub const SYSTEM_DATABASE: &str = "system";
pub const DEFAULT_DATABASE: &str = "default";

/// Rows written by one insert.
#[derive(Debug)]
pub struct Part {
    pub info: PartInfo,
    pub uuid: Uuid,
    pub block: Block,
}

impl Part {
    pub fn num_rows(&self) -> usize {
        self.block.num_rows()
    }

    pub fn num_marks(&self, granularity: u64) -> u64 {
        (self.num_rows() as u64).div_ceil(granularity)
    }

    /// Rows covered by a range of marks.
    pub fn rows_in(&self, range: MarkRange, granularity: u64) -> Block {
        let rows = self.num_rows();
        let start = ((range.begin * granularity) as usize).min(rows);
        let end = ((range.end * granularity) as usize).min(rows);
        self.block.slice(start, end)
    }
}

#[derive(Debug, Default)]
struct TableParts {
    parts: Vec<Arc<Part>>,
    next_block_number: u64,
}

#[derive(Debug)]
pub struct MemTable {
    name: String,
    header: Block,
    settings: TableSettings,
    parts: Mutex<TableParts>,
}

impl MemTable {
    fn new(name: String, columns: &[(String, DataType)], settings: TableSettings) -> Self {
        MemTable {
            name,
            header: Block::header(columns.iter().map(|(name, typ)| (name.as_str(), *typ))),
            settings,
            parts: Mutex::new(TableParts {
                parts: Vec::new(),
                next_block_number: 1,
            }),
        }
    }

    /// Qualified name of the table.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &Block {
        &self.header
    }

    pub fn settings(&self) -> &TableSettings {
        &self.settings
    }

    pub fn parts(&self) -> Vec<Arc<Part>> {
        self.parts.lock().parts.clone()
    }

    pub fn num_rows(&self) -> usize {
        self.parts.lock().parts.iter().map(|p| p.num_rows()).sum()
    }

    /// Write `blocks` as a single new part. Writing nothing is a no-op.
    pub fn commit(&self, blocks: Vec<Block>) -> Result<()> {
        let block = concat_blocks(&self.header, blocks)?;
        if block.num_rows() == 0 {
            return Ok(());
        }

        let mut state = self.parts.lock();
        if let Some(limit) = self.settings.parts_to_throw_insert {
            if state.parts.len() >= limit {
                return Err(MemEngineError::TooManyParts {
                    parts: state.parts.len(),
                    limit,
                });
            }
        }
        let number = state.next_block_number;
        state.next_block_number += 1;
        let part = Part {
            info: PartInfo::new("all", number, number, 0),
            uuid: Uuid::new_v4(),
            block,
        };
        debug!(table = %self.name, part = %part.info.name(), rows = part.num_rows(), "committed part");
        state.parts.push(Arc::new(part));
        Ok(())
    }
}

/// Concatenate blocks that all match `header`.
pub fn concat_blocks(header: &Block, blocks: Vec<Block>) -> Result<Block> {
    let mut out = header.to_header();
    for block in blocks {
        block.check_matches_header(header)?;
        for (dst, src) in out.columns.iter_mut().zip(&block.columns) {
            dst.data.extend(&src.data)?;
        }
    }
    Ok(out)
}

/// Databases and their tables.
#[derive(Debug)]
pub struct MemStorage {
    databases: RwLock<HashMap<String, HashMap<String, Arc<MemTable>>>>,
}

impl Default for MemStorage {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), HashMap::new());
        databases.insert(SYSTEM_DATABASE.to_string(), HashMap::new());
        MemStorage {
            databases: RwLock::new(databases),
        }
    }
}

impl MemStorage {
    pub fn database_exists(&self, database: &str) -> bool {
        self.databases.read().contains_key(database)
    }

    pub fn create_database(&self, database: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if databases.contains_key(database) {
            return Err(MemEngineError::DatabaseExists(database.to_string()));
        }
        databases.insert(database.to_string(), HashMap::new());
        Ok(())
    }

    pub fn create_table(
        &self,
        database: &str,
        table: &str,
        columns: &[(String, DataType)],
        settings: TableSettings,
    ) -> Result<Arc<MemTable>> {
        let mut databases = self.databases.write();
        let tables = databases
            .get_mut(database)
            .ok_or_else(|| MemEngineError::UnknownDatabase(database.to_string()))?;
        if tables.contains_key(table) {
            return Err(MemEngineError::TableExists(format!("{database}.{table}")));
        }
        let mem_table = Arc::new(MemTable::new(
            format!("{database}.{table}"),
            columns,
            settings,
        ));
        tables.insert(table.to_string(), mem_table.clone());
        Ok(mem_table)
    }

    pub fn table(&self, database: &str, table: &str) -> Result<Arc<MemTable>> {
        let databases = self.databases.read();
        let tables = databases
            .get(database)
            .ok_or_else(|| MemEngineError::UnknownDatabase(database.to_string()))?;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| MemEngineError::UnknownTable(format!("{database}.{table}")))
    }

    pub fn table_status(&self, database: &str, table: &str) -> Option<TableStatus> {
        self.table(database, table).ok().map(|_| TableStatus {
            is_replicated: false,
            absolute_delay: 0,
            is_readonly: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use nativesrv::block::Column;

    use super::*;

    fn columns() -> Vec<(String, DataType)> {
        vec![("a".to_string(), DataType::UInt64)]
    }

    fn rows(values: Vec<u64>) -> Block {
        Block::new(vec![Column::new("a", values)])
    }

    #[test]
    fn commit_creates_parts_until_limit() {
        let storage = MemStorage::default();
        let settings = TableSettings {
            parts_to_throw_insert: Some(2),
            ..Default::default()
        };
        let table = storage
            .create_table(DEFAULT_DATABASE, "t", &columns(), settings)
            .unwrap();

        table.commit(vec![rows(vec![1, 2]), rows(vec![3])]).unwrap();
        table.commit(Vec::new()).unwrap();
        table.commit(vec![rows(vec![4])]).unwrap();
        assert_eq!(2, table.parts().len());
        assert_eq!(4, table.num_rows());

        let err = table.commit(vec![rows(vec![5])]).unwrap_err();
        assert!(matches!(err, MemEngineError::TooManyParts { parts: 2, limit: 2 }));
        assert_eq!(4, table.num_rows());
    }

    #[test]
    fn commit_rejects_mismatched_blocks() {
        let storage = MemStorage::default();
        let table = storage
            .create_table(DEFAULT_DATABASE, "t", &columns(), TableSettings::default())
            .unwrap();
        let wrong = Block::new(vec![Column::new("b", vec![1u64])]);
        table.commit(vec![wrong]).unwrap_err();
        assert!(table.parts().is_empty());
    }

    #[test]
    fn marks_cover_rows() {
        let storage = MemStorage::default();
        let table = storage
            .create_table(DEFAULT_DATABASE, "t", &columns(), TableSettings::default())
            .unwrap();
        table.commit(vec![rows((0..10).collect())]).unwrap();
        let part = &table.parts()[0];
        assert_eq!(3, part.num_marks(4));
        assert_eq!(
            rows(vec![4, 5, 6, 7, 8, 9]),
            part.rows_in(MarkRange::new(1, 3), 4)
        );
    }

    #[test]
    fn lookup_errors() {
        let storage = MemStorage::default();
        assert!(matches!(
            storage.table("nope", "t").unwrap_err(),
            MemEngineError::UnknownDatabase(_)
        ));
        assert!(matches!(
            storage.table(DEFAULT_DATABASE, "t").unwrap_err(),
            MemEngineError::UnknownTable(_)
        ));
        storage.create_database("analytics").unwrap();
        storage.create_database("analytics").unwrap_err();
        assert!(storage.database_exists("analytics"));
        assert!(storage.table_status("analytics", "t").is_none());
    }
}
