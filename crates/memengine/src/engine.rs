use std::sync::Arc;

use async_trait::async_trait;
use nativesrv::async_insert::AsyncInsertQueue;
use nativesrv::engine::{QueryContext, QueryEngine, QueryPipeline};
use nativesrv::errors::ExecError;
use nativesrv::messages::{QualifiedTableName, TableStatus};
use tracing::{debug, info};

use crate::async_insert::MemAsyncInsertQueue;
use crate::sink::{InputInsertSource, TableWriter};
use crate::source::{self, NumbersSource, ScanSource, SumNumbersSource};
use crate::statement::{self, Statement};
use crate::storage::{DEFAULT_DATABASE, MemStorage};

/// Query engine keeping every table in memory.
#[derive(Debug, Clone, Default)]
pub struct MemEngine {
    storage: Arc<MemStorage>,
    async_inserts: Option<Arc<MemAsyncInsertQueue>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch inserts sent with `async_insert` enabled.
    pub fn with_async_inserts(mut self) -> Self {
        self.async_inserts = Some(Arc::new(MemAsyncInsertQueue::new(self.storage.clone())));
        self
    }

    pub fn storage(&self) -> &Arc<MemStorage> {
        &self.storage
    }
}

fn current_database(ctx: &QueryContext) -> &str {
    if ctx.database.is_empty() {
        DEFAULT_DATABASE
    } else {
        &ctx.database
    }
}

#[async_trait]
impl QueryEngine for MemEngine {
    async fn execute(&self, ctx: Arc<QueryContext>) -> Result<QueryPipeline, ExecError> {
        let stmt = statement::parse(&ctx.query)?;
        debug!(query_id = %ctx.query_id, ?stmt, "executing statement");
        let current = current_database(&ctx);

        let pipeline = match stmt {
            Statement::SelectLiteral { text, value } => {
                QueryPipeline::Pulling(Box::new(source::literal(&text, value)))
            }
            Statement::SelectAll(table) => {
                let table = self
                    .storage
                    .table(table.database_or(current), &table.table)?;
                QueryPipeline::Pulling(Box::new(ScanSource::new(ctx.clone(), table)))
            }
            Statement::SelectCount(table) => {
                let table = self
                    .storage
                    .table(table.database_or(current), &table.table)?;
                QueryPipeline::Pulling(Box::new(source::count(&table)))
            }
            Statement::SelectNumbers { limit } => {
                QueryPipeline::Pulling(Box::new(NumbersSource::new(ctx.clone(), limit)))
            }
            Statement::SumNumbers { limit } => {
                QueryPipeline::Pulling(Box::new(SumNumbersSource::new(ctx.clone(), limit)))
            }
            Statement::CreateDatabase(name) => {
                self.storage.create_database(&name)?;
                info!(database = %name, "created database");
                QueryPipeline::Completed
            }
            Statement::CreateTable {
                table,
                columns,
                settings,
            } => {
                let database = table.database_or(current);
                self.storage
                    .create_table(database, &table.table, &columns, settings)?;
                info!(%table, "created table");
                QueryPipeline::Completed
            }
            Statement::Insert(table) => {
                let table = self
                    .storage
                    .table(table.database_or(current), &table.table)?;
                QueryPipeline::Pushing(Box::new(TableWriter::new(table)))
            }
            Statement::InsertFromInput(table) => {
                let table = self
                    .storage
                    .table(table.database_or(current), &table.table)?;
                QueryPipeline::Pulling(Box::new(InputInsertSource::new(ctx.clone(), table)?))
            }
        };
        Ok(pipeline)
    }

    async fn database_exists(&self, database: &str) -> bool {
        self.storage.database_exists(database)
    }

    async fn table_status(
        &self,
        table: &QualifiedTableName,
    ) -> Result<Option<TableStatus>, ExecError> {
        Ok(self.storage.table_status(&table.database, &table.table))
    }

    fn async_insert_queue(&self) -> Option<Arc<dyn AsyncInsertQueue>> {
        self.async_inserts
            .clone()
            .map(|queue| queue as Arc<dyn AsyncInsertQueue>)
    }
}

#[cfg(test)]
mod tests {
    use nativesrv::block::DataType;

    use super::*;

    async fn run(engine: &MemEngine, query: &str) -> Result<QueryPipeline, ExecError> {
        engine
            .execute(Arc::new(QueryContext::new("q", query)))
            .await
    }

    #[tokio::test]
    async fn ddl_then_insert() {
        let engine = MemEngine::new();
        assert!(matches!(
            run(&engine, "CREATE DATABASE analytics").await.unwrap(),
            QueryPipeline::Completed
        ));
        assert!(engine.database_exists("analytics").await);

        run(&engine, "CREATE TABLE analytics.t (a UInt64, s String)")
            .await
            .unwrap();
        let err = run(&engine, "CREATE TABLE analytics.t (a UInt64)")
            .await
            .unwrap_err();
        assert_eq!(nativesrv::errors::codes::TABLE_ALREADY_EXISTS, err.code);

        match run(&engine, "INSERT INTO analytics.t VALUES").await.unwrap() {
            QueryPipeline::Pushing(pipeline) => {
                assert_eq!("analytics.t", pipeline.table_name());
                assert_eq!(
                    vec![("a", DataType::UInt64), ("s", DataType::String)],
                    pipeline.header().schema()
                );
            }
            other => panic!("unexpected pipeline {other:?}"),
        }

        let status = engine
            .table_status(&QualifiedTableName {
                database: "analytics".to_string(),
                table: "t".to_string(),
            })
            .await
            .unwrap();
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let engine = MemEngine::new();
        let err = run(&engine, "SELECT * FROM missing").await.unwrap_err();
        assert_eq!(nativesrv::errors::codes::UNKNOWN_TABLE, err.code);
        let err = run(&engine, "DROP TABLE t").await.unwrap_err();
        assert_eq!(nativesrv::errors::codes::SYNTAX_ERROR, err.code);
    }

    #[test]
    fn async_inserts_are_opt_in() {
        assert!(MemEngine::new().async_insert_queue().is_none());
        assert!(MemEngine::new().with_async_inserts().async_insert_queue().is_some());
    }
}
