//! Interface to the engine executing queries.
//!
//! The handler only moves blocks. Parsing, planning and storage live behind
//! [`QueryEngine`], which turns a [`QueryContext`] into a [`QueryPipeline`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::async_insert::AsyncInsertQueue;
use crate::block::Block;
use crate::cancel::{CancellationStatus, QueryCallbacks};
use crate::errors::ExecError;
use crate::messages::{ClientInfo, ProfileInfo, QualifiedTableName, TableStatus};
use crate::parallel_read::channel::ReadTaskChannel;
use crate::parallel_read::types::{
    InitialAllRangesAnnouncement, ParallelReadRequest, ParallelReadResponse,
};
use crate::profile_events::{ProfileEventCounters, events};
use crate::progress::ProgressTracker;
use crate::protocol::QueryProcessingStage;
use crate::settings::Settings;

#[async_trait]
pub trait QueryEngine: Sync + Send + fmt::Debug + 'static {
    /// Prepare a query for execution.
    async fn execute(&self, ctx: Arc<QueryContext>) -> Result<QueryPipeline, ExecError>;

    async fn database_exists(&self, database: &str) -> bool;

    /// Status of a table, `None` if it doesn't exist.
    async fn table_status(
        &self,
        table: &QualifiedTableName,
    ) -> Result<Option<TableStatus>, ExecError>;

    /// Queue for batching inserts, if the engine has one.
    fn async_insert_queue(&self) -> Option<Arc<dyn AsyncInsertQueue>> {
        None
    }
}

/// What executing a query produced.
pub enum QueryPipeline {
    /// Produces blocks to send to the client.
    Pulling(Box<dyn PullingPipeline>),
    /// Consumes blocks sent by the client.
    Pushing(Box<dyn PushingPipeline>),
    /// Nothing to send or receive.
    Completed,
}

impl fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pulling(p) => f.debug_tuple("Pulling").field(p).finish(),
            Self::Pushing(p) => f.debug_tuple("Pushing").field(p).finish(),
            Self::Completed => f.write_str("Completed"),
        }
    }
}

#[async_trait]
pub trait PullingPipeline: Send + fmt::Debug {
    /// Structure of the blocks this pipeline produces.
    fn header(&self) -> Block;

    /// Next block of the result, `None` once done.
    async fn pull(&mut self) -> Result<Option<Block>, ExecError>;

    fn totals(&mut self) -> Option<Block> {
        None
    }

    fn extremes(&mut self) -> Option<Block> {
        None
    }

    fn profile_info(&self) -> Option<ProfileInfo> {
        None
    }
}

#[async_trait]
pub trait PushingPipeline: Send + Sync + fmt::Debug {
    /// Structure of the blocks this pipeline accepts.
    fn header(&self) -> Block;

    /// Qualified name of the table being written to.
    fn table_name(&self) -> String {
        String::new()
    }

    /// Column description sent ahead of the header, if there is one.
    fn columns_description(&self) -> Option<String> {
        None
    }

    async fn push(&mut self, block: Block) -> Result<(), ExecError>;

    /// Commit everything pushed.
    async fn finish(&mut self) -> Result<(), ExecError>;
}

/// Client data for a query reading from `input()`.
#[derive(Debug)]
pub struct InputReader {
    rx: mpsc::UnboundedReceiver<Block>,
}

impl InputReader {
    /// Next block sent by the client. `None` once the client sent the end of
    /// its data, or reading was cancelled.
    pub async fn next(&mut self) -> Option<Block> {
        self.rx.recv().await
    }
}

/// The handler's side of [`InputReader`].
#[derive(Debug)]
pub(crate) struct InputFeed {
    pub header: Block,
    pub tx: mpsc::UnboundedSender<Block>,
}

/// Everything a pipeline may need from the connection running it.
#[derive(Debug)]
pub struct QueryContext {
    pub query_id: String,
    pub query: String,
    pub user: String,
    pub database: String,
    pub settings: Settings,
    pub client_info: ClientInfo,
    pub stage: QueryProcessingStage,
    /// Query parameters as name and value.
    pub parameters: Vec<(String, String)>,
    ignored_part_uuids: HashSet<Uuid>,
    part_uuids: Mutex<Vec<Uuid>>,
    scalars: Mutex<HashMap<String, Block>>,
    callbacks: Arc<QueryCallbacks>,
    progress: ProgressTracker,
    profile_events: ProfileEventCounters,
    input_requested: AtomicBool,
    input: Mutex<Option<InputFeed>>,
    read_tasks: Option<ReadTaskChannel>,
}

impl QueryContext {
    pub fn new(query_id: impl Into<String>, query: impl Into<String>) -> Self {
        QueryContext {
            query_id: query_id.into(),
            query: query.into(),
            user: String::new(),
            database: String::new(),
            settings: Settings::default(),
            client_info: ClientInfo::default(),
            stage: QueryProcessingStage::default(),
            parameters: Vec::new(),
            ignored_part_uuids: HashSet::new(),
            part_uuids: Mutex::new(Vec::new()),
            scalars: Mutex::new(HashMap::new()),
            callbacks: Arc::new(QueryCallbacks::default()),
            progress: ProgressTracker::default(),
            profile_events: ProfileEventCounters::default(),
            input_requested: AtomicBool::new(false),
            input: Mutex::new(None),
            read_tasks: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub(crate) fn with_callbacks(mut self, callbacks: Arc<QueryCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub(crate) fn with_ignored_part_uuids(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.ignored_part_uuids = uuids.into_iter().collect();
        self
    }

    pub(crate) fn with_scalars(self, scalars: impl IntoIterator<Item = (String, Block)>) -> Self {
        self.scalars.lock().extend(scalars);
        self
    }

    pub(crate) fn with_read_tasks(mut self, channel: ReadTaskChannel) -> Self {
        self.read_tasks = Some(channel);
        self
    }

    pub fn callbacks(&self) -> &Arc<QueryCallbacks> {
        &self.callbacks
    }

    pub fn cancellation_status(&self) -> CancellationStatus {
        self.callbacks.status()
    }

    pub fn is_fully_cancelled(&self) -> bool {
        self.callbacks.is_fully_cancelled()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn profile_events(&self) -> &ProfileEventCounters {
        &self.profile_events
    }

    /// Whether the client asked for this part to be skipped.
    pub fn is_part_ignored(&self, uuid: &Uuid) -> bool {
        self.ignored_part_uuids.contains(uuid)
    }

    /// Record a part the query read, reported back to the client.
    pub fn add_part_uuid(&self, uuid: Uuid) {
        self.part_uuids.lock().push(uuid);
    }

    pub(crate) fn take_part_uuids(&self) -> Vec<Uuid> {
        std::mem::take(&mut *self.part_uuids.lock())
    }

    pub fn scalar(&self, name: &str) -> Option<Block> {
        self.scalars.lock().get(name).cloned()
    }

    pub(crate) fn add_scalar(&self, name: String, block: Block) {
        self.scalars.lock().insert(name, block);
    }

    /// Ask the client for data matching `header`, for queries reading from
    /// `input()`. Can be called once per query, while the query is prepared.
    pub fn take_input(&self, header: Block) -> Result<InputReader, ExecError> {
        if self.input_requested.swap(true, Ordering::SeqCst) {
            return Err(ExecError::logical("input() can only be read once per query"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.input.lock() = Some(InputFeed {
            header: header.to_header(),
            tx,
        });
        Ok(InputReader { rx })
    }

    pub(crate) fn take_input_feed(&self) -> Option<InputFeed> {
        self.input.lock().take()
    }

    /// Whether this query may pull read tasks from the peer that sent it.
    pub fn has_read_tasks(&self) -> bool {
        self.read_tasks.is_some()
    }

    fn read_tasks(&self) -> Result<&ReadTaskChannel, ExecError> {
        self.read_tasks
            .as_ref()
            .ok_or_else(|| ExecError::logical("query was not sent by a coordinating replica"))
    }

    pub async fn announce_ranges(
        &self,
        announcement: InitialAllRangesAnnouncement,
    ) -> Result<(), ExecError> {
        self.read_tasks()?.announce(announcement).await
    }

    /// Next ranges to read, `None` if the query was cancelled.
    pub async fn request_ranges(
        &self,
        request: ParallelReadRequest,
    ) -> Result<Option<ParallelReadResponse>, ExecError> {
        let start = Instant::now();
        let resp = self.read_tasks()?.request(request).await;
        self.profile_events.increment(
            events::PARALLEL_REPLICAS_READ_REQUESTS,
            start.elapsed().as_micros() as i64,
        );
        resp
    }

    /// Next task of a cluster table function, `None` if the query was
    /// cancelled.
    pub async fn next_read_task(&self) -> Result<Option<String>, ExecError> {
        self.read_tasks()?.next_task().await
    }
}
