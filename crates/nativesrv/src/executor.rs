use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, trace};

use crate::block::Block;
use crate::cancel::QueryCallbacks;
use crate::engine::PullingPipeline;
use crate::errors::ExecError;

/// Runs a pulling pipeline on its own task so the connection can keep
/// reading packets while blocks are produced.
///
/// At most one block is buffered between the task and the connection.
#[derive(Debug)]
pub struct PipelineExecutor {
    rx: mpsc::Receiver<Result<Block, ExecError>>,
    handle: Option<JoinHandle<Box<dyn PullingPipeline>>>,
}

impl PipelineExecutor {
    pub fn spawn(mut pipeline: Box<dyn PullingPipeline>, callbacks: Arc<QueryCallbacks>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let fut = async move {
            loop {
                if callbacks.is_fully_cancelled() {
                    trace!("pipeline cancelled");
                    break;
                }
                let res = tokio::select! {
                    biased;
                    _ = callbacks.fully_cancelled() => {
                        trace!("pipeline cancelled while pulling");
                        break;
                    }
                    res = pipeline.pull() => res,
                };
                match res {
                    Ok(Some(block)) => {
                        if tx.send(Ok(block)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            pipeline
        };
        let handle = tokio::spawn(fut.instrument(Span::current()));
        PipelineExecutor {
            rx,
            handle: Some(handle),
        }
    }

    /// Next block produced. `None` once the pipeline is done or was
    /// cancelled.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<Result<Block, ExecError>> {
        self.rx.recv().await
    }

    /// Wait for the pipeline task to stop, returning the pipeline so totals
    /// and extremes can be read from it.
    pub async fn finish(mut self) -> Result<Box<dyn PullingPipeline>, ExecError> {
        self.rx.close();
        // Let a task blocked on sending see the closed channel.
        while self.rx.recv().await.is_some() {}
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ExecError::logical("pipeline executor already finished"))?;
        handle
            .await
            .map_err(|e| ExecError::logical(format!("pipeline task failed: {e}")))
    }
}

impl Drop for PipelineExecutor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
