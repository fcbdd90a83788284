//! Background ingestion queue
//!
//! Adapts the synchronous [`RetrievalEngine::ingest_document_with`] call to
//! a task queue: documents are submitted to a bounded channel and ingested
//! by a fixed pool of workers, so independent documents proceed in
//! parallel. Each submission returns a [`JobHandle`] to observe, cancel or
//! await it.

use crate::RetrievalEngine;
use ragx_core::{Document, IngestionReport, IngestionState, RagxError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Job {
    document: Document,
    cancel: CancellationToken,
    state: watch::Sender<IngestionState>,
    reply: oneshot::Sender<Result<IngestionReport>>,
}

/// Handle to one submitted document
pub struct JobHandle {
    document_id: String,
    state: watch::Receiver<IngestionState>,
    cancel: CancellationToken,
    reply: oneshot::Receiver<Result<IngestionReport>>,
}

impl JobHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Current ingestion state
    pub fn state(&self) -> IngestionState {
        *self.state.borrow()
    }

    /// Receiver for state transitions
    pub fn subscribe(&self) -> watch::Receiver<IngestionState> {
        self.state.clone()
    }

    /// Request cancellation; takes effect between batches
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the ingestion to finish
    pub async fn wait(self) -> Result<IngestionReport> {
        self.reply.await.map_err(|_| RagxError::Cancelled)?
    }
}

/// Fixed worker pool fed by a bounded channel
pub struct IngestionQueue {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestionQueue {
    /// Spawn `workers` ingestion workers
    ///
    /// The channel capacity comes from the engine's ingestion config.
    pub fn start(engine: Arc<RetrievalEngine>, workers: usize) -> Self {
        let capacity = engine.ingestion_config().queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|id| {
                let engine = Arc::clone(&engine);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker_loop(id, engine, receiver))
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            capacity, "Ingestion queue started"
        );
        Self { sender, workers }
    }

    /// Queue a document, waiting for channel capacity
    pub async fn submit(&self, document: Document) -> Result<JobHandle> {
        let (state_tx, state_rx) = watch::channel(IngestionState::Pending);
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let document_id = document.id.clone();

        let job = Job {
            document,
            cancel: cancel.clone(),
            state: state_tx,
            reply: reply_tx,
        };

        self.sender.send(job).await.map_err(|_| {
            RagxError::Other(anyhow::anyhow!("ingestion queue is shut down"))
        })?;
        debug!(document_id = %document_id, "Document queued");

        Ok(JobHandle {
            document_id,
            state: state_rx,
            cancel,
            reply: reply_rx,
        })
    }

    /// Stop accepting documents, drain the queue and join the workers
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Ingestion worker ended abnormally: {e}");
            }
        }
        info!("Ingestion queue stopped");
    }
}

async fn worker_loop(
    id: usize,
    engine: Arc<RetrievalEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        debug!(worker = id, document_id = %job.document.id, "Ingestion started");
        let result = engine
            .ingest_document_with(&job.document, &job.cancel, Some(&job.state))
            .await;

        if let Err(e) = &result {
            error!(worker = id, document_id = %job.document.id, "Ingestion failed: {e}");
        }
        // The submitter may have dropped its handle
        let _ = job.reply.send(result);
    }
    debug!(worker = id, "Ingestion worker exiting");
}
