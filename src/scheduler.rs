//! Translation worker pool.
//! Inference and engine loads are blocking and can take seconds, so they run on
//! dedicated OS threads fed by a bounded crossbeam queue, never on the tokio
//! threads that multiplex connections. Results come back over a oneshot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel as cb;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::{metric_names, MetricsRegistry};
use crate::translate::service::panic_message;
use crate::translate::{FailureReason, TranslateRequest, TranslationOutcome, TranslationService};

/// A queued translation.
struct Job {
    request: TranslateRequest,
    cancel: CancellationToken,
    reply: oneshot::Sender<TranslationOutcome>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("translation queue is full")]
    Overloaded,
    #[error("translation pool is shut down")]
    Closed,
    #[error("translation request cancelled")]
    Cancelled,
    #[error("translation worker dropped the request")]
    WorkerLost,
}

pub struct TranslationPool {
    tx: cb::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl TranslationPool {
    /// Spawn `workers` threads draining a queue of at most `queue_depth` jobs.
    pub fn start(
        service: Arc<TranslationService>,
        metrics: Arc<MetricsRegistry>,
        workers: usize,
        queue_depth: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = cb::bounded::<Job>(queue_depth.max(1));
        let mut handles = Vec::with_capacity(workers.max(1));

        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let service = Arc::clone(&service);
            let metrics = Arc::clone(&metrics);
            let handle = std::thread::Builder::new()
                .name(format!("translate-worker-{index}"))
                .spawn(move || worker_loop(rx, service, metrics))?;
            handles.push(handle);
        }

        info!(workers = handles.len(), queue_depth, "translation pool started");
        Ok(Self {
            tx,
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Queue `request` and wait for its outcome without blocking the async runtime.
    ///
    /// Cancelling `cancel` stops the wait immediately. A job already running on a
    /// worker finishes in the background and its result is discarded.
    pub async fn submit(
        &self,
        request: TranslateRequest,
        cancel: &CancellationToken,
    ) -> Result<TranslationOutcome, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let (reply, rx) = oneshot::channel();
        let job = Job {
            request,
            cancel: cancel.clone(),
            reply,
            enqueued_at: Instant::now(),
        };

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(cb::TrySendError::Full(job)) => {
                warn!(request_id = %job.request.request_id, "translation queue full, rejecting");
                return Err(DispatchError::Overloaded);
            }
            Err(cb::TrySendError::Disconnected(_)) => return Err(DispatchError::Closed),
        }

        tokio::select! {
            outcome = rx => outcome.map_err(|_| DispatchError::WorkerLost),
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        }
    }

    /// Close the queue and wait for workers to drain it.
    pub fn shutdown(self) {
        let Self { tx, workers } = self;
        drop(tx);
        for handle in workers {
            if handle.join().is_err() {
                warn!("translation worker panicked during shutdown");
            }
        }
        info!("translation pool stopped");
    }
}

/// Worker thread body: runs until every sender is gone.
fn worker_loop(
    rx: cb::Receiver<Job>,
    service: Arc<TranslationService>,
    metrics: Arc<MetricsRegistry>,
) {
    while let Ok(job) = rx.recv() {
        let wait_us = job.enqueued_at.elapsed().as_micros() as f64;
        metrics.record(metric_names::QUEUE_WAIT, wait_us);

        if job.cancel.is_cancelled() || job.reply.is_closed() {
            debug!(request_id = %job.request.request_id, "skipping abandoned translation");
            continue;
        }

        // A panic must cost one request, not the worker.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            service.translate_request(&job.request, Some(&job.cancel))
        }))
        .unwrap_or_else(|payload| {
            error!(
                request_id = %job.request.request_id,
                panic = panic_message(payload.as_ref()),
                "translation panicked"
            );
            TranslationOutcome::Failed(FailureReason::EngineUnavailable)
        });
        // The caller may have stopped waiting; nothing to do then.
        let _ = job.reply.send(outcome);
    }
    debug!("translation worker exiting");
}
