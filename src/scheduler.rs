//! Poll/update cycle.
//!
//! A producer task reads library snapshots and cuts them into batches; a
//! consumer task wakes up once per interval, takes one batch and runs every
//! book in it through the updater. The two meet at a single-slot channel,
//! so the producer is never more than one batch ahead. Both watch a shared
//! [`CancellationToken`] and stop at the next loop boundary once it fires.

use crate::calibre::Calibre;
use crate::error::{AppError, Result};
use crate::library::Book;
use crate::updater::{Outcome, UpdateProcessor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default time between update cycles.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);

/// Something that can produce a full library snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Read every book.
    async fn list_books(&self) -> Result<Vec<Book>>;
}

/// Something that can bring a single book up to date.
#[async_trait]
pub trait BookProcessor: Send + Sync {
    /// Process one book.
    async fn process(&self, book: &Book) -> Result<Outcome>;
}

#[async_trait]
impl SnapshotSource for Calibre {
    async fn list_books(&self) -> Result<Vec<Book>> {
        Calibre::list_books(self).await
    }
}

#[async_trait]
impl BookProcessor for UpdateProcessor {
    async fn process(&self, book: &Book) -> Result<Outcome> {
        UpdateProcessor::process(self, book).await
    }
}

/// Drives batches from a snapshot source through a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScheduler {
    /// Books per batch; 0 sends every snapshot whole.
    pub batch_size: usize,
    /// Wait before each cycle, including the first.
    pub interval: Duration,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self {
            batch_size: 0,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl BatchScheduler {
    /// Create a scheduler.
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size,
            interval,
        }
    }

    /// Run until `token` is cancelled or either task fails.
    ///
    /// A failing task cancels `token`, so anything else watching it stops too.
    pub async fn run<S, P>(
        &self,
        source: Arc<S>,
        processor: Arc<P>,
        token: CancellationToken,
    ) -> Result<()>
    where
        S: SnapshotSource + ?Sized + 'static,
        P: BookProcessor + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        tasks.spawn(produce(source, self.batch_size, tx, token.clone()));
        tasks.spawn(consume(processor, self.interval, rx, token.clone()));

        supervise(tasks, token).await
    }
}

/// Read snapshots and send batches until cancelled.
///
/// The channel slot is reserved before the library is read, so a snapshot
/// is only taken once the consumer has picked up the previous batch.
/// Dropping `tx` on return closes the channel for the consumer.
async fn produce<S>(
    source: Arc<S>,
    batch_size: usize,
    tx: mpsc::Sender<Vec<Book>>,
    token: CancellationToken,
) -> Result<()>
where
    S: SnapshotSource + ?Sized,
{
    let mut buffer: Vec<Book> = Vec::with_capacity(batch_size * 2);

    while !token.is_cancelled() {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let batch = if batch_size == 0 {
            source.list_books().await?
        } else {
            while buffer.len() < batch_size {
                let snapshot = source.list_books().await?;
                if snapshot.is_empty() {
                    break;
                }
                buffer.extend(snapshot);
            }
            let take = batch_size.min(buffer.len());
            buffer.drain(..take).collect()
        };

        tracing::debug!(books = batch.len(), "Batch ready");
        permit.send(batch);
    }

    tracing::debug!("Batch producer stopped");
    Ok(())
}

/// Every interval, take one batch and process it.
async fn consume<P>(
    processor: Arc<P>,
    interval: Duration,
    mut rx: mpsc::Receiver<Vec<Book>>,
    token: CancellationToken,
) -> Result<()>
where
    P: BookProcessor + ?Sized,
{
    loop {
        tracing::info!(
            "Waiting {} for next update...",
            humantime::format_duration(interval)
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if token.is_cancelled() {
            break;
        }

        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = rx.recv() => match received {
                Some(batch) => batch,
                None => break,
            },
        };

        process_batch(processor.as_ref(), &batch, &token).await;
    }

    // Unblock a producer stuck in `send`, then discard whatever is queued.
    rx.close();
    while rx.recv().await.is_some() {}

    tracing::debug!("Batch consumer stopped");
    Ok(())
}

/// Process books in order. Failures are logged and skipped.
async fn process_batch<P>(processor: &P, batch: &[Book], token: &CancellationToken)
where
    P: BookProcessor + ?Sized,
{
    tracing::info!(books = batch.len(), "Starting update cycle");
    let mut updated = 0usize;
    let mut failed = 0usize;

    for book in batch {
        if token.is_cancelled() {
            tracing::info!("Shutdown requested, abandoning the rest of the batch");
            break;
        }

        match processor.process(book).await {
            Ok(outcome) if outcome.is_updated() => updated += 1,
            Ok(_) => {}
            Err(e) => {
                failed += 1;
                tracing::error!("error updating {}: {}", book.title, e);
            }
        }
    }

    tracing::info!(updated, failed, "Update cycle complete");
}

/// Join every task, cancelling `token` on the first failure.
///
/// Returns the first error; later ones are only logged.
pub async fn supervise(mut tasks: JoinSet<Result<()>>, token: CancellationToken) -> Result<()> {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| AppError::Internal(format!("task failed: {}", e)))
            .and_then(|result| result);

        if let Err(e) = result {
            token.cancel();
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                tracing::warn!(error = %e, "Additional task failure during shutdown");
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
