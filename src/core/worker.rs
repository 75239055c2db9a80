use crate::core::assembler::Assembler;
use crate::core::error::TransferError;
use crate::core::events::EngineEvent;
use crate::core::model::{BatchId, TransferItem};
use crate::core::store::ProgressStore;
use crate::plugins::registry::{RangeFetcher, ResourceResolver};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Shared handles a worker needs; cloned into every spawned task.
#[derive(Clone)]
pub struct WorkerDeps {
    pub resolver: Arc<dyn ResourceResolver>,
    pub fetcher: Arc<dyn RangeFetcher>,
    pub store: Arc<dyn ProgressStore>,
    pub events: broadcast::Sender<EngineEvent>,
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Completed { item: TransferItem, path: PathBuf },
    Failed(TransferItem),
    /// Stopped at a checkpoint; the item keeps its last persisted offset.
    Cancelled(TransferItem),
}

impl WorkerOutcome {
    pub fn item(&self) -> &TransferItem {
        match self {
            WorkerOutcome::Completed { item, .. } => item,
            WorkerOutcome::Failed(item) | WorkerOutcome::Cancelled(item) => item,
        }
    }

    pub fn into_item(self) -> TransferItem {
        match self {
            WorkerOutcome::Completed { item, .. } => item,
            WorkerOutcome::Failed(item) | WorkerOutcome::Cancelled(item) => item,
        }
    }
}

enum Transfer {
    Done,
    Cancelled,
}

pub struct TransferWorker {
    deps: WorkerDeps,
    batch_id: BatchId,
}

impl TransferWorker {
    pub fn new(deps: WorkerDeps, batch_id: BatchId) -> Self {
        Self { deps, batch_id }
    }

    /// Downloads one item into `target`, resuming from `item.bytes_downloaded`.
    pub async fn run(&self, mut item: TransferItem, target: PathBuf, cancel: CancellationToken) -> WorkerOutcome {
        if cancel.is_cancelled() {
            return WorkerOutcome::Cancelled(item);
        }

        item.mark_in_progress();
        if let Err(e) = self.deps.store.put(&item).await {
            return self.fail(item, TransferError::Store(e)).await;
        }
        self.emit_status(&item);

        match self.transfer(&mut item, &target, &cancel).await {
            Ok(Transfer::Done) => {
                item.mark_completed();
                if let Err(e) = self.deps.store.put(&item).await {
                    return self.fail(item, TransferError::Store(e)).await;
                }
                tracing::info!(item = %item.id, bytes = item.bytes_downloaded, "item completed");
                self.emit_status(&item);
                let _ = self.deps.events.send(EngineEvent::ItemSaved {
                    batch_id: self.batch_id,
                    item_id: item.id.clone(),
                    path: target.clone(),
                });
                WorkerOutcome::Completed { item, path: target }
            }
            Ok(Transfer::Cancelled) => {
                tracing::info!(item = %item.id, offset = item.bytes_downloaded, "item paused by cancellation");
                WorkerOutcome::Cancelled(item)
            }
            Err(e) => self.fail(item, e).await,
        }
    }

    async fn fail(&self, mut item: TransferItem, err: TransferError) -> WorkerOutcome {
        tracing::warn!(item = %item.id, offset = item.bytes_downloaded, error = %err, "item failed");
        item.mark_failed(err.to_string());
        if let Err(e) = self.deps.store.put(&item).await {
            tracing::warn!(item = %item.id, error = %e, "could not persist failed state");
        }
        self.emit_status(&item);
        WorkerOutcome::Failed(item)
    }

    async fn transfer(
        &self,
        item: &mut TransferItem,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Transfer, TransferError> {
        let url = self
            .deps
            .resolver
            .resolve(&item.id, item.quality)
            .map_err(TransferError::Resolve)?;

        let asm = Assembler::open(target).await.map_err(TransferError::File)?;
        let offset = asm.reconcile(item.bytes_downloaded).await.map_err(TransferError::File)?;
        if offset != item.bytes_downloaded {
            tracing::warn!(
                item = %item.id,
                persisted = item.bytes_downloaded,
                on_disk = offset,
                "partial file shorter than recorded progress, resuming from disk"
            );
            item.bytes_downloaded = offset;
        }

        tracing::debug!(item = %item.id, %url, offset, "starting transfer");
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Ok(Transfer::Cancelled),
            r = self.deps.fetcher.fetch(&url, offset) => r.map_err(TransferError::Network)?,
        };

        let mut base = offset;
        if !resp.resumed && offset > 0 {
            tracing::warn!(item = %item.id, offset, "server ignored range request, restarting from zero");
            asm.reconcile(0).await.map_err(TransferError::File)?;
            base = 0;
            item.bytes_downloaded = 0;
        }
        if let Some(len) = resp.declared_len {
            item.bytes_total = base + len;
        }
        item.touch();
        self.deps.store.put(item).await?;
        self.emit_progress(item);

        let mut body = resp.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Transfer::Cancelled),
                next = body.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Err(e)) => return Err(TransferError::Network(e)),
                Some(Ok(chunk)) => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            let got = item.bytes_downloaded + chunk.len() as u64;
            if item.bytes_total > 0 && got > item.bytes_total {
                return Err(TransferError::Overflow { got, expected: item.bytes_total });
            }

            asm.write_at(item.bytes_downloaded, &chunk).await.map_err(TransferError::File)?;
            asm.flush().await.map_err(TransferError::File)?;

            item.bytes_downloaded = got;
            item.touch();
            // durable before visible
            self.deps.store.put(item).await?;
            self.emit_progress(item);
        }

        if item.bytes_total > 0 && item.bytes_downloaded < item.bytes_total {
            return Err(TransferError::Truncated { got: item.bytes_downloaded, expected: item.bytes_total });
        }

        asm.finish(target).await.map_err(TransferError::File)?;
        Ok(Transfer::Done)
    }

    fn emit_status(&self, item: &TransferItem) {
        let _ = self.deps.events.send(EngineEvent::ItemStatusChanged {
            batch_id: self.batch_id,
            item_id: item.id.clone(),
            status: item.status,
            error: item.error.clone(),
        });
    }

    fn emit_progress(&self, item: &TransferItem) {
        let _ = self.deps.events.send(EngineEvent::Progress {
            batch_id: self.batch_id,
            item_id: item.id.clone(),
            downloaded: item.bytes_downloaded,
            total: item.bytes_total,
        });
    }
}
