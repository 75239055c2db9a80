use crate::core::bundler::{BundleEntry, Bundler, Naming};
use crate::core::error::{BatchError, BundleError, StoreError, ValidationError};
use crate::core::events::EngineEvent;
use crate::core::model::*;
use crate::core::planner::{compare_ids, expand_specifiers};
use crate::core::store::ProgressStore;
use crate::core::worker::{TransferWorker, WorkerDeps, WorkerOutcome};
use crate::core::assembler::Assembler;
use crate::plugins::registry::{RangeFetcher, ResourceResolver};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Upper bound on concurrent workers per batch.
pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub out_dir: PathBuf,
    pub concurrency: usize,
    pub naming: Naming,
    /// Keep individual files after they were bundled.
    pub keep_files: bool,
}

impl EngineConfig {
    pub fn new(out_dir: PathBuf, naming: Naming) -> Self {
        Self { out_dir, concurrency: 4, naming, keep_files: false }
    }
}

/// Completed-count progress of one batch. Each item counts at most once.
#[derive(Debug)]
pub struct BatchProgress {
    total: usize,
    completed: usize,
    terminal: HashSet<ItemId>,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self { total, completed: 0, terminal: HashSet::new() }
    }

    /// Returns false when `id` already reached a terminal state.
    pub fn record(&mut self, id: &str, status: ItemStatus) -> bool {
        if !status.is_terminal() || !self.terminal.insert(id.to_string()) {
            return false;
        }
        if status == ItemStatus::Completed {
            self.completed += 1;
        }
        true
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn total(&self) -> usize {
        self.total
    }

}

/// Releases the item ids a batch owns when dropped.
struct ClaimGuard {
    claimed: Arc<Mutex<HashSet<ItemId>>>,
    ids: Vec<ItemId>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut set = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            set.remove(id);
        }
    }
}

pub struct BatchHandle {
    pub batch_id: BatchId,
    join: JoinHandle<BatchResult>,
}

impl BatchHandle {
    pub async fn wait(self) -> Result<BatchResult, BatchError> {
        self.join.await.map_err(|e| BatchError::Aborted(e.to_string()))
    }
}

#[derive(Clone)]
pub struct Engine {
    cfg: Arc<EngineConfig>,
    deps: WorkerDeps,
    batches: Arc<Mutex<HashMap<BatchId, CancellationToken>>>,
    claimed: Arc<Mutex<HashSet<ItemId>>>,
}

impl Engine {
    pub fn new(
        mut cfg: EngineConfig,
        resolver: Arc<dyn ResourceResolver>,
        fetcher: Arc<dyn RangeFetcher>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        cfg.concurrency = cfg.concurrency.clamp(1, MAX_CONCURRENCY);
        let (events, _) = broadcast::channel(1024);
        Self {
            cfg: Arc::new(cfg),
            deps: WorkerDeps { resolver, fetcher, store, events },
            batches: Arc::new(Mutex::new(HashMap::new())),
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.deps.events.subscribe()
    }

    /// Validates, persists and launches a batch, then waits for its result.
    pub async fn submit(&self, req: BatchRequest) -> Result<BatchResult, BatchError> {
        self.start(req).await?.wait().await
    }

    /// Like [`Engine::submit`] but returns once the workers are dispatched.
    ///
    /// Validation and store failures are still reported here, before any transfer starts.
    pub async fn start(&self, req: BatchRequest) -> Result<BatchHandle, BatchError> {
        let ids = expand_specifiers(&req.specifiers, req.sorted)?;
        let specs = ids.into_iter().map(|id| (id, req.quality)).collect();
        self.launch(specs, req.bundle).await
    }

    pub async fn list_resumable(&self) -> Result<Vec<TransferItem>, StoreError> {
        self.deps.store.list_active().await
    }

    /// Resubmits every interrupted item with the quality it was started with.
    pub async fn resume_all(&self, bundle: bool) -> Result<BatchResult, BatchError> {
        let mut items = self.list_resumable().await?;
        let collection = &self.cfg.naming.collection;
        let before = items.len();
        items.retain(|i| &i.collection == collection);
        if items.len() < before {
            tracing::info!(
                skipped = before - items.len(),
                %collection,
                "interrupted items of other collections left untouched"
            );
        }
        if items.is_empty() {
            return Err(ValidationError::Empty.into());
        }
        items.sort_by(|a, b| compare_ids(&a.id, &b.id));
        let specs = items.into_iter().map(|i| (i.id, i.quality)).collect();
        self.launch(specs, bundle).await?.wait().await
    }

    /// Explicit retry of one item; resumes from its last persisted offset.
    pub async fn retry(&self, item_id: &str) -> Result<BatchResult, BatchError> {
        let rec = self
            .deps
            .store
            .get(item_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownItem(item_id.to_string()))?;
        if rec.status == ItemStatus::Completed {
            return Err(ValidationError::NotRetryable(item_id.to_string()).into());
        }
        self.launch(vec![(rec.id, rec.quality)], false).await?.wait().await
    }

    /// Drops the durable record of an item together with its partial file.
    pub async fn forget(&self, item_id: &str) -> Result<bool, BatchError> {
        let _claim = self.claim(&[item_id.to_string()])?;
        let Some(rec) = self.deps.store.get(item_id).await? else {
            return Ok(false);
        };
        self.deps.store.delete(item_id).await?;

        let target = self.target_path(&rec);
        remove_leftover(&Assembler::partial_path_for(&target)).await;
        tracing::info!(item = %item_id, "forgot stored transfer");
        Ok(true)
    }

    /// Signals every worker of the batch to stop at its next chunk.
    pub fn cancel(&self, batch_id: &BatchId) -> bool {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        match batches.get(batch_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        for token in batches.values() {
            token.cancel();
        }
    }

    /// Where the item's bytes live, under the collection it was started with.
    fn target_path(&self, item: &TransferItem) -> PathBuf {
        let naming = self.cfg.naming.for_collection(&item.collection);
        self.cfg.out_dir.join(naming.item_file_name(&item.id, item.quality))
    }

    fn unregister(&self, batch_id: &BatchId) {
        let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        batches.remove(batch_id);
    }

    fn claim(&self, ids: &[ItemId]) -> Result<ClaimGuard, ValidationError> {
        let mut set = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let busy: Vec<ItemId> = ids.iter().filter(|id| set.contains(*id)).cloned().collect();
        if !busy.is_empty() {
            return Err(ValidationError::ItemBusy(busy));
        }
        set.extend(ids.iter().cloned());
        Ok(ClaimGuard { claimed: self.claimed.clone(), ids: ids.to_vec() })
    }

    /// Starting state for every item: resume a matching record, keep a finished file, or start fresh.
    ///
    /// All records are read before any is written, and the writes land together,
    /// so a rejected submission leaves the store as it was.
    async fn seed_items(&self, specs: Vec<(ItemId, Quality)>) -> Result<Vec<TransferItem>, BatchError> {
        let collection = &self.cfg.naming.collection;
        let mut items = Vec::with_capacity(specs.len());
        let mut replaced = Vec::new();

        for (id, quality) in specs {
            let fresh = TransferItem::new(id.clone(), quality).in_collection(collection.clone());
            let item = match self.deps.store.get(&id).await? {
                None => fresh,
                Some(rec) if &rec.collection != collection && rec.status != ItemStatus::Completed => {
                    return Err(ValidationError::ForeignRecord { id, collection: rec.collection }.into());
                }
                Some(mut rec) if &rec.collection == collection && rec.quality == quality => match rec.status {
                    ItemStatus::Completed => {
                        if tokio::fs::metadata(self.target_path(&rec)).await.is_ok() {
                            rec
                        } else {
                            fresh
                        }
                    }
                    ItemStatus::Failed => {
                        rec.reset_for_retry();
                        rec
                    }
                    ItemStatus::Pending | ItemStatus::InProgress => rec,
                },
                Some(rec) => {
                    if rec.status != ItemStatus::Completed {
                        replaced.push(Assembler::partial_path_for(&self.target_path(&rec)));
                    }
                    fresh
                }
            };
            items.push(item);
        }

        self.deps.store.put_all(&items).await?;
        for partial in replaced {
            remove_leftover(&partial).await;
        }
        Ok(items)
    }

    async fn launch(&self, specs: Vec<(ItemId, Quality)>, bundle: bool) -> Result<BatchHandle, BatchError> {
        let ids: Vec<ItemId> = specs.iter().map(|(id, _)| id.clone()).collect();
        let claim = self.claim(&ids)?;

        // registered first so a cancel during seeding is not lost
        let batch_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
            batches.insert(batch_id, cancel.clone());
        }

        let items = match self.seed_items(specs).await {
            Ok(items) => items,
            Err(e) => {
                self.unregister(&batch_id);
                return Err(e);
            }
        };

        tracing::info!(batch = %batch_id, items = items.len(), bundle, "batch started");
        let _ = self.deps.events.send(EngineEvent::BatchStarted { batch_id, items: ids });

        let engine = self.clone();
        let join = tokio::spawn(async move { engine.run_batch(batch_id, items, bundle, cancel, claim).await });

        Ok(BatchHandle { batch_id, join })
    }

    async fn run_batch(
        &self,
        batch_id: BatchId,
        items: Vec<TransferItem>,
        bundle: bool,
        cancel: CancellationToken,
        _claim: ClaimGuard,
    ) -> BatchResult {
        let order: Vec<ItemId> = items.iter().map(|i| i.id.clone()).collect();
        let mut progress = BatchProgress::new(items.len());
        let mut finished: HashMap<ItemId, TransferItem> = HashMap::new();
        let mut paths: HashMap<ItemId, PathBuf> = HashMap::new();

        let sem = Arc::new(Semaphore::new(self.cfg.concurrency));
        let mut futs = FuturesUnordered::new();

        for item in items {
            let target = self.target_path(&item);

            if item.status == ItemStatus::Completed {
                paths.insert(item.id.clone(), target);
                self.record_terminal(batch_id, &mut progress, &item);
                finished.insert(item.id.clone(), item);
                continue;
            }

            let worker = TransferWorker::new(self.deps.clone(), batch_id);
            let sem = sem.clone();
            let cancel = cancel.clone();
            let fallback = item.clone();
            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return WorkerOutcome::Cancelled(item),
                    p = sem.acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => return WorkerOutcome::Cancelled(item),
                    },
                };
                worker.run(item, target, cancel).await
            });
            futs.push(async move { (fallback, handle.await) });
        }

        while let Some((fallback, joined)) = futs.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let mut item = fallback;
                    item.mark_failed(format!("worker aborted: {e}"));
                    if let Err(se) = self.deps.store.put(&item).await {
                        tracing::warn!(item = %item.id, error = %se, "could not persist failed state");
                    }
                    WorkerOutcome::Failed(item)
                }
            };

            if let WorkerOutcome::Completed { item, path } = &outcome {
                paths.insert(item.id.clone(), path.clone());
            }
            let item = outcome.into_item();
            self.record_terminal(batch_id, &mut progress, &item);
            finished.insert(item.id.clone(), item);
        }

        // every worker has reported; nothing below races an in-flight transfer
        let items: Vec<TransferItem> = order.iter().filter_map(|id| finished.remove(id)).collect();
        let all_completed = items.iter().all(|i| i.status == ItemStatus::Completed);
        let cancelled = cancel.is_cancelled() && items.iter().any(|i| i.status.is_active());

        let mut archive = None;
        let mut bundle_error = None;
        if bundle && all_completed && !cancelled {
            match self.bundle(&items, &paths).await {
                Ok(a) => {
                    if !self.cfg.keep_files {
                        for path in paths.values() {
                            remove_leftover(path).await;
                        }
                    }
                    let _ = self.deps.events.send(EngineEvent::BundleCreated { batch_id, archive: a.clone() });
                    archive = Some(a);
                }
                Err(e) => {
                    tracing::warn!(batch = %batch_id, error = %e, "bundling failed, items kept individually");
                    let _ = self.deps.events.send(EngineEvent::Error {
                        scope: format!("bundle(batch={})", batch_id),
                        message: e.to_string(),
                    });
                    bundle_error = Some(e.to_string());
                }
            }
        } else if bundle && !cancelled {
            let failed = items.iter().filter(|i| i.status == ItemStatus::Failed).count();
            let _ = self.deps.events.send(EngineEvent::Info {
                scope: format!("bundle(batch={})", batch_id),
                message: format!("skipped: {} item(s) failed, completed items saved individually", failed),
            });
        }

        let success = all_completed && !cancelled && bundle_error.is_none();

        self.unregister(&batch_id);
        tracing::info!(
            batch = %batch_id,
            completed = progress.completed(),
            total = progress.total(),
            success,
            cancelled,
            "batch finished"
        );
        let _ = self.deps.events.send(EngineEvent::BatchFinished { batch_id, success, cancelled });

        BatchResult { batch_id, items, success, cancelled, archive, bundle_error }
    }

    fn record_terminal(&self, batch_id: BatchId, progress: &mut BatchProgress, item: &TransferItem) {
        if progress.record(&item.id, item.status) {
            let _ = self.deps.events.send(EngineEvent::AggregateProgress {
                batch_id,
                completed: progress.completed(),
                total: progress.total(),
            });
        }
    }

    async fn bundle(
        &self,
        items: &[TransferItem],
        paths: &HashMap<ItemId, PathBuf>,
    ) -> Result<ArchiveRef, BundleError> {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let path = paths.get(&item.id).ok_or_else(|| {
                BundleError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no saved file for item {}", item.id),
                ))
            })?;
            let bytes = tokio::fs::read(path).await?;
            entries.push(BundleEntry { id: item.id.clone(), quality: item.quality, bytes });
        }

        let bundler = Bundler::new(self.cfg.naming.clone(), self.cfg.out_dir.clone());
        tokio::task::spawn_blocking(move || bundler.bundle(entries))
            .await
            .map_err(|e| BundleError::Join(e.to_string()))?
    }
}

/// Removes a file that may already be gone.
async fn remove_leftover(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}
