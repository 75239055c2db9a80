use crate::core::model::{ArchiveRef, BatchId, ItemId, ItemStatus};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    BatchStarted { batch_id: BatchId, items: Vec<ItemId> },
    ItemStatusChanged { batch_id: BatchId, item_id: ItemId, status: ItemStatus, error: Option<String> },
    /// Emitted only after the new offset is durably stored.
    Progress { batch_id: BatchId, item_id: ItemId, downloaded: u64, total: u64 },
    ItemSaved { batch_id: BatchId, item_id: ItemId, path: PathBuf },
    /// Terminal-state count; never decreases within a batch.
    AggregateProgress { batch_id: BatchId, completed: usize, total: usize },
    BundleCreated { batch_id: BatchId, archive: ArchiveRef },
    BatchFinished { batch_id: BatchId, success: bool, cancelled: bool },
    Error { scope: String, message: String },
    Info { scope: String, message: String },
}
