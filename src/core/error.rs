use crate::core::model::ItemId;

/// Rejections raised before any I/O happens.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid specifier {spec:?}: {reason}")]
    BadSpecifier { spec: String, reason: String },

    #[error("range {lo}-{hi} spans more than {max} items")]
    RangeTooWide { lo: u64, hi: u64, max: u64 },

    #[error("nothing to download: the request expanded to no items")]
    Empty,

    #[error("items already running in another batch: {}", .0.join(", "))]
    ItemBusy(Vec<ItemId>),

    #[error("item {id} has saved progress under {collection}; use that reciter or forget the item first")]
    ForeignRecord { id: ItemId, collection: String },

    #[error("no stored transfer for item {0}")]
    UnknownItem(ItemId),

    #[error("item {0} already completed")]
    NotRetryable(ItemId),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("progress store i/o: {0}")]
    Io(#[from] sqlx::Error),

    #[error("corrupt record for item {id}: {reason}")]
    Corrupt { id: ItemId, reason: String },
}

/// Per-item failure; recorded on the item, never escalated to siblings.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("resolve url: {0:#}")]
    Resolve(anyhow::Error),

    #[error("network: {0:#}")]
    Network(anyhow::Error),

    #[error("local file: {0:#}")]
    File(anyhow::Error),

    #[error("persist progress: {0}")]
    Store(#[from] StoreError),

    #[error("body ended at {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },

    #[error("body exceeded declared size ({got} > {expected} bytes)")]
    Overflow { got: u64, expected: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum BundleError {
    #[error("duplicate archive entry {0}")]
    DuplicateEntry(String),

    #[error("archive i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive write: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("bundle task aborted: {0}")]
    Join(String),
}

/// Errors that abort a whole submission before any worker starts.
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("batch task aborted: {0}")]
    Aborted(String),
}
