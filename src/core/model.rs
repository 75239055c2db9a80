use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type BatchId = Uuid;
pub type ItemId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    Low,
    #[default]
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::High => "high",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "high" => Ok(Quality::High),
            other => Err(format!("unknown quality: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "in_progress" => Some(ItemStatus::InProgress),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::InProgress)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-item transfer state. `bytes_total == 0` means the size is not known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub id: ItemId,
    pub status: ItemStatus,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub last_modified: i64,
    pub quality: Quality,
    /// Naming collection the bytes on disk belong to, e.g. `quran-alafasy`.
    pub collection: String,
    pub error: Option<String>,
}

impl TransferItem {
    pub fn new(id: impl Into<ItemId>, quality: Quality) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Pending,
            bytes_downloaded: 0,
            bytes_total: 0,
            last_modified: now_millis(),
            quality,
            collection: String::new(),
            error: None,
        }
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn progress_percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }
        let pct = (self.bytes_downloaded as f64 / self.bytes_total as f64) * 100.0;
        pct.round().clamp(0.0, 100.0) as u8
    }

    pub fn touch(&mut self) {
        self.last_modified = now_millis();
    }

    pub fn mark_in_progress(&mut self) {
        self.status = ItemStatus::InProgress;
        self.error = None;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        if self.bytes_total == 0 {
            self.bytes_total = self.bytes_downloaded;
        }
        self.status = ItemStatus::Completed;
        self.error = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.error = Some(error.into());
        self.touch();
    }

    /// `failed -> pending`; keeps the byte offset so the retry resumes.
    pub fn reset_for_retry(&mut self) {
        self.status = ItemStatus::Pending;
        self.error = None;
        self.touch();
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub specifiers: String,
    pub quality: Quality,
    pub bundle: bool,
    pub sorted: bool,
}

impl BatchRequest {
    pub fn new(specifiers: impl Into<String>) -> Self {
        Self {
            specifiers: specifiers.into(),
            quality: Quality::default(),
            bundle: false,
            sorted: true,
        }
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn bundle(mut self, bundle: bool) -> Self {
        self.bundle = bundle;
        self
    }

    pub fn sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub path: PathBuf,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub items: Vec<TransferItem>,
    pub success: bool,
    pub cancelled: bool,
    pub archive: Option<ArchiveRef>,
    pub bundle_error: Option<String>,
}

impl BatchResult {
    pub fn completed(&self) -> impl Iterator<Item = &TransferItem> {
        self.items.iter().filter(|i| i.status == ItemStatus::Completed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferItem> {
        self.items.iter().filter(|i| i.status == ItemStatus::Failed)
    }

    pub fn item(&self, id: &str) -> Option<&TransferItem> {
        self.items.iter().find(|i| i.id == id)
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
