use crate::core::error::StoreError;
use crate::core::model::{ItemStatus, Quality, TransferItem};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::Path;

/// Durable per-item transfer state, keyed by item id.
///
/// Records outlive batches and are only removed through [`ProgressStore::delete`].
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Last write wins. A failed write leaves the previous record intact.
    async fn put(&self, item: &TransferItem) -> Result<(), StoreError>;

    /// Writes every item or none of them.
    async fn put_all(&self, items: &[TransferItem]) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<TransferItem>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Items whose status is `pending` or `in_progress`.
    async fn list_active(&self) -> Result<Vec<TransferItem>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first run
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %abs.display(), "progress store opened");
        Ok(store)
    }

    /// Single-connection in-memory store; every connection to `:memory:` is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("connect in-memory sqlite")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
              item_id TEXT PRIMARY KEY NOT NULL,
              status TEXT NOT NULL,           -- pending|in_progress|completed|failed
              quality TEXT NOT NULL,
              collection TEXT NOT NULL DEFAULT '',
              bytes_downloaded INTEGER NOT NULL DEFAULT 0,
              bytes_total INTEGER NOT NULL DEFAULT 0,
              error TEXT NULL,
              last_modified INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create transfers table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_status
            ON transfers(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create status index")?;

        Ok(())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn put(&self, item: &TransferItem) -> Result<(), StoreError> {
        // one statement: either the new row is committed or the old one survives
        upsert(item).execute(&self.pool).await?;
        Ok(())
    }

    async fn put_all(&self, items: &[TransferItem]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            upsert(item).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TransferItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT item_id, status, quality, collection, bytes_downloaded, bytes_total, error, last_modified
            FROM transfers
            WHERE item_id = ?;
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM transfers WHERE item_id = ?"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<TransferItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, status, quality, collection, bytes_downloaded, bytes_total, error, last_modified
            FROM transfers
            WHERE status IN ('pending', 'in_progress')
            ORDER BY last_modified ASC, item_id ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }
}

fn upsert(item: &TransferItem) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO transfers
          (item_id, status, quality, collection, bytes_downloaded, bytes_total, error, last_modified)
        VALUES
          (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
          status = excluded.status,
          quality = excluded.quality,
          collection = excluded.collection,
          bytes_downloaded = excluded.bytes_downloaded,
          bytes_total = excluded.bytes_total,
          error = excluded.error,
          last_modified = excluded.last_modified;
        "#,
    )
    .bind(&item.id)
    .bind(item.status.as_str())
    .bind(item.quality.as_str())
    .bind(&item.collection)
    .bind(item.bytes_downloaded as i64)
    .bind(item.bytes_total as i64)
    .bind(item.error.as_deref())
    .bind(item.last_modified)
}

fn row_to_item(row: &SqliteRow) -> Result<TransferItem, StoreError> {
    let id: String = row.try_get("item_id")?;
    let status_s: String = row.try_get("status")?;
    let quality_s: String = row.try_get("quality")?;

    let status = ItemStatus::parse(&status_s).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        reason: format!("unknown status {status_s:?}"),
    })?;
    let quality = quality_s.parse::<Quality>().map_err(|reason| StoreError::Corrupt {
        id: id.clone(),
        reason,
    })?;

    let downloaded: i64 = row.try_get("bytes_downloaded")?;
    let total: i64 = row.try_get("bytes_total")?;

    Ok(TransferItem {
        status,
        quality,
        collection: row.try_get("collection")?,
        bytes_downloaded: downloaded.max(0) as u64,
        bytes_total: total.max(0) as u64,
        error: row.try_get("error")?,
        last_modified: row.try_get("last_modified")?,
        id,
    })
}
