use anyhow::Context;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Partial file for one item; bytes land at `<target>.partial` and are renamed on completion.
pub struct Assembler {
    file: tokio::sync::Mutex<File>,
    partial_path: PathBuf,
}

impl Assembler {
    pub fn partial_path_for(target: &Path) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        target.with_file_name(name)
    }

    pub async fn open(target: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial_path = Self::partial_path_for(target);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&partial_path)
            .await
            .with_context(|| format!("open {:?}", partial_path))?;

        Ok(Self { file: tokio::sync::Mutex::new(file), partial_path })
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    /// Brings the file in line with the durable offset and returns the offset to resume from.
    ///
    /// Bytes past `persisted` were never acknowledged and are dropped. A file
    /// shorter than `persisted` lost data outside our control; resume from what is there.
    pub async fn reconcile(&self, persisted: u64) -> anyhow::Result<u64> {
        let f = self.file.lock().await;
        let on_disk = f.metadata().await?.len();
        let resume_at = persisted.min(on_disk);
        if on_disk != resume_at {
            f.set_len(resume_at).await?;
        }
        Ok(resume_at)
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        let mut f = self.file.lock().await;
        f.flush().await?;
        Ok(())
    }

    /// Flushes and moves the partial file onto `target`; rename replaces any previous file.
    pub async fn finish(self, target: &Path) -> anyhow::Result<()> {
        {
            let mut f = self.file.lock().await;
            f.flush().await?;
            f.sync_all().await?;
        }
        drop(self.file);

        tokio::fs::rename(&self.partial_path, target)
            .await
            .with_context(|| format!("rename {:?} -> {:?}", self.partial_path, target))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconcile_truncates_unacknowledged_tail() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.mp3");

        let asm = Assembler::open(&target).await.unwrap();
        asm.write_at(0, &[1u8; 100]).await.unwrap();
        asm.flush().await.unwrap();

        assert_eq!(asm.reconcile(60).await.unwrap(), 60);
        assert_eq!(tokio::fs::metadata(asm.partial_path()).await.unwrap().len(), 60);
    }

    #[tokio::test]
    async fn reconcile_falls_back_to_what_is_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("b.mp3");

        let asm = Assembler::open(&target).await.unwrap();
        asm.write_at(0, &[7u8; 10]).await.unwrap();
        asm.flush().await.unwrap();

        assert_eq!(asm.reconcile(4096).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn finish_renames_partial_onto_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("c.mp3");
        tokio::fs::write(&target, b"stale").await.unwrap();

        let asm = Assembler::open(&target).await.unwrap();
        let partial = asm.partial_path().to_path_buf();
        asm.write_at(0, b"hello").await.unwrap();
        asm.write_at(5, b" world").await.unwrap();
        asm.finish(&target).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello world");
        assert!(tokio::fs::metadata(&partial).await.is_err());
    }
}
