use crate::core::error::BundleError;
use crate::core::model::{ArchiveRef, ItemId, Quality};
use sanitize_filename::sanitize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// File naming shared by individual saves and archive entries.
#[derive(Debug, Clone)]
pub struct Naming {
    pub collection: String,
    pub extension: String,
}

impl Naming {
    pub fn for_reciter(reciter: &str) -> Self {
        Self { collection: format!("quran-{}", reciter), extension: "mp3".to_string() }
    }

    /// Same rules, files named after another collection.
    pub fn for_collection(&self, collection: &str) -> Self {
        Self { collection: collection.to_string(), extension: self.extension.clone() }
    }

    /// `quran-alafasy-3-high.mp3`
    pub fn item_file_name(&self, id: &str, quality: Quality) -> String {
        sanitize(format!("{}-{}-{}.{}", self.collection, id, quality, self.extension))
    }

    /// `quran-alafasy-high-verses.zip`
    pub fn archive_name(&self, quality: Option<Quality>) -> String {
        let q = quality.map(|q| q.as_str()).unwrap_or("mixed");
        sanitize(format!("{}-{}-verses.zip", self.collection, q))
    }
}

pub struct BundleEntry {
    pub id: ItemId,
    pub quality: Quality,
    pub bytes: Vec<u8>,
}

pub trait ArchiveWriter {
    fn add(&mut self, name: &str, bytes: &[u8]) -> Result<(), BundleError>;
    fn finalize(self: Box<Self>) -> Result<PathBuf, BundleError>;
}

/// Zip written to `<path>.partial` and renamed into place by `finalize`.
pub struct ZipArchiveWriter {
    zip: ZipWriter<BufWriter<File>>,
    partial_path: PathBuf,
    path: PathBuf,
}

impl ZipArchiveWriter {
    pub fn create(path: &Path) -> Result<Self, BundleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial_path = partial_archive_path(path);
        let file = File::create(&partial_path)?;
        Ok(Self {
            zip: ZipWriter::new(BufWriter::new(file)),
            partial_path,
            path: path.to_path_buf(),
        })
    }
}

impl ArchiveWriter for ZipArchiveWriter {
    fn add(&mut self, name: &str, bytes: &[u8]) -> Result<(), BundleError> {
        let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        self.zip.start_file(name, opts)?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<PathBuf, BundleError> {
        let this = *self;
        let mut out = this.zip.finish()?;
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        std::fs::rename(&this.partial_path, &this.path)?;
        Ok(this.path)
    }
}

fn partial_archive_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

pub struct Bundler {
    naming: Naming,
    out_dir: PathBuf,
}

impl Bundler {
    pub fn new(naming: Naming, out_dir: PathBuf) -> Self {
        Self { naming, out_dir }
    }

    /// Packs every entry into one zip under `out_dir`. Call once, after the whole batch completed.
    pub fn bundle(&self, entries: Vec<BundleEntry>) -> Result<ArchiveRef, BundleError> {
        let quality = batch_quality(&entries);
        let path = self.out_dir.join(self.naming.archive_name(quality));

        let writer = Box::new(ZipArchiveWriter::create(&path)?);
        let result = self.bundle_with(writer, entries);
        if result.is_err() {
            let partial = partial_archive_path(&path);
            if let Err(e) = std::fs::remove_file(&partial) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %partial.display(), error = %e, "could not remove partial archive");
                }
            }
        }
        result
    }

    pub fn bundle_with(
        &self,
        mut writer: Box<dyn ArchiveWriter>,
        entries: Vec<BundleEntry>,
    ) -> Result<ArchiveRef, BundleError> {
        let mut names = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for e in &entries {
            let name = self.naming.item_file_name(&e.id, e.quality);
            if !seen.insert(name.clone()) {
                return Err(BundleError::DuplicateEntry(name));
            }
            names.push(name);
        }

        for (name, e) in names.iter().zip(&entries) {
            writer.add(name, &e.bytes)?;
        }
        let path = writer.finalize()?;
        tracing::info!(archive = %path.display(), entries = names.len(), "bundle written");
        Ok(ArchiveRef { path, entries: names })
    }
}

fn batch_quality(entries: &[BundleEntry]) -> Option<Quality> {
    let first = entries.first()?.quality;
    entries.iter().all(|e| e.quality == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    fn entry(id: &str, bytes: &[u8]) -> BundleEntry {
        BundleEntry { id: id.to_string(), quality: Quality::High, bytes: bytes.to_vec() }
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    impl ArchiveWriter for Recording {
        fn add(&mut self, name: &str, _bytes: &[u8]) -> Result<(), BundleError> {
            self.0.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn finalize(self: Box<Self>) -> Result<PathBuf, BundleError> {
            Ok(PathBuf::from("memory.zip"))
        }
    }

    #[test]
    fn names_are_derived_from_id_and_quality() {
        let n = Naming::for_reciter("alafasy");
        assert_eq!(n.item_file_name("3", Quality::High), "quran-alafasy-3-high.mp3");
        assert_eq!(n.archive_name(Some(Quality::Low)), "quran-alafasy-low-verses.zip");
        assert_eq!(n.archive_name(None), "quran-alafasy-mixed-verses.zip");
        assert_eq!(n.for_collection("quran-husary").item_file_name("3", Quality::Low), "quran-husary-3-low.mp3");
    }

    #[test]
    fn writes_entries_in_order() {
        let added = Arc::new(Mutex::new(Vec::new()));
        let b = Bundler::new(Naming::for_reciter("r"), PathBuf::from("."));
        let r = b
            .bundle_with(Box::new(Recording(added.clone())), vec![entry("1", b"a"), entry("2", b"b")])
            .unwrap();

        assert_eq!(*added.lock().unwrap(), vec!["quran-r-1-high.mp3", "quran-r-2-high.mp3"]);
        assert_eq!(r.entries.len(), 2);
    }

    #[test]
    fn duplicate_entries_are_rejected_before_writing() {
        let added = Arc::new(Mutex::new(Vec::new()));
        let b = Bundler::new(Naming::for_reciter("r"), PathBuf::from("."));
        let err = b
            .bundle_with(Box::new(Recording(added.clone())), vec![entry("1", b"a"), entry("1", b"b")])
            .unwrap_err();

        assert!(matches!(err, BundleError::DuplicateEntry(_)));
        assert!(added.lock().unwrap().is_empty());
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let b = Bundler::new(Naming::for_reciter("husary"), dir.path().to_path_buf());
        let r = b.bundle(vec![entry("1", b"first"), entry("2", b"second")]).unwrap();

        assert_eq!(r.path, dir.path().join("quran-husary-high-verses.zip"));
        assert!(!partial_archive_path(&r.path).exists());

        let mut zip = zip::ZipArchive::new(File::open(&r.path).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut s = String::new();
        zip.by_name("quran-husary-2-high.mp3").unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "second");
    }
}
