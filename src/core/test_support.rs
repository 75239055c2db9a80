//! Fakes for the collaborator traits, shared by worker and engine tests.

use crate::core::error::StoreError;
use crate::core::model::TransferItem;
use crate::core::store::ProgressStore;
use crate::plugins::http::resolver::TemplateResolver;
use crate::plugins::registry::{RangeFetcher, RangeResponse, ResourceResolver};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Clone)]
pub enum Behavior {
    /// Honors ranges, sends everything.
    Serve(Vec<u8>),
    /// Sends bytes up to the given offset, then errors.
    FailAfter(Vec<u8>, usize),
    /// Sends bytes up to the given offset, then never yields again.
    Stall(Vec<u8>, usize),
    /// Answers every request with the whole resource.
    IgnoreRange(Vec<u8>),
    /// Declares the full length but ends at the given offset.
    ShortBody(Vec<u8>, usize),
    /// Declares the given length but sends all of the data.
    LongBody(Vec<u8>, usize),
    Refuse,
    Panic,
}

struct Inflight {
    now: Arc<AtomicUsize>,
}

impl Inflight {
    fn enter(now: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        let n = now.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(n, Ordering::SeqCst);
        Self { now: now.clone() }
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeFetcher {
    chunk: usize,
    chunk_delay: Option<Duration>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    starts: Mutex<Vec<(String, u64)>>,
    inflight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub fn new(chunk: usize) -> Self {
        Self {
            chunk: chunk.max(1),
            chunk_delay: None,
            behaviors: Mutex::new(HashMap::new()),
            starts: Mutex::new(Vec::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(self, id: &str, b: Behavior) -> Self {
        self.set(id, b);
        self
    }

    pub fn with_chunk_delay(mut self, d: Duration) -> Self {
        self.chunk_delay = Some(d);
        self
    }

    pub fn set(&self, id: &str, b: Behavior) {
        self.behaviors.lock().unwrap().insert(id.to_string(), b);
    }

    pub fn starts(&self) -> Vec<(String, u64)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn peak_inflight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Resolver whose urls end in the item id, which is how the fake finds its behavior.
    pub fn resolver() -> Arc<dyn ResourceResolver> {
        Arc::new(TemplateResolver::new("http://fake.test/audio", "test").unwrap())
    }

    fn chunks(&self, data: &[u8]) -> Vec<anyhow::Result<Bytes>> {
        data.chunks(self.chunk).map(|c| Ok(Bytes::copy_from_slice(c))).collect()
    }
}

#[async_trait]
impl RangeFetcher for FakeFetcher {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(&self, url: &Url, start: u64) -> anyhow::Result<RangeResponse> {
        let id = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .unwrap_or_default()
            .to_string();
        self.starts.lock().unwrap().push((id.clone(), start));

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 for {id}"))?;

        let s = start as usize;
        let (chunks, declared_len, resumed, tail): (_, _, _, BoxStream<'static, anyhow::Result<Bytes>>) = match behavior {
            Behavior::Serve(data) => {
                anyhow::ensure!(s <= data.len(), "range past end");
                (self.chunks(&data[s..]), data.len() - s, true, stream::empty().boxed())
            }
            Behavior::FailAfter(data, n) => (
                self.chunks(&data[s.min(n)..n]),
                data.len() - s,
                true,
                stream::once(async { Err(anyhow::anyhow!("connection reset by peer")) }).boxed(),
            ),
            Behavior::Stall(data, n) => {
                (self.chunks(&data[s.min(n)..n]), data.len() - s, true, stream::pending().boxed())
            }
            Behavior::IgnoreRange(data) => (self.chunks(&data), data.len(), s == 0, stream::empty().boxed()),
            Behavior::ShortBody(data, n) => {
                (self.chunks(&data[s.min(n)..n]), data.len() - s, true, stream::empty().boxed())
            }
            Behavior::LongBody(data, declared) => {
                (self.chunks(&data[s.min(data.len())..]), declared.saturating_sub(s), true, stream::empty().boxed())
            }
            Behavior::Refuse => anyhow::bail!("connection refused"),
            Behavior::Panic => panic!("fetcher blew up on {id}"),
        };

        let guard = Inflight::enter(&self.inflight, &self.peak);
        let delay = self.chunk_delay;
        let body = stream::iter(chunks)
            .then(move |c| async move {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                c
            })
            .chain(tail)
            .map(move |c| {
                let _held = &guard;
                c
            })
            .boxed();

        Ok(RangeResponse { declared_len: Some(declared_len as u64), resumed, body })
    }
}

/// Lets `allowed` puts through, then fails every put.
pub struct FailingStore {
    inner: Arc<dyn ProgressStore>,
    allowed: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ProgressStore>, allowed: usize) -> Self {
        Self { inner, allowed: AtomicUsize::new(allowed) }
    }
}

#[async_trait]
impl ProgressStore for FailingStore {
    async fn put(&self, item: &TransferItem) -> Result<(), StoreError> {
        let ok = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !ok {
            return Err(StoreError::Io(sqlx::Error::PoolTimedOut));
        }
        self.inner.put(item).await
    }

    async fn put_all(&self, items: &[TransferItem]) -> Result<(), StoreError> {
        let ok = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(items.len()))
            .is_ok();
        if !ok {
            return Err(StoreError::Io(sqlx::Error::PoolTimedOut));
        }
        self.inner.put_all(items).await
    }

    async fn get(&self, id: &str) -> Result<Option<TransferItem>, StoreError> {
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_active(&self) -> Result<Vec<TransferItem>, StoreError> {
        self.inner.list_active().await
    }
}

/// Answers every `get` after a pause, leaving a window while a batch is being seeded.
pub struct SlowStore {
    inner: Arc<dyn ProgressStore>,
    delay: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<dyn ProgressStore>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ProgressStore for SlowStore {
    async fn put(&self, item: &TransferItem) -> Result<(), StoreError> {
        self.inner.put(item).await
    }

    async fn put_all(&self, items: &[TransferItem]) -> Result<(), StoreError> {
        self.inner.put_all(items).await
    }

    async fn get(&self, id: &str) -> Result<Option<TransferItem>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_active(&self) -> Result<Vec<TransferItem>, StoreError> {
        self.inner.list_active().await
    }
}
