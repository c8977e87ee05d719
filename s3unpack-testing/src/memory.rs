//! An in-memory implementation of [`s3unpack::Bucket`] that records what was uploaded and how,
//! so tests can check the behavior of the upload pipeline without any object storage.
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use s3unpack::{Bucket, PutObjectOutput, PutObjectRequest, S3UnpackError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::debug;

/// An object as it was stored by [`MemoryBucket`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub size_hint: Option<u64>,
    pub content_type: Option<String>,
    pub tagging: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Clone)]
pub struct MemoryBucket {
    inner: Arc<MemoryBucketInner>,
}

struct MemoryBucketInner {
    name: String,
    delay: Duration,
    fail_keys: HashSet<String>,

    /// Uploads wait for a permit until the gate is opened.  Opening closes the semaphore, which
    /// makes every waiting and future acquire return immediately.
    gate: Option<Semaphore>,

    objects: Mutex<HashMap<String, StoredObject>>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    changed: Notify,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryBucketBuilder::new(name).build()
    }

    pub fn builder(name: impl Into<String>) -> MemoryBucketBuilder {
        MemoryBucketBuilder::new(name)
    }

    /// Let all gated uploads proceed
    pub fn open_gate(&self) {
        if let Some(gate) = &self.inner.gate {
            debug!(bucket = %self.inner.name, "Opening upload gate");
            gate.close();
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.inner.objects.lock().unwrap().get(key).cloned()
    }

    pub fn objects(&self) -> HashMap<String, StoredObject> {
        self.inner.objects.lock().unwrap().clone()
    }

    /// Keys of all stored objects, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .inner
            .objects
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Keys in the order their uploads started
    pub fn uploads_started(&self) -> Vec<String> {
        self.inner.started.lock().unwrap().clone()
    }

    /// Number of uploads running right now
    pub fn active_uploads(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// The most uploads that were ever running at the same time
    pub fn max_concurrent_uploads(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` objects have been stored
    pub async fn wait_for_objects(&self, count: usize) {
        loop {
            // Created before checking so a store in between isn't missed
            let changed = self.inner.changed.notified();

            if self.inner.objects.lock().unwrap().len() >= count {
                return;
            }

            changed.await;
        }
    }

    /// Wait until at least `count` uploads have started
    pub async fn wait_for_uploads_started(&self, count: usize) {
        loop {
            let changed = self.inner.changed.notified();

            if self.inner.started.lock().unwrap().len() >= count {
                return;
            }

            changed.await;
        }
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.inner.name)
            .field("objects", &self.inner.objects.lock().unwrap().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn put_object(&self, request: PutObjectRequest) -> s3unpack::Result<PutObjectOutput> {
        let PutObjectRequest {
            key,
            mut body,
            size_hint,
            content_type,
            tagging,
            metadata,
        } = request;

        self.inner.started.lock().unwrap().push(key.clone());
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        self.inner.changed.notify_waiters();

        debug!(%key, active, "Memory upload starting");

        if let Some(gate) = &self.inner.gate {
            // Fails only once the gate is open, which is the point
            let _ = gate.acquire().await;
        }

        if !self.inner.delay.is_zero() {
            tokio::time::sleep(self.inner.delay).await;
        }

        let mut data = BytesMut::new();
        let mut read_error = None;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }
        drop(body);

        self.inner.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = read_error {
            debug!(%key, err = ?e, "Memory upload failed reading entry data");
            return Err(e);
        }

        if self.inner.fail_keys.contains(&key) {
            debug!(%key, "Memory upload rejecting key");
            return Err(S3UnpackError::StorageBackend {
                bucket: self.inner.name.clone(),
                key,
                source: "injected upload failure".into(),
            });
        }

        let bytes = data.len() as u64;
        self.inner.objects.lock().unwrap().insert(
            key.clone(),
            StoredObject {
                data: data.freeze(),
                size_hint,
                content_type,
                tagging,
                metadata,
            },
        );
        self.inner.changed.notify_waiters();

        debug!(%key, bytes, "Memory upload stored object");

        Ok(PutObjectOutput { key, bytes })
    }
}

pub struct MemoryBucketBuilder {
    name: String,
    delay: Duration,
    fail_keys: HashSet<String>,
    gated: bool,
}

impl MemoryBucketBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            fail_keys: HashSet::new(),
            gated: false,
        }
    }

    /// Every upload takes at least this long
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The upload of `key` fails, after its data has been read
    pub fn fail_key(mut self, key: impl Into<String>) -> Self {
        self.fail_keys.insert(key.into());
        self
    }

    /// Uploads don't progress past their start until [`MemoryBucket::open_gate`] is called
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn build(self) -> MemoryBucket {
        MemoryBucket {
            inner: Arc::new(MemoryBucketInner {
                name: self.name,
                delay: self.delay,
                fail_keys: self.fail_keys,
                gate: self.gated.then(|| Semaphore::new(0)),
                objects: Mutex::new(HashMap::new()),
                started: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                changed: Notify::new(),
            }),
        }
    }
}
