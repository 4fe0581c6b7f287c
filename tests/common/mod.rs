#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use overlay_fs::backend::{BackendBinding, Protocol, Retriever, Sender};
use overlay_fs::error::FetchError;
use overlay_fs::overlay::{Overlay, SendPolicy};
use overlay_fs::path::PathKey;
use overlay_fs::store::{DirStore, LocalStore};
use overlay_fs::sync::FetchCoordinator;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// A scripted remote. Objects it holds are staged into the store on retrieve; every call is
/// recorded.
pub struct MockRetriever {
    store: Arc<dyn LocalStore>,
    objects: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, FetchError>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl MockRetriever {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            objects: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            gate: None,
        }
    }

    pub fn with_object(self, path: &str, content: &str) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_owned(), Bytes::copy_from_slice(content.as_bytes()));
        self
    }

    pub fn with_failure(self, path: &str, error: FetchError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(path.to_owned(), error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every retrieve blocks until the returned gate gets permits.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    async fn retrieve(&self, key: &PathKey) -> Result<(), FetchError> {
        self.calls.lock().unwrap().push(key.as_str().to_owned());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self.failures.lock().unwrap().get(key.as_str()).cloned();
        if let Some(err) = failure {
            return Err(err);
        }
        let object = self.objects.lock().unwrap().get(key.as_str()).cloned();
        match object {
            Some(data) => Ok(self.store.stage(key.as_str(), data).await?),
            None => Err(FetchError::not_found(key)),
        }
    }
}

/// Records every send together with the local content at send time.
pub struct RecordingSender {
    store: Arc<dyn LocalStore>,
    sent: Mutex<Vec<(String, Bytes)>>,
    fail: bool,
}

impl RecordingSender {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            sent: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing(store: Arc<dyn LocalStore>) -> Self {
        Self {
            fail: true,
            ..Self::new(store)
        }
    }

    pub fn sent(&self) -> Vec<(String, Bytes)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, key: &PathKey) -> Result<(), FetchError> {
        if self.fail {
            return Err(FetchError::transport(
                key,
                std::io::Error::other("remote rejected upload"),
            ));
        }
        let data = self.store.read_all(key.as_str()).await?;
        self.sent
            .lock()
            .unwrap()
            .push((key.as_str().to_owned(), data));
        Ok(())
    }
}

/// An overlay over a fresh directory store with scripted retriever and sender.
pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<dyn LocalStore>,
    pub retriever: Arc<MockRetriever>,
    pub sender: Arc<RecordingSender>,
    pub overlay: Overlay,
}

impl Fixture {
    pub async fn new(script: impl FnOnce(MockRetriever) -> MockRetriever) -> Self {
        Self::build(script, RecordingSender::new, SendPolicy::Sync).await
    }

    pub async fn build(
        script: impl FnOnce(MockRetriever) -> MockRetriever,
        sender: impl FnOnce(Arc<dyn LocalStore>) -> RecordingSender,
        policy: SendPolicy,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(&tmp).await;
        let retriever = Arc::new(script(MockRetriever::new(Arc::clone(&store))));
        let sender = Arc::new(sender(Arc::clone(&store)));
        let overlay = overlay_over(&store, &retriever, &sender, policy);
        Self {
            tmp,
            store,
            retriever,
            sender,
            overlay,
        }
    }

    /// Read a file straight from the store directory, bypassing the overlay.
    pub fn read_local(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.store.base_directory().join(path.trim_start_matches('/'))).ok()
    }
}

pub async fn open_store(tmp: &TempDir) -> Arc<dyn LocalStore> {
    Arc::new(DirStore::open(&tmp.path().join("store")).await.unwrap())
}

pub fn overlay_over(
    store: &Arc<dyn LocalStore>,
    retriever: &Arc<MockRetriever>,
    sender: &Arc<RecordingSender>,
    policy: SendPolicy,
) -> Overlay {
    let protocol = Protocol {
        retriever: Arc::clone(retriever) as Arc<dyn Retriever>,
        sender: Arc::clone(sender) as Arc<dyn Sender>,
    };
    let binding = BackendBinding::new(
        Arc::clone(store),
        Arc::new(FetchCoordinator::new(4)),
        protocol,
    );
    Overlay::new(binding, policy)
}

/// Poll `cond` until it holds, or panic after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Downcast an overlay I/O error back to the fetch failure it carries.
pub fn fetch_error(err: &std::io::Error) -> Option<&FetchError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<FetchError>())
}
