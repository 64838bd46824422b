//! Reference-counted model residency, one slot per [`Purpose`].
//!
//! A worker acquires a [`ModelLease`] while it uses a purpose. The first
//! lease loads the model; when the last lease goes away the model is
//! unloaded unless the purpose is pinned.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::provider::Purpose;

#[derive(Debug, thiserror::Error)]
pub enum ModelPoolError {
    #[error("failed to load {purpose} model: {message}")]
    Load { purpose: Purpose, message: String },
}

pub type Result<T> = std::result::Result<T, ModelPoolError>;

/// Loads and unloads the model behind a purpose.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, purpose: Purpose) -> Result<()>;
    async fn unload(&self, purpose: Purpose);
}

/// Loader for backends that manage residency themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLoader;

#[async_trait]
impl ModelLoader for NoopLoader {
    async fn load(&self, _purpose: Purpose) -> Result<()> {
        Ok(())
    }

    async fn unload(&self, _purpose: Purpose) {}
}

#[derive(Debug, Default)]
struct Slot {
    users: usize,
    loaded: bool,
}

struct PoolInner {
    loader: Arc<dyn ModelLoader>,
    slots: DashMap<Purpose, Arc<Mutex<Slot>>>,
    pinned: HashSet<Purpose>,
}

impl PoolInner {
    fn slot(&self, purpose: Purpose) -> Arc<Mutex<Slot>> {
        self.slots.entry(purpose).or_default().clone()
    }

    async fn release(&self, purpose: Purpose) {
        let slot = self.slot(purpose);
        let mut slot = slot.lock().await;
        slot.users = slot.users.saturating_sub(1);
        debug!(purpose = %purpose, users = slot.users, "model lease released");
        if slot.users == 0 && slot.loaded && !self.pinned.contains(&purpose) {
            self.loader.unload(purpose).await;
            slot.loaded = false;
            info!(purpose = %purpose, "model unloaded");
        }
    }
}

/// Shared, cheaply cloneable model pool.
#[derive(Clone)]
pub struct ModelPool {
    inner: Arc<PoolInner>,
}

impl ModelPool {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                loader,
                slots: DashMap::new(),
                pinned: HashSet::new(),
            }),
        }
    }

    /// Keep these purposes resident once loaded. Call before sharing the pool.
    pub fn with_pinned(loader: Arc<dyn ModelLoader>, pinned: impl IntoIterator<Item = Purpose>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                loader,
                slots: DashMap::new(),
                pinned: pinned.into_iter().collect(),
            }),
        }
    }

    /// Take a lease on `purpose`, loading its model if nobody holds one.
    pub async fn acquire(&self, purpose: Purpose) -> Result<ModelLease> {
        let slot = self.inner.slot(purpose);
        let mut slot = slot.lock().await;
        if !slot.loaded {
            self.inner.loader.load(purpose).await?;
            slot.loaded = true;
            info!(purpose = %purpose, "model loaded");
        }
        slot.users += 1;
        debug!(purpose = %purpose, users = slot.users, "model lease acquired");
        Ok(ModelLease {
            pool: Arc::clone(&self.inner),
            purpose,
            released: false,
        })
    }

    pub async fn ref_count(&self, purpose: Purpose) -> usize {
        self.inner.slot(purpose).lock().await.users
    }

    pub async fn is_loaded(&self, purpose: Purpose) -> bool {
        self.inner.slot(purpose).lock().await.loaded
    }

    pub fn is_pinned(&self, purpose: Purpose) -> bool {
        self.inner.pinned.contains(&purpose)
    }
}

/// Held while a purpose is in use. Dropping it releases the reference on a
/// background task; [`release`](ModelLease::release) does it inline.
pub struct ModelLease {
    pool: Arc<PoolInner>,
    purpose: Purpose,
    released: bool,
}

impl ModelLease {
    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub async fn release(mut self) {
        self.released = true;
        self.pool.release(self.purpose).await;
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = Arc::clone(&self.pool);
        let purpose = self.purpose;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(purpose).await });
            }
            Err(_) => warn!(purpose = %purpose, "model lease dropped outside a runtime; not released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingLoader {
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelLoader for RecordingLoader {
        async fn load(&self, purpose: Purpose) -> Result<()> {
            self.events.lock().unwrap().push(format!("load {purpose}"));
            Ok(())
        }

        async fn unload(&self, purpose: Purpose) {
            self.events.lock().unwrap().push(format!("unload {purpose}"));
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl ModelLoader for FailingLoader {
        async fn load(&self, purpose: Purpose) -> Result<()> {
            Err(ModelPoolError::Load {
                purpose,
                message: "out of memory".into(),
            })
        }

        async fn unload(&self, _purpose: Purpose) {}
    }

    #[tokio::test]
    async fn loads_once_and_unloads_at_zero() {
        let loader = Arc::new(RecordingLoader::default());
        let pool = ModelPool::new(loader.clone());

        let a = pool.acquire(Purpose::Code).await.unwrap();
        let b = pool.acquire(Purpose::Code).await.unwrap();
        assert_eq!(pool.ref_count(Purpose::Code).await, 2);

        a.release().await;
        assert!(pool.is_loaded(Purpose::Code).await);
        b.release().await;
        assert!(!pool.is_loaded(Purpose::Code).await);

        assert_eq!(
            *loader.events.lock().unwrap(),
            vec!["load code".to_string(), "unload code".to_string()]
        );
    }

    #[tokio::test]
    async fn pinned_purpose_stays_resident() {
        let loader = Arc::new(RecordingLoader::default());
        let pool = ModelPool::with_pinned(loader.clone(), [Purpose::Chat]);

        pool.acquire(Purpose::Chat).await.unwrap().release().await;
        assert!(pool.is_loaded(Purpose::Chat).await);
        assert_eq!(pool.ref_count(Purpose::Chat).await, 0);
        assert_eq!(loader.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_is_released() {
        let pool = ModelPool::new(Arc::new(NoopLoader));
        {
            let _lease = pool.acquire(Purpose::Analysis).await.unwrap();
        }
        for _ in 0..50 {
            if pool.ref_count(Purpose::Analysis).await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.ref_count(Purpose::Analysis).await, 0);
    }

    #[tokio::test]
    async fn load_failure_takes_no_reference() {
        let pool = ModelPool::new(Arc::new(FailingLoader));
        assert!(pool.acquire(Purpose::Code).await.is_err());
        assert_eq!(pool.ref_count(Purpose::Code).await, 0);
    }
}
