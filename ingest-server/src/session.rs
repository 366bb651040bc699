//! Per-image session: the bound store, the remaining-client countdown and activity timestamps.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use ingest_core::{ImageSpec, ImageStore, StoreError};

pub struct Session {
    image_name: String,
    store: Mutex<Box<dyn ImageStore>>,
    remaining_clients: AtomicI64,
    created: Instant,
    /// Milliseconds after `created` of the last message for this image.
    last_active_ms: AtomicU64,
    closed: AtomicBool,
}

impl Session {
    pub fn new(spec: &ImageSpec, store: Box<dyn ImageStore>) -> Self {
        Self {
            image_name: spec.image_name.clone(),
            store: Mutex::new(store),
            remaining_clients: AtomicI64::new(spec.client_count as i64),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> Instant {
        self.created + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn remaining_clients(&self) -> i64 {
        self.remaining_clients.load(Ordering::Acquire)
    }

    /// Count down one finished client. True exactly once: for the call that reaches zero.
    pub fn client_finished(&self) -> bool {
        self.remaining_clients.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Write `buf[..len]` at `byte_offset`. The store call runs on the blocking pool; the buffer
    /// is handed back for the next chunk.
    pub async fn write_region(
        self: &Arc<Self>,
        byte_offset: u64,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<Vec<u8>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let session = Arc::clone(self);
        run_blocking(move || {
            session.lock_store().write_region(byte_offset, &buf[..len])?;
            Ok(buf)
        })
        .await
    }

    pub async fn append_header_line(self: &Arc<Self>, line: String) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let session = Arc::clone(self);
        run_blocking(move || session.lock_store().append_header_line(&line)).await
    }

    /// Close the store. Only the first call reaches the store; later calls return `None`.
    pub async fn close(self: &Arc<Self>) -> Option<Result<(), StoreError>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let session = Arc::clone(self);
        Some(run_blocking(move || session.lock_store().close()).await)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, Box<dyn ImageStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a store operation on the blocking pool so file I/O never stalls a runtime worker.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("image_name", &self.image_name)
            .field("remaining_clients", &self.remaining_clients())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::memory::MemoryStoreFactory;
    use ingest_core::StoreFactory;

    fn session(clients: u32) -> (Arc<Session>, MemoryStoreFactory) {
        let factory = MemoryStoreFactory::new();
        let spec = ImageSpec {
            image_name: "img".into(),
            width: 4,
            height: 4,
            header_count: 0,
            client_count: clients,
        };
        let store = factory.open(&spec).unwrap();
        (Arc::new(Session::new(&spec, store)), factory)
    }

    #[test]
    fn countdown_hits_zero_once() {
        let (s, _) = session(3);
        assert!(!s.client_finished());
        assert!(!s.client_finished());
        assert!(s.client_finished());
        assert!(!s.client_finished());
        assert_eq!(s.remaining_clients(), -1);
    }

    #[test]
    fn zero_clients_never_completes() {
        let (s, _) = session(0);
        assert!(!s.client_finished());
    }

    #[tokio::test]
    async fn write_returns_buffer_for_reuse() {
        let (s, factory) = session(1);
        let buf = s.write_region(8, vec![5, 6, 7, 8, 0, 0], 4).await.unwrap();
        assert_eq!(buf.len(), 6);
        let img = factory.latest("img").unwrap();
        assert_eq!(&img.canvas[8..12], &[5, 6, 7, 8]);
        assert_eq!(img.bytes_received, 4);
    }

    #[tokio::test]
    async fn close_reaches_store_once() {
        let (s, factory) = session(1);
        assert!(matches!(s.close().await, Some(Ok(()))));
        assert!(s.close().await.is_none());
        assert_eq!(factory.latest("img").unwrap().close_count, 1);
        assert!(matches!(
            s.write_region(0, vec![0; 4], 4).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            s.append_header_line("A = 1".into()).await,
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn touch_advances_last_active() {
        let (s, _) = session(1);
        let before = s.last_active();
        std::thread::sleep(Duration::from_millis(5));
        s.touch();
        assert!(s.last_active() > before);
        assert!(s.idle_for(s.last_active()) == Duration::ZERO);
    }
}
