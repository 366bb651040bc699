//! Ingest coordinator: creates sessions on START, routes DATA/HEADER/END to them, finalizes a
//! session when its last client ends, and reclaims sessions that go idle.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use ingest_core::{ImageSpec, Message, Registry, StoreFactory, BYTES_PER_PIXEL};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::session::{run_blocking, Session};

/// Payload bytes are moved from the connection to the store in pieces of at most this size.
pub const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// How long a DATA/HEADER/END frame waits for its image's START.
    pub start_wait: Duration,
    /// Sessions with no traffic for longer than this are force-closed.
    pub idle_timeout: Duration,
    /// Period of the idle sweep.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            start_wait: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Shared by every connection.
pub struct Coordinator {
    factory: Arc<dyn StoreFactory>,
    sessions: Registry<String, Arc<Session>>,
    options: CoordinatorOptions,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Coordinator {
    /// Create the coordinator and start its idle sweep. Must be called inside a tokio runtime.
    pub fn start(factory: Arc<dyn StoreFactory>, options: CoordinatorOptions) -> Arc<Self> {
        let sweep_interval = options.sweep_interval;
        let coordinator = Arc::new(Self {
            factory,
            sessions: Registry::new(),
            options,
            reaper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        });
        let task = tokio::spawn(run_reaper(Arc::downgrade(&coordinator), sweep_interval));
        *coordinator.lock_reaper() = Some(task);
        coordinator
    }

    /// Handle one decoded message. DATA payload bytes are read from `stream`, which must be
    /// positioned right after the frame; on return exactly `data_length` bytes have been consumed.
    pub async fn handle_message<R>(&self, msg: Message, stream: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let name = msg.image_name().to_owned();
        let session = match msg {
            Message::Start {
                image_name,
                width,
                height,
                header_count,
                client_count,
            } => {
                return self
                    .start_session(ImageSpec {
                        image_name,
                        width,
                        height,
                        header_count,
                        client_count,
                    })
                    .await
            }
            _ => self.sessions.get(&name, self.options.start_wait).await,
        };
        let Some(session) = session else {
            warn!(image = %name, kind = ?msg.message_type(), "no session for image, discarding");
            if let Message::Data { data_length, .. } = msg {
                discard_payload(stream, data_length as u64).await?;
            }
            return Ok(());
        };
        session.touch();

        match msg {
            Message::Data {
                offset,
                stride_length,
                stride_spacing,
                data_length,
                ..
            } => {
                let region = Region {
                    byte_offset: BYTES_PER_PIXEL * offset as u64,
                    stride_bytes: BYTES_PER_PIXEL * stride_length as u64,
                    spacing_bytes: BYTES_PER_PIXEL * stride_spacing as u64,
                    data_length: data_length as u64,
                };
                write_region(&session, region, stream).await?;
                session.touch();
            }
            Message::Header { line, .. } => session.append_header_line(line).await?,
            Message::End { .. } => {
                if session.client_finished() {
                    self.finish(&session).await;
                }
            }
            Message::Start { .. } => {}
        }
        Ok(())
    }

    async fn start_session(&self, spec: ImageSpec) -> Result<()> {
        if self.is_shutting_down() {
            warn!(image = %spec.image_name, "START during shutdown, ignoring");
            return Ok(());
        }
        let factory = Arc::clone(&self.factory);
        let open_spec = spec.clone();
        let store = run_blocking(move || factory.open(&open_spec)).await?;
        let session = Arc::new(Session::new(&spec, store));
        info!(
            image = %spec.image_name,
            width = spec.width,
            height = spec.height,
            clients = spec.client_count,
            "session started"
        );
        if let Some(prev) = self.sessions.put(spec.image_name.clone(), session.clone()) {
            // The replaced store is not closed.
            warn!(
                image = %spec.image_name,
                remaining_clients = prev.remaining_clients(),
                "START for an open image replaced its session"
            );
        }
        // Shutdown may have taken its snapshot while the store was being opened.
        if self.is_shutting_down() {
            self.sessions
                .remove_if(&spec.image_name, |s| Arc::ptr_eq(s, &session));
            if close_quietly(&session).await {
                info!(image = %spec.image_name, "closed session started during shutdown");
            }
        }
        Ok(())
    }

    /// Remove a session whose last client has ended and close its store.
    async fn finish(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(&session.image_name().to_owned(), |s| Arc::ptr_eq(s, session));
        match session.close().await {
            Some(Ok(())) => info!(
                image = %session.image_name(),
                elapsed_ms = session.created().elapsed().as_millis() as u64,
                "session complete"
            ),
            Some(Err(e)) => error!(image = %session.image_name(), error = %e, "closing store failed"),
            None => debug!(image = %session.image_name(), "session already closed"),
        }
    }

    /// Force-close every session idle for longer than the configured threshold.
    /// Returns how many stores this call closed.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for (name, session) in self.sessions.snapshot() {
            if session.idle_for(now) <= self.options.idle_timeout {
                continue;
            }
            warn!(
                image = %name,
                remaining_clients = session.remaining_clients(),
                "closing idle session"
            );
            self.sessions.remove_if(&name, |s| Arc::ptr_eq(s, &session));
            if close_quietly(&session).await {
                reaped += 1;
            }
        }
        reaped
    }

    /// Stop the idle sweep and close every open session. Sessions started after this point are
    /// closed as soon as they are published.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let reaper = self.lock_reaper().take();
        if let Some(task) = reaper {
            task.abort();
        }
        for (name, session) in self.sessions.snapshot() {
            self.sessions.remove_if(&name, |s| Arc::ptr_eq(s, &session));
            if close_quietly(&session).await {
                info!(image = %name, "closed open session at shutdown");
            }
        }
    }

    /// Names of the images with a resolved session.
    pub fn open_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.snapshot().into_iter().map(|(k, _)| k).collect();
        names.sort();
        names
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn lock_reaper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self.lock_reaper().take() {
            task.abort();
        }
    }
}

/// Best-effort close. True if this call closed the store.
async fn close_quietly(session: &Arc<Session>) -> bool {
    match session.close().await {
        Some(Ok(())) => true,
        Some(Err(e)) => {
            warn!(image = %session.image_name(), error = %e, "error closing store");
            true
        }
        None => false,
    }
}

async fn run_reaper(coordinator: Weak<Coordinator>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.reap_idle().await;
    }
}

/// Destination of one DATA payload, in bytes.
#[derive(Debug, Clone, Copy)]
struct Region {
    byte_offset: u64,
    stride_bytes: u64,
    spacing_bytes: u64,
    data_length: u64,
}

/// Move `data_length` bytes from `stream` into the session's store. With a zero stride length
/// the bytes are contiguous; otherwise chunks of `stride_bytes` land `spacing_bytes` apart.
async fn write_region<R>(session: &Arc<Session>, region: Region, stream: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK.min(region.data_length as usize)];
    if region.stride_bytes == 0 {
        copy_to_store(session, stream, region.byte_offset, region.data_length, buf).await?;
        return Ok(());
    }
    let mut position = region.byte_offset;
    let mut remaining = region.data_length;
    while remaining > 0 {
        let n = region.stride_bytes.min(remaining);
        buf = copy_to_store(session, stream, position, n, buf).await?;
        position += region.spacing_bytes;
        remaining -= n;
    }
    Ok(())
}

/// Copy `len` bytes to `position` through `buf`, one buffer-full per store call. Returns the
/// buffer for reuse.
async fn copy_to_store<R>(
    session: &Arc<Session>,
    stream: &mut R,
    mut position: u64,
    mut len: u64,
    mut buf: Vec<u8>,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    while len > 0 {
        let want = len.min(buf.len() as u64) as usize;
        stream.read_exact(&mut buf[..want]).await?;
        buf = session.write_region(position, buf, want).await?;
        position += want as u64;
        len -= want as u64;
    }
    Ok(buf)
}

/// Read and drop `len` payload bytes so the next frame starts where it should.
async fn discard_payload<R>(stream: &mut R, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let copied = tokio::io::copy(&mut (&mut *stream).take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended inside discarded DATA payload",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::memory::MemoryStoreFactory;
    use ingest_core::StoreError;

    use crate::error::IngestError;

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            start_wait: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn start(name: &str, width: u32, height: u32, clients: u32) -> Message {
        Message::Start {
            image_name: name.into(),
            width,
            height,
            header_count: 4,
            client_count: clients,
        }
    }

    fn data(name: &str, offset: u32, stride_length: u32, stride_spacing: u32, len: usize) -> Message {
        Message::Data {
            image_name: name.into(),
            offset,
            stride_length,
            stride_spacing,
            data_length: len as u32,
        }
    }

    fn end(name: &str) -> Message {
        Message::End {
            image_name: name.into(),
        }
    }

    fn setup() -> (Arc<Coordinator>, MemoryStoreFactory) {
        let factory = MemoryStoreFactory::new();
        let coordinator = Coordinator::start(Arc::new(factory.clone()), options());
        (coordinator, factory)
    }

    async fn send(c: &Coordinator, msg: Message) {
        let mut empty: &[u8] = &[];
        c.handle_message(msg, &mut empty).await.unwrap();
    }

    #[tokio::test]
    async fn contiguous_write_at_pixel_offset() {
        let (c, factory) = setup();
        send(&c, start("img", 4, 4, 1)).await;
        let payload: Vec<u8> = (1..=8).collect();
        let mut stream: &[u8] = &payload;
        c.handle_message(data("img", 2, 0, 0, 8), &mut stream).await.unwrap();
        assert!(stream.is_empty());
        let img = factory.latest("img").unwrap();
        assert_eq!(&img.canvas[8..16], payload.as_slice());
        assert_eq!(img.bytes_received, 8);
    }

    #[tokio::test]
    async fn strided_write_places_chunks_apart() {
        let (c, factory) = setup();
        send(&c, start("img", 5, 3, 1)).await;
        // 3 chunks of 2 pixels, 5 pixels apart, starting at pixel 1.
        let payload: Vec<u8> = (0..24).collect();
        let mut stream: &[u8] = &payload;
        c.handle_message(data("img", 1, 2, 5, 24), &mut stream).await.unwrap();
        assert!(stream.is_empty());
        let img = factory.latest("img").unwrap();
        assert_eq!(&img.canvas[4..12], &payload[0..8]);
        assert_eq!(&img.canvas[24..32], &payload[8..16]);
        assert_eq!(&img.canvas[44..52], &payload[16..24]);
        assert_eq!(&img.canvas[12..24], &[0u8; 12]);
        assert_eq!(img.bytes_received, 24);
    }

    #[tokio::test]
    async fn short_last_stride_keeps_stream_aligned() {
        let (c, factory) = setup();
        send(&c, start("img", 8, 2, 1)).await;
        // 12 bytes with 8-byte strides: one full chunk and one of 4 bytes.
        let mut buf: Vec<u8> = vec![7; 12];
        buf.extend_from_slice(b"next");
        let mut stream: &[u8] = &buf;
        c.handle_message(data("img", 0, 2, 8, 12), &mut stream).await.unwrap();
        assert_eq!(stream, b"next");
        let img = factory.latest("img").unwrap();
        assert_eq!(&img.canvas[32..36], &[7u8; 4]);
    }

    #[tokio::test]
    async fn strided_write_larger_than_copy_chunk() {
        let (c, factory) = setup();
        // Three strides of 20_000 pixels (80_000 bytes each, more than one copy buffer),
        // 25_000 pixels apart.
        let width = 25_000u32;
        send(&c, start("img", width, 3, 1)).await;
        let stride = 80_000usize;
        let payload: Vec<u8> = (0..3 * stride).map(|i| (i % 253) as u8).collect();
        let mut buf = payload.clone();
        buf.extend_from_slice(b"next");
        let mut stream: &[u8] = &buf;
        c.handle_message(data("img", 100, 20_000, width, payload.len()), &mut stream)
            .await
            .unwrap();
        assert_eq!(stream, b"next");

        let img = factory.latest("img").unwrap();
        assert_eq!(img.bytes_received, payload.len() as u64);
        let row_bytes = 4 * width as usize;
        for row in 0..3 {
            let dst = 400 + row * row_bytes;
            assert_eq!(
                &img.canvas[dst..dst + stride],
                &payload[row * stride..(row + 1) * stride],
                "row {row}"
            );
        }
        assert!(img.canvas[400 + stride..400 + row_bytes].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn short_payload_stream_fails_write() {
        let (c, _) = setup();
        send(&c, start("img", 4, 4, 1)).await;
        let mut stream: &[u8] = &[1u8; 10];
        let err = c
            .handle_message(data("img", 0, 0, 0, 64), &mut stream)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn orphaned_data_is_drained() {
        let (c, factory) = setup();
        let mut buf = vec![1u8; 40_000];
        buf.extend_from_slice(b"tail");
        let mut stream: &[u8] = &buf;
        c.handle_message(data("ghost", 0, 0, 0, 40_000), &mut stream)
            .await
            .unwrap();
        assert_eq!(stream, b"tail");
        assert!(factory.images("ghost").is_empty());
        assert!(c.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn orphaned_data_with_short_stream_fails() {
        let (c, _) = setup();
        let mut stream: &[u8] = &[0u8; 10];
        let err = c
            .handle_message(data("ghost", 0, 0, 0, 100), &mut stream)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn orphaned_header_and_end_are_dropped() {
        let (c, factory) = setup();
        send(
            &c,
            Message::Header {
                image_name: "ghost".into(),
                line: "A = 1".into(),
            },
        )
        .await;
        send(&c, end("ghost")).await;
        assert!(factory.images("ghost").is_empty());
    }

    #[tokio::test]
    async fn headers_appended_in_order() {
        let (c, factory) = setup();
        send(&c, start("img", 1, 1, 1)).await;
        for line in ["A = 1", "B = 2"] {
            send(
                &c,
                Message::Header {
                    image_name: "img".into(),
                    line: line.into(),
                },
            )
            .await;
        }
        send(&c, end("img")).await;
        let img = factory.latest("img").unwrap();
        assert_eq!(img.header_lines, vec!["A = 1", "B = 2"]);
        assert_eq!(img.close_count, 1);
    }

    #[tokio::test]
    async fn completes_after_last_end_only() {
        let (c, factory) = setup();
        send(&c, start("img", 1, 1, 3)).await;
        send(&c, end("img")).await;
        send(&c, end("img")).await;
        assert_eq!(factory.latest("img").unwrap().close_count, 0);
        assert_eq!(c.open_sessions(), vec!["img".to_string()]);
        send(&c, end("img")).await;
        assert_eq!(factory.latest("img").unwrap().close_count, 1);
        assert!(c.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn second_start_replaces_without_closing() {
        let (c, factory) = setup();
        send(&c, start("img", 2, 2, 1)).await;
        send(&c, start("img", 3, 3, 1)).await;
        send(&c, end("img")).await;
        let images = factory.images("img");
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].close_count, 0);
        assert_eq!(images[1].close_count, 1);
        assert_eq!(images[1].spec.as_ref().unwrap().width, 3);
    }

    #[tokio::test]
    async fn reap_idle_closes_once() {
        let factory = MemoryStoreFactory::new();
        let c = Coordinator::start(
            Arc::new(factory.clone()),
            CoordinatorOptions {
                idle_timeout: Duration::from_millis(20),
                ..options()
            },
        );
        send(&c, start("img", 1, 1, 2)).await;
        send(&c, end("img")).await;
        assert_eq!(c.reap_idle().await, 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(c.reap_idle().await, 1);
        assert_eq!(c.reap_idle().await, 0);
        assert_eq!(factory.latest("img").unwrap().close_count, 1);
        // A late END finds no session and is dropped.
        send(&c, end("img")).await;
        assert_eq!(factory.latest("img").unwrap().close_count, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (c, factory) = setup();
        send(&c, start("a", 1, 1, 1)).await;
        send(&c, start("b", 1, 1, 2)).await;
        c.shutdown().await;
        assert_eq!(factory.latest("a").unwrap().close_count, 1);
        assert_eq!(factory.latest("b").unwrap().close_count, 1);
        assert!(c.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn start_after_shutdown_opens_nothing() {
        let (c, factory) = setup();
        c.shutdown().await;
        send(&c, start("img", 1, 1, 1)).await;
        assert!(factory.images("img").is_empty());
        assert!(c.open_sessions().is_empty());
    }

    /// Holds `open` until released, reporting when it has been entered.
    struct GatedFactory {
        inner: MemoryStoreFactory,
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl StoreFactory for GatedFactory {
        fn open(
            &self,
            spec: &ImageSpec,
        ) -> std::result::Result<Box<dyn ingest_core::ImageStore>, StoreError> {
            let _ = self.entered.send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.open(spec)
        }
    }

    #[tokio::test]
    async fn start_racing_shutdown_is_closed() {
        let factory = MemoryStoreFactory::new();
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let c = Coordinator::start(
            Arc::new(GatedFactory {
                inner: factory.clone(),
                entered: entered_tx,
                release: Mutex::new(release_rx),
            }),
            options(),
        );
        let starting = {
            let c = c.clone();
            tokio::spawn(async move {
                let mut empty: &[u8] = &[];
                c.handle_message(start("img", 1, 1, 1), &mut empty).await
            })
        };
        entered_rx.recv().await.unwrap();
        c.shutdown().await;
        release_tx.send(()).unwrap();
        starting.await.unwrap().unwrap();

        assert_eq!(factory.latest("img").unwrap().close_count, 1);
        assert!(c.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn write_to_closed_session_fails() {
        let (c, _) = setup();
        send(&c, start("img", 2, 2, 1)).await;
        let session = c.sessions.get(&"img".to_string(), Duration::ZERO).await.unwrap();
        c.shutdown().await;
        let mut stream: &[u8] = &[0u8; 4];
        let region = Region {
            byte_offset: 0,
            stride_bytes: 0,
            spacing_bytes: 0,
            data_length: 4,
        };
        let err = write_region(&session, region, &mut stream).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::Closed)));
    }

    #[tokio::test]
    async fn oversized_start_ends_connection_with_store_error() {
        let (c, factory) = setup();
        let mut empty: &[u8] = &[];
        let err = c
            .handle_message(start("huge", u32::MAX, u32::MAX, 1), &mut empty)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::TooLarge { .. })));
        assert!(factory.images("huge").is_empty());
        assert!(c.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn failed_open_is_reported() {
        struct Refuse;
        impl StoreFactory for Refuse {
            fn open(&self, spec: &ImageSpec) -> std::result::Result<Box<dyn ingest_core::ImageStore>, StoreError> {
                Err(StoreError::InvalidName(spec.image_name.clone()))
            }
        }
        let c = Coordinator::start(Arc::new(Refuse), options());
        let mut empty: &[u8] = &[];
        let err = c.handle_message(start("x", 1, 1, 1), &mut empty).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::InvalidName(_))));
        assert!(c.open_sessions().is_empty());
    }
}
