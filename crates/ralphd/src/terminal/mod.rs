//! Terminal multiplexer.
//!
//! Shares one PTY per `(session, pane)` key across any number of observers.
//! The PTY is attached on first subscribe, its output fanned out to every
//! subscriber, and killed when the last subscriber leaves.

pub mod pty;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub use pty::TmuxAttachSpawner;

/// Chunks buffered between the PTY reader thread and the fan-out task.
const OUTPUT_BUFFER: usize = 64;
/// Chunks queued per observer before its output is dropped.
pub const OBSERVER_BUFFER: usize = 256;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("pty error: {0}")]
    Pty(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("terminal multiplexer is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, TerminalError>;

/// Identifies one terminal pane in the external session manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: String,
    pub pane_id: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, pane_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pane_id: pane_id.into(),
        }
    }

    /// Attach target, `session:pane`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.session_id, self.pane_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.pane_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyDimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyDimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 120 }
    }
}

/// Opaque per-connection observer id.
pub type ObserverId = String;

/// Bytes produced by one PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutput {
    pub key: SessionKey,
    pub data: Vec<u8>,
}

/// Write side of a live PTY.
pub trait PtyControl: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<()>;
    fn resize(&self, dims: PtyDimensions) -> Result<()>;
    fn kill(&self) -> Result<()>;
}

/// A freshly spawned PTY: a blocking reader that hits EOF when the process
/// exits, plus its controls.
pub struct SpawnedPty {
    pub reader: Box<dyn Read + Send>,
    pub control: Box<dyn PtyControl>,
}

impl fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedPty").finish_non_exhaustive()
    }
}

/// Attaches a PTY to a pane. Called from a blocking thread.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, key: &SessionKey, dims: PtyDimensions) -> Result<SpawnedPty>;
}

struct TerminalSession {
    key: SessionKey,
    control: Box<dyn PtyControl>,
}

impl TerminalSession {
    fn kill(&self) {
        if let Err(e) = self.control.kill() {
            warn!(key = %self.key, error = %e, "failed to kill pty");
        }
    }
}

#[derive(Default)]
struct SlotState {
    session: Option<Arc<TerminalSession>>,
    subscribers: HashSet<ObserverId>,
    /// Torn down; callers holding this slot must look it up again.
    retired: bool,
}

impl SlotState {
    fn owns(&self, session: &Arc<TerminalSession>) -> bool {
        self.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session))
    }

    fn retire(&mut self) -> Option<Arc<TerminalSession>> {
        self.retired = true;
        self.subscribers.clear();
        self.session.take()
    }
}

/// Per-key state. Its lock doubles as the creation lock for that key.
type Slot = Arc<Mutex<SlotState>>;

/// An observer's bounded output queue.
struct Outbox {
    tx: mpsc::Sender<TerminalOutput>,
    /// Chunks dropped since the queue last accepted one.
    dropped: u64,
}

struct Inner {
    spawner: Arc<dyn PtySpawner>,
    dims: PtyDimensions,
    registry: Mutex<HashMap<SessionKey, Slot>>,
    outboxes: Mutex<HashMap<ObserverId, Outbox>>,
    shut_down: AtomicBool,
}

/// Shared PTY sessions keyed by [`SessionKey`].
#[derive(Clone)]
pub struct TerminalMultiplexer {
    inner: Arc<Inner>,
}

impl fmt::Debug for TerminalMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalMultiplexer")
            .field("dims", &self.inner.dims)
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TerminalMultiplexer {
    pub fn new(spawner: Arc<dyn PtySpawner>, dims: PtyDimensions) -> Self {
        Self {
            inner: Arc::new(Inner {
                spawner,
                dims,
                registry: Mutex::new(HashMap::new()),
                outboxes: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register an observer's output channel.
    ///
    /// The channel holds at most [`OBSERVER_BUFFER`] chunks; output arriving
    /// while it is full is dropped for that observer only.
    pub async fn connect(&self, observer: &str) -> mpsc::Receiver<TerminalOutput> {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        self.inner
            .outboxes
            .lock()
            .await
            .insert(observer.to_string(), Outbox { tx, dropped: 0 });
        rx
    }

    /// Subscribe `observer` to `key`, attaching a PTY if none exists.
    ///
    /// Concurrent first subscribers for one key spawn exactly one PTY.
    pub async fn subscribe(&self, observer: &str, key: &SessionKey) -> Result<()> {
        loop {
            let slot = {
                let mut registry = self.inner.registry.lock().await;
                if self.is_shut_down() {
                    return Err(TerminalError::ShutDown);
                }
                Arc::clone(registry.entry(key.clone()).or_default())
            };

            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }

            if state.session.is_none() {
                match self.spawn(key).await {
                    Ok((session, reader)) => {
                        state.session = Some(Arc::clone(&session));
                        self.start_output(Arc::clone(&slot), session, reader);
                    }
                    Err(e) => {
                        state.retire();
                        drop(state);
                        self.remove_slot(key, &slot).await;
                        warn!(key = %key, error = %e, "failed to attach terminal");
                        return Err(e);
                    }
                }
            }

            if state.subscribers.insert(observer.to_string()) {
                debug!(key = %key, observer = %observer, "terminal subscribed");
            }
            return Ok(());
        }
    }

    /// Remove `observer` from `key`; the last one out kills the PTY.
    pub async fn unsubscribe(&self, observer: &str, key: &SessionKey) {
        let Some(slot) = self.slot(key).await else {
            return;
        };
        let mut state = slot.lock().await;
        if !state.subscribers.remove(observer) {
            return;
        }
        debug!(key = %key, observer = %observer, "terminal unsubscribed");
        if !state.subscribers.is_empty() {
            return;
        }

        let session = state.retire();
        drop(state);
        self.remove_slot(key, &slot).await;
        if let Some(session) = session {
            info!(key = %key, "closing terminal with no subscribers");
            session.kill();
        }
    }

    /// Forward input to an existing PTY. No-op when none exists.
    pub async fn write(&self, key: &SessionKey, data: &[u8]) -> Result<()> {
        match self.session(key).await {
            Some(session) => session.control.write(data),
            None => {
                warn!(key = %key, "input for terminal with no session");
                Ok(())
            }
        }
    }

    /// Resize an existing PTY. No-op when none exists.
    pub async fn resize(&self, key: &SessionKey, dims: PtyDimensions) -> Result<()> {
        match self.session(key).await {
            Some(session) => session.control.resize(dims),
            None => {
                warn!(key = %key, "resize for terminal with no session");
                Ok(())
            }
        }
    }

    /// Drop everything belonging to a departed observer.
    pub async fn cleanup_observer(&self, observer: &str) {
        self.inner.outboxes.lock().await.remove(observer);
        let keys: Vec<SessionKey> = self.inner.registry.lock().await.keys().cloned().collect();
        for key in keys {
            self.unsubscribe(observer, &key).await;
        }
    }

    /// Kill every PTY and refuse new subscriptions. Idempotent.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = {
            let mut registry = self.inner.registry.lock().await;
            if self.inner.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            registry.drain().map(|(_, slot)| slot).collect()
        };
        info!(sessions = slots.len(), "shutting down terminals");
        for slot in slots {
            if let Some(session) = slot.lock().await.retire() {
                session.kill();
            }
        }
        self.inner.outboxes.lock().await.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of live PTYs.
    pub async fn session_count(&self) -> usize {
        let slots: Vec<Slot> = self.inner.registry.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.session.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Current subscribers of `key`, sorted.
    pub async fn subscribers(&self, key: &SessionKey) -> Vec<ObserverId> {
        let Some(slot) = self.slot(key).await else {
            return Vec::new();
        };
        let mut subscribers: Vec<ObserverId> =
            slot.lock().await.subscribers.iter().cloned().collect();
        subscribers.sort();
        subscribers
    }

    async fn slot(&self, key: &SessionKey) -> Option<Slot> {
        self.inner.registry.lock().await.get(key).cloned()
    }

    async fn session(&self, key: &SessionKey) -> Option<Arc<TerminalSession>> {
        let slot = self.slot(key).await?;
        let state = slot.lock().await;
        state.session.clone()
    }

    /// Remove `key` only if it still maps to `slot`.
    async fn remove_slot(&self, key: &SessionKey, slot: &Slot) {
        let mut registry = self.inner.registry.lock().await;
        if registry.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            registry.remove(key);
        }
    }

    async fn spawn(
        &self,
        key: &SessionKey,
    ) -> Result<(Arc<TerminalSession>, Box<dyn Read + Send>)> {
        let spawner = Arc::clone(&self.inner.spawner);
        let dims = self.inner.dims;
        let spawn_key = key.clone();
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(&spawn_key, dims))
            .await
            .map_err(|e| TerminalError::Pty(format!("spawn task failed: {e}")))??;

        info!(key = %key, rows = dims.rows, cols = dims.cols, "attached terminal");
        let session = Arc::new(TerminalSession {
            key: key.clone(),
            control: spawned.control,
        });
        Ok((session, spawned.reader))
    }

    /// Pump PTY output to subscribers until EOF.
    fn start_output(&self, slot: Slot, session: Arc<TerminalSession>, reader: Box<dyn Read + Send>) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER);
        let thread_name = format!("ralph-pty-{}", session.key);
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || read_loop(reader, &tx));
        if let Err(e) = spawned {
            warn!(key = %session.key, error = %e, "failed to start pty reader");
        }

        let multiplexer = self.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                multiplexer.fan_out(&slot, &session, data).await;
            }
            multiplexer.on_exit(&slot, &session).await;
        });
    }

    async fn fan_out(&self, slot: &Slot, session: &Arc<TerminalSession>, data: Vec<u8>) {
        let subscribers: Vec<ObserverId> = {
            let state = slot.lock().await;
            if !state.owns(session) {
                return;
            }
            state.subscribers.iter().cloned().collect()
        };
        let mut outboxes = self.inner.outboxes.lock().await;
        for observer in subscribers {
            let Some(outbox) = outboxes.get_mut(&observer) else {
                continue;
            };
            let output = TerminalOutput {
                key: session.key.clone(),
                data: data.clone(),
            };
            match outbox.tx.try_send(output) {
                Ok(()) => {
                    if outbox.dropped > 0 {
                        info!(
                            key = %session.key,
                            observer = %observer,
                            dropped = outbox.dropped,
                            "observer caught up with terminal output"
                        );
                        outbox.dropped = 0;
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if outbox.dropped == 0 {
                        warn!(
                            key = %session.key,
                            observer = %observer,
                            "observer too slow, dropping terminal output"
                        );
                    }
                    outbox.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// The PTY reached EOF. Tear the session down unless it was already
    /// replaced or removed.
    async fn on_exit(&self, slot: &Slot, session: &Arc<TerminalSession>) {
        let mut state = slot.lock().await;
        if !state.owns(session) {
            return;
        }
        state.retire();
        drop(state);
        self.remove_slot(&session.key, slot).await;
        info!(key = %session.key, "terminal process exited");
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: &mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    /// Reader fed by the test; `None` is EOF.
    struct FakeReader {
        rx: std_mpsc::Receiver<Option<Vec<u8>>>,
    }

    impl Read for FakeReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.rx.recv() {
                Ok(Some(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Ok(None) | Err(_) => Ok(0),
            }
        }
    }

    struct FakeControl {
        feed: std_mpsc::Sender<Option<Vec<u8>>>,
        written: Arc<std::sync::Mutex<Vec<u8>>>,
        resized: Arc<std::sync::Mutex<Vec<PtyDimensions>>>,
        kills: Arc<AtomicUsize>,
    }

    impl PtyControl for FakeControl {
        fn write(&self, data: &[u8]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, dims: PtyDimensions) -> Result<()> {
            self.resized.lock().unwrap().push(dims);
            Ok(())
        }

        fn kill(&self) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            let _ = self.feed.send(None);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        spawns: AtomicUsize,
        fail_next: AtomicBool,
        delay: Duration,
        feeds: std::sync::Mutex<Vec<std_mpsc::Sender<Option<Vec<u8>>>>>,
        written: Arc<std::sync::Mutex<Vec<u8>>>,
        resized: Arc<std::sync::Mutex<Vec<PtyDimensions>>>,
        kills: Arc<AtomicUsize>,
    }

    impl FakeSpawner {
        fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        fn kills(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        /// Feed for the most recently spawned PTY.
        fn feed(&self) -> std_mpsc::Sender<Option<Vec<u8>>> {
            self.feeds.lock().unwrap().last().unwrap().clone()
        }
    }

    impl PtySpawner for FakeSpawner {
        fn spawn(&self, _key: &SessionKey, _dims: PtyDimensions) -> Result<SpawnedPty> {
            std::thread::sleep(self.delay);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TerminalError::Pty("no such session".to_string()));
            }
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = std_mpsc::channel();
            self.feeds.lock().unwrap().push(tx.clone());
            Ok(SpawnedPty {
                reader: Box::new(FakeReader { rx }),
                control: Box::new(FakeControl {
                    feed: tx,
                    written: Arc::clone(&self.written),
                    resized: Arc::clone(&self.resized),
                    kills: Arc::clone(&self.kills),
                }),
            })
        }
    }

    fn multiplexer(spawner: &Arc<FakeSpawner>) -> TerminalMultiplexer {
        TerminalMultiplexer::new(
            Arc::clone(spawner) as Arc<dyn PtySpawner>,
            PtyDimensions::default(),
        )
    }

    fn key() -> SessionKey {
        SessionKey::new("ralph", "0")
    }

    async fn wait_until_empty(mux: &TerminalMultiplexer) {
        for _ in 0..200 {
            if mux.session_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("terminal session was not torn down");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribes_spawn_once() {
        let spawner = Arc::new(FakeSpawner {
            delay: Duration::from_millis(50),
            ..FakeSpawner::default()
        });
        let mux = multiplexer(&spawner);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let mux = mux.clone();
                tokio::spawn(async move { mux.subscribe(&format!("obs-{i}"), &key()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(spawner.spawns(), 1);
        assert_eq!(mux.subscribers(&key()).await.len(), 8);
        assert_eq!(mux.session_count().await, 1);
    }

    #[tokio::test]
    async fn output_reaches_every_subscriber() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        let mut a = mux.connect("a").await;
        let mut b = mux.connect("b").await;
        mux.subscribe("a", &key()).await.unwrap();
        mux.subscribe("b", &key()).await.unwrap();

        spawner.feed().send(Some(b"hello".to_vec())).unwrap();

        for rx in [&mut a, &mut b] {
            let output = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(output.key, key());
            assert_eq!(output.data, b"hello");
        }
    }

    #[tokio::test]
    async fn stalled_observer_queue_is_bounded() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        let mut stalled = mux.connect("stalled").await;
        let mut live = mux.connect("live").await;
        mux.subscribe("stalled", &key()).await.unwrap();
        mux.subscribe("live", &key()).await.unwrap();

        let feed = spawner.feed();
        let total = OBSERVER_BUFFER + 16;
        for i in 0..total {
            let chunk = (i as u32).to_be_bytes().to_vec();
            feed.send(Some(chunk.clone())).unwrap();
            let output = tokio::time::timeout(Duration::from_secs(2), live.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(output.data, chunk);
        }

        // Let the fan-out of the final chunk settle.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stalled observer kept the oldest chunks and lost the overflow.
        let mut queued = Vec::new();
        while let Ok(output) = stalled.try_recv() {
            queued.push(output.data);
        }
        assert_eq!(queued.len(), OBSERVER_BUFFER);
        assert_eq!(queued[0], 0u32.to_be_bytes().to_vec());
        assert_eq!(
            queued[OBSERVER_BUFFER - 1],
            ((OBSERVER_BUFFER - 1) as u32).to_be_bytes().to_vec()
        );

        // Once drained it receives output again.
        feed.send(Some(b"after".to_vec())).unwrap();
        let output = tokio::time::timeout(Duration::from_secs(2), stalled.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.data, b"after");
    }

    #[tokio::test]
    async fn last_unsubscribe_kills_pty() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.subscribe("a", &key()).await.unwrap();
        mux.subscribe("b", &key()).await.unwrap();

        mux.unsubscribe("a", &key()).await;
        assert_eq!(spawner.kills(), 0);
        assert_eq!(mux.session_count().await, 1);

        mux.unsubscribe("b", &key()).await;
        assert_eq!(spawner.kills(), 1);
        assert_eq!(mux.session_count().await, 0);
        assert!(mux.subscribers(&key()).await.is_empty());

        mux.write(&key(), b"ls\n").await.unwrap();
        assert!(spawner.written.lock().unwrap().is_empty());
        assert_eq!(spawner.spawns(), 1);
    }

    #[tokio::test]
    async fn write_and_resize_route_to_live_pty() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.subscribe("a", &key()).await.unwrap();

        mux.write(&key(), b"q").await.unwrap();
        let dims = PtyDimensions { rows: 40, cols: 200 };
        mux.resize(&key(), dims).await.unwrap();

        assert_eq!(spawner.written.lock().unwrap().as_slice(), b"q");
        assert_eq!(spawner.resized.lock().unwrap().as_slice(), &[dims]);
    }

    #[tokio::test]
    async fn write_without_session_never_spawns() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.write(&key(), b"x").await.unwrap();
        mux.resize(&key(), PtyDimensions::default()).await.unwrap();
        assert_eq!(spawner.spawns(), 0);
        assert_eq!(mux.session_count().await, 0);
    }

    #[tokio::test]
    async fn failed_spawn_can_be_retried() {
        let spawner = Arc::new(FakeSpawner::default());
        spawner.fail_next.store(true, Ordering::SeqCst);
        let mux = multiplexer(&spawner);

        assert!(matches!(
            mux.subscribe("a", &key()).await,
            Err(TerminalError::Pty(_))
        ));
        assert!(mux.subscribers(&key()).await.is_empty());

        mux.subscribe("a", &key()).await.unwrap();
        assert_eq!(spawner.spawns(), 1);
        assert_eq!(mux.subscribers(&key()).await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn pty_exit_removes_session() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.subscribe("a", &key()).await.unwrap();

        spawner.feed().send(None).unwrap();
        wait_until_empty(&mux).await;
        assert!(mux.subscribers(&key()).await.is_empty());

        // A later subscribe attaches a fresh PTY.
        mux.subscribe("a", &key()).await.unwrap();
        assert_eq!(spawner.spawns(), 2);
        assert_eq!(mux.session_count().await, 1);
    }

    #[tokio::test]
    async fn stale_exit_does_not_remove_successor() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.subscribe("a", &key()).await.unwrap();
        let first = spawner.feed();

        // Last subscriber leaves, then a new one re-creates the session
        // before the killed PTY's EOF has been processed.
        mux.unsubscribe("a", &key()).await;
        mux.subscribe("b", &key()).await.unwrap();
        let _ = first.send(None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mux.session_count().await, 1);
        assert_eq!(mux.subscribers(&key()).await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_observer_tears_down_its_keys() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        let other = SessionKey::new("ralph", "1");
        let _rx = mux.connect("a").await;
        mux.subscribe("a", &key()).await.unwrap();
        mux.subscribe("a", &other).await.unwrap();
        mux.subscribe("b", &other).await.unwrap();

        mux.cleanup_observer("a").await;

        assert!(mux.subscribers(&key()).await.is_empty());
        assert_eq!(mux.subscribers(&other).await, vec!["b".to_string()]);
        assert_eq!(mux.session_count().await, 1);
        assert_eq!(spawner.kills(), 1);
    }

    #[tokio::test]
    async fn shutdown_kills_all_and_rejects_subscribe() {
        let spawner = Arc::new(FakeSpawner::default());
        let mux = multiplexer(&spawner);
        mux.subscribe("a", &key()).await.unwrap();
        mux.subscribe("a", &SessionKey::new("other", "0")).await.unwrap();

        mux.shutdown().await;
        mux.shutdown().await;

        assert!(mux.is_shut_down());
        assert_eq!(spawner.kills(), 2);
        assert_eq!(mux.session_count().await, 0);
        assert!(matches!(
            mux.subscribe("a", &key()).await,
            Err(TerminalError::ShutDown)
        ));
    }

    #[test]
    fn session_key_target() {
        assert_eq!(SessionKey::new("ralph-x", "2").target(), "ralph-x:2");
    }
}
