//! Background scan-and-load loop.
//!
//! The loop wakes every `interval`, runs change detection over all roots and,
//! in `Running` state, drains the pending list one item at a time. State can
//! be flipped from any thread; the drain checks it before every item.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::ingest::pipeline::IngestionPipeline;
use crate::kb::model::{Document, KnowledgeBaseNode, LoadState, ScanState};
use crate::notify::Notifier;
use crate::scan::detector::{ChangeDetector, ScanReport};
use crate::scan::listing::stat;
use crate::store::{PendingItem, Store};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one loop iteration
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub scan: ScanReport,
    pub ingested: usize,
    pub failed: usize,
    pub purged: usize,
    pub completed_nodes: usize,
    /// The drain stopped early because the state changed
    pub interrupted: bool,
}

#[derive(Default)]
struct Signal {
    shutdown: bool,
    kick: bool,
}

struct Inner {
    store: Store,
    detector: ChangeDetector,
    pipeline: IngestionPipeline,
    notifier: Notifier,
    interval: Duration,
    item_pause: Duration,
    state: AtomicU8,
    /// True while one document is being ingested
    in_flight: Mutex<bool>,
    idle: Condvar,
    signal: Mutex<Signal>,
    wakeup: Condvar,
}

/// Clears the in-flight flag when ingestion of one document ends, even on error.
struct InFlightGuard<'a>(&'a Inner);

impl<'a> InFlightGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        *lock(&inner.in_flight) = true;
        Self(inner)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.in_flight) = false;
        self.0.idle.notify_all();
    }
}

impl Inner {
    fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_shutdown(&self) -> bool {
        lock(&self.signal).shutdown
    }

    /// Sleep up to `duration`; returns true if shutdown was requested.
    fn sleep(&self, duration: Duration) -> bool {
        let guard = lock(&self.signal);
        let (mut guard, _) = self
            .wakeup
            .wait_timeout_while(guard, duration, |s| !s.shutdown && !s.kick)
            .unwrap_or_else(PoisonError::into_inner);
        guard.kick = false;
        guard.shutdown
    }

    fn run_once(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        match self.state() {
            ScanState::Stopped => return Ok(summary),
            ScanState::ScanOnly => {
                summary.scan = self.detector.detect_all()?;
            }
            ScanState::Running => {
                summary.scan = self.detector.detect_all()?;
                self.drain(&mut summary)?;
            }
        }
        Ok(summary)
    }

    fn drain(&self, summary: &mut PassSummary) -> Result<()> {
        let items = self.store.pending_items()?;
        if !items.is_empty() {
            log::debug!("Draining {} pending item(s)", items.len());
        }

        for item in items {
            if self.state() != ScanState::Running || self.is_shutdown() {
                summary.interrupted = true;
                log::info!("Drain interrupted, state is now {:?}", self.state());
                break;
            }

            let result = match item {
                PendingItem::Node(node) => self.process_node(&node, summary),
                PendingItem::Document(doc) => self.process_document(&doc, summary),
            };
            if let Err(e) = result {
                log::error!("Failed to process pending item: {}", e);
            }

            match self.store.pending_count() {
                Ok(count) => self.notifier.pending_count(count),
                Err(e) => log::warn!("Failed to refresh pending count: {}", e),
            }
            if !self.item_pause.is_zero() {
                std::thread::sleep(self.item_pause);
            }
        }
        Ok(())
    }

    fn process_node(&self, node: &KnowledgeBaseNode, summary: &mut PassSummary) -> Result<()> {
        // the row may have gone with an ancestor earlier in this drain
        let Some(node) = self.store.get_node(&node.id)? else {
            return Ok(());
        };

        match node.load_state {
            LoadState::Deleted => {
                if Path::new(&node.location_path).is_dir() {
                    log::debug!("{} is back on disk, keeping it", node.location_path);
                    return Ok(());
                }
                let removed = self.store.delete_node_tree(&node.id)?;
                summary.purged += removed;
                log::info!("Removed knowledge base {} ({} node(s))", node.location_path, removed);
                if !node.is_root() {
                    summary.completed_nodes += self.refresh_completion(&node.parent_id)?;
                }
            }
            state if state.is_pending() => {
                summary.completed_nodes += self.refresh_completion(&node.id)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn process_document(&self, doc: &Document, summary: &mut PassSummary) -> Result<()> {
        let Some(mut doc) = self.store.get_document(&doc.id)? else {
            return Ok(());
        };
        let path = Path::new(&doc.location_path);

        if doc.load_state == LoadState::Deleted {
            if path.is_file() {
                log::debug!("{} is back on disk, keeping it", doc.location_path);
                return Ok(());
            }
            self.store.delete_document(&doc.id)?;
            summary.purged += 1;
            summary.completed_nodes += self.refresh_completion(&doc.kb_id)?;
            return Ok(());
        }
        if !doc.load_state.is_pending() {
            return Ok(());
        }

        let Some((size, mtime)) = stat(path)? else {
            self.store.set_document_state(&doc.id, LoadState::Deleted)?;
            self.notifier.document_state(&doc.id, LoadState::Deleted);
            return Ok(());
        };
        if size != doc.size || mtime != doc.mtime {
            self.store.update_file_stat(&doc.id, size, mtime)?;
            doc.size = size;
            doc.mtime = mtime;
        }

        let state = {
            let _guard = InFlightGuard::enter(self);
            self.pipeline.ingest(&doc)?
        };
        if state == LoadState::Complete {
            summary.ingested += 1;
        } else {
            summary.failed += 1;
        }
        self.notifier.document_state(&doc.id, state);
        summary.completed_nodes += self.refresh_completion(&doc.kb_id)?;
        Ok(())
    }

    /// Mark `kb_id` and its ancestors Complete while they have no pending children.
    fn refresh_completion(&self, kb_id: &str) -> Result<usize> {
        let mut completed = 0;
        let mut current = kb_id.to_string();
        loop {
            let Some(node) = self.store.get_node(&current)? else {
                break;
            };
            if node.load_state == LoadState::Deleted
                || self.store.pending_children_count(&node.id)? > 0
            {
                break;
            }
            if node.load_state != LoadState::Complete {
                self.store.set_node_state(&node.id, LoadState::Complete)?;
                self.notifier.kb_state(&node.id, LoadState::Complete);
                completed += 1;
            }
            if node.is_root() {
                break;
            }
            current = node.parent_id;
        }
        Ok(completed)
    }
}

fn run_loop(inner: Arc<Inner>) {
    log::debug!("Scan loop started");
    loop {
        if inner.is_shutdown() {
            break;
        }
        if let Err(e) = inner.run_once() {
            log::error!("Scan pass failed: {}", e);
        }
        if inner.sleep(inner.interval) {
            break;
        }
    }
    log::debug!("Scan loop exiting");
}

/// Periodic change detection and loading, driven by a [`ScanState`]
pub struct ScanScheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanScheduler {
    pub fn new(
        store: Store,
        pipeline: IngestionPipeline,
        notifier: Notifier,
        interval: Duration,
        item_pause: Duration,
    ) -> Self {
        let detector = ChangeDetector::new(store.clone(), notifier.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                detector,
                pipeline,
                notifier,
                interval,
                item_pause,
                state: AtomicU8::new(ScanState::Stopped.as_u8()),
                in_flight: Mutex::new(false),
                idle: Condvar::new(),
                signal: Mutex::new(Signal::default()),
                wakeup: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScanState {
        self.inner.state()
    }

    /// Switch state, notifying the UI when scanning starts or stops.
    pub fn set_state(&self, next: ScanState) {
        let previous = ScanState::from_u8(self.inner.state.swap(next.as_u8(), Ordering::SeqCst));
        if previous == next {
            return;
        }
        log::info!("Scan state {:?} -> {:?}", previous, next);
        match (previous, next) {
            (_, ScanState::Running) => self.inner.notifier.scan_started(),
            (ScanState::Running, _) => self.inner.notifier.scan_stopped(),
            _ => {}
        }
    }

    /// Spawn the loop thread if needed and switch to `Running`.
    pub fn start(&self) -> Result<()> {
        {
            let mut worker = lock(&self.worker);
            if worker.is_none() {
                lock(&self.inner.signal).shutdown = false;
                let inner = Arc::clone(&self.inner);
                let handle = std::thread::Builder::new()
                    .name("kbvault-scan".to_string())
                    .spawn(move || run_loop(inner))?;
                *worker = Some(handle);
            }
        }
        self.set_state(ScanState::Running);
        self.kick();
        Ok(())
    }

    /// Keep detecting changes but stop loading documents.
    pub fn scan_only(&self) {
        self.set_state(ScanState::ScanOnly);
    }

    /// Pause the loop; the thread keeps polling.
    pub fn stop(&self) {
        self.set_state(ScanState::Stopped);
    }

    /// Run one iteration for the current state on the caller's thread.
    pub fn run_once(&self) -> Result<PassSummary> {
        self.inner.run_once()
    }

    /// Whether a document is being ingested right now.
    pub fn is_ingesting(&self) -> bool {
        *lock(&self.inner.in_flight)
    }

    /// Wait for in-flight ingestion to finish. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut busy = lock(&self.inner.in_flight);
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            busy = self
                .inner
                .idle
                .wait_timeout(busy, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stop loading and wait for the current document, if any.
    pub fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.scan_only();
        self.wait_until_idle(timeout)
    }

    /// End the loop thread. In-flight ingestion completes first.
    pub fn shutdown(&self) {
        self.stop();
        lock(&self.inner.signal).shutdown = true;
        self.inner.wakeup.notify_all();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("Scan thread panicked");
            }
        }
    }

    fn kick(&self) {
        lock(&self.inner.signal).kick = true;
        self.inner.wakeup.notify_all();
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::error::KbError;
    use crate::kb::model::ROOT_PARENT_ID;
    use crate::notify::testing::recording;
    use crate::notify::{UiEvent, UiNotifier};
    use crate::scan::listing::normalize_path;
    use crate::store::test_support::store_in;
    use std::fs;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn scheduler(store: &Store, notifier: Notifier) -> ScanScheduler {
        let pipeline = IngestionPipeline::new(store.clone(), Arc::new(HashingEmbedder::new(32)), 100);
        ScanScheduler::new(
            store.clone(),
            pipeline,
            notifier,
            Duration::from_millis(20),
            Duration::ZERO,
        )
    }

    fn seed_tree(dir: &TempDir, store: &Store) -> KnowledgeBaseNode {
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("sub")).unwrap();
        fs::write(data.join("a.txt"), "alpha document").unwrap();
        fs::write(data.join("b.png"), b"\x89PNG").unwrap();
        fs::write(data.join("sub/c.md"), "# gamma").unwrap();
        store
            .insert_node(ROOT_PARENT_ID, "data", &normalize_path(&data), LoadState::AddedPending)
            .unwrap()
    }

    #[test]
    fn test_running_pass_loads_everything() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let root = seed_tree(&dir, &store);
        let (recorder, notifier) = recording();
        let scheduler = scheduler(&store, notifier);

        scheduler.set_state(ScanState::Running);
        let summary = scheduler.run_once().unwrap();

        assert_eq!(summary.scan.added_documents, 3);
        assert_eq!(summary.ingested, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(
            store.get_node(&root.id).unwrap().unwrap().load_state,
            LoadState::Complete
        );

        let events = recorder.events();
        assert_eq!(events[0], UiEvent::ScanStarted);
        assert!(events.contains(&UiEvent::PendingCount { count: 0 }));
        assert!(events.contains(&UiEvent::KbState {
            id: root.id.clone(),
            state: LoadState::Complete
        }));
    }

    #[test]
    fn test_scan_only_and_stopped() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        seed_tree(&dir, &store);
        let (_recorder, notifier) = recording();
        let scheduler = scheduler(&store, notifier);

        assert_eq!(scheduler.run_once().unwrap(), PassSummary::default());

        scheduler.scan_only();
        let summary = scheduler.run_once().unwrap();
        assert_eq!(summary.scan.added_documents, 3);
        assert_eq!(summary.ingested, 0);
        assert_eq!(store.pending_count().unwrap(), 5);
    }

    #[test]
    fn test_deleted_entries_are_purged() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let root = seed_tree(&dir, &store);
        let (_recorder, notifier) = recording();
        let scheduler = scheduler(&store, notifier);
        scheduler.set_state(ScanState::Running);
        scheduler.run_once().unwrap();

        let data = dir.path().join("data");
        fs::remove_file(data.join("a.txt")).unwrap();
        fs::remove_dir_all(data.join("sub")).unwrap();
        let summary = scheduler.run_once().unwrap();

        assert_eq!(summary.scan.deleted, 2);
        assert_eq!(summary.purged, 2);
        assert_eq!(store.documents_in(&root.id).unwrap().len(), 1);
        assert!(store.child_nodes(&root.id).unwrap().is_empty());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    /// Stops the scheduler when the first document finishes loading.
    struct StopAfterFirst(OnceLock<Arc<ScanScheduler>>);

    impl UiNotifier for StopAfterFirst {
        fn notify(&self, event: &UiEvent) -> std::result::Result<(), KbError> {
            if let (UiEvent::DocumentState { .. }, Some(scheduler)) = (event, self.0.get()) {
                scheduler.stop();
            }
            Ok(())
        }
    }

    #[test]
    fn test_drain_rechecks_state_before_each_item() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        seed_tree(&dir, &store);
        let hook = Arc::new(StopAfterFirst(OnceLock::new()));
        let scheduler = Arc::new(scheduler(&store, Notifier::new(hook.clone())));
        let _ = hook.0.set(Arc::clone(&scheduler));

        scheduler.set_state(ScanState::Running);
        let summary = scheduler.run_once().unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.ingested + summary.failed, 1);
        assert_eq!(scheduler.state(), ScanState::Stopped);
    }

    #[test]
    fn test_background_thread_drains_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let root = seed_tree(&dir, &store);
        let (_recorder, notifier) = recording();
        let scheduler = scheduler(&store, notifier);

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.get_node(&root.id).unwrap().unwrap().load_state != LoadState::Complete {
            assert!(Instant::now() < deadline, "scheduler never completed the root");
            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(scheduler.stop_and_wait(Duration::from_secs(5)));
        assert!(!scheduler.is_ingesting());
        scheduler.shutdown();
        assert_eq!(scheduler.state(), ScanState::Stopped);
    }
}
