//! Broadcast hub: the table of registered subordinates and mode fan-out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelAdapter;
use crate::error::SyncError;
use crate::message::Source;
use crate::subordinate::SubordinateHandle;
use crate::theme::ModeSource;

/// Offsets, relative to registration, of the follow-up sends that cover a
/// subordinate whose endpoint appears shortly after mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    pub offsets: Vec<Duration>,
}

impl RetrySchedule {
    /// Only the immediate attempt.
    pub fn immediate_only() -> Self {
        Self {
            offsets: Vec::new(),
        }
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            offsets: vec![Duration::from_millis(500), Duration::from_millis(1000)],
        }
    }
}

struct Entry {
    id: u64,
    handle: SubordinateHandle,
}

struct RegistryInner {
    source: Arc<dyn ModeSource>,
    adapter: Arc<ChannelAdapter>,
    schedule: RetrySchedule,
    /// Registration order.
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    last_mode: AtomicBool,
    shutdown: CancellationToken,
}

impl RegistryInner {
    fn handle(&self, id: u64) -> Option<SubordinateHandle> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.handle.clone())
    }

    fn remove(&self, id: u64) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() != before {
            tracing::debug!(id, remaining = entries.len(), "unregistered subordinate");
        }
    }

    fn broadcast(&self, is_dark: bool) -> usize {
        // Snapshot so no lock is held while calling into subordinates.
        let handles: Vec<SubordinateHandle> =
            self.entries.lock().iter().map(|e| e.handle.clone()).collect();
        let delivered = handles
            .iter()
            .filter(|h| self.adapter.deliver(h, is_dark, Source::Registry))
            .count();
        tracing::info!(is_dark, entries = handles.len(), delivered, "broadcast display mode");
        delivered
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Process-wide hub. Cheap to clone; all clones share one table.
///
/// Created once at application start with [`ModeRegistry::start`], disposed
/// with [`ModeRegistry::shutdown`]. Must be started inside a tokio runtime.
#[derive(Clone)]
pub struct ModeRegistry {
    inner: Arc<RegistryInner>,
}

impl ModeRegistry {
    pub fn start(source: Arc<dyn ModeSource>, adapter: Arc<ChannelAdapter>) -> Self {
        Self::with_schedule(source, adapter, RetrySchedule::default())
    }

    pub fn with_schedule(
        source: Arc<dyn ModeSource>,
        adapter: Arc<ChannelAdapter>,
        schedule: RetrySchedule,
    ) -> Self {
        let changes = source.subscribe();
        let inner = Arc::new(RegistryInner {
            last_mode: AtomicBool::new(source.resolve()),
            source,
            adapter,
            schedule,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(watch_mode(
            Arc::downgrade(&inner),
            changes,
            inner.shutdown.clone(),
        ));
        tracing::info!(dark = inner.last_mode.load(Ordering::SeqCst), "mode registry started");
        Self { inner }
    }

    /// Add `handle` to the table and schedule its initial sends.
    ///
    /// Registering the same handle twice creates two entries; drop or
    /// unregister the first [`Registration`] before registering again.
    pub fn register(&self, handle: SubordinateHandle) -> Result<Registration, SyncError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SyncError::RegistryClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.shutdown.child_token();
        self.inner.entries.lock().push(Entry {
            id,
            handle: handle.clone(),
        });
        tracing::debug!(id, origin = handle.origin(), "registered subordinate");

        if handle.frame().is_reachable() {
            self.inner
                .adapter
                .deliver(&handle, self.inner.source.resolve(), Source::Registry);
        }
        if !self.inner.schedule.offsets.is_empty() {
            tokio::spawn(retry_sends(
                Arc::downgrade(&self.inner),
                id,
                cancel.clone(),
                self.inner.schedule.offsets.clone(),
            ));
        }

        Ok(Registration {
            id,
            registry: Arc::downgrade(&self.inner),
            cancel,
            released: AtomicBool::new(false),
        })
    }

    /// Deliver `is_dark` to every registered subordinate, in registration
    /// order. Returns how many were reachable.
    pub fn broadcast(&self, is_dark: bool) -> usize {
        self.inner.broadcast(is_dark)
    }

    /// The last resolved mode the hub observed.
    pub fn last_mode(&self) -> bool {
        self.inner.last_mode.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &Arc<dyn ModeSource> {
        &self.inner.source
    }

    pub fn adapter(&self) -> &Arc<ChannelAdapter> {
        &self.inner.adapter
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: &SubordinateHandle) -> bool {
        self.inner
            .entries
            .lock()
            .iter()
            .any(|e| e.handle.same_as(handle))
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop reacting to mode changes, cancel pending retries and drop every
    /// entry. Later registrations fail with [`SyncError::RegistryClosed`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dropped = std::mem::take(&mut *self.inner.entries.lock()).len();
        tracing::info!(dropped, "mode registry shut down");
    }
}

async fn watch_mode(
    inner: Weak<RegistryInner>,
    mut changes: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    tracing::debug!("mode source dropped, registry stops watching");
                    return;
                }
                let dark = *changes.borrow_and_update();
                let Some(inner) = inner.upgrade() else { return };
                if inner.last_mode.swap(dark, Ordering::SeqCst) != dark {
                    inner.broadcast(dark);
                }
            }
        }
    }
}

async fn retry_sends(
    inner: Weak<RegistryInner>,
    id: u64,
    cancel: CancellationToken,
    offsets: Vec<Duration>,
) {
    let registered_at = Instant::now();
    for offset in offsets {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(registered_at + offset) => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        let Some(handle) = inner.handle(id) else { return };
        let delivered = inner
            .adapter
            .deliver(&handle, inner.source.resolve(), Source::Registry);
        tracing::debug!(id, ?offset, delivered, "scheduled registration send");
    }
}

/// Capability returned by [`ModeRegistry::register`]. Unregisters on drop.
#[must_use = "dropping a Registration unregisters the subordinate"]
pub struct Registration {
    id: u64,
    registry: Weak<RegistryInner>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    /// Remove the entry and cancel its pending sends. Idempotent.
    pub fn unregister(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// The hub as seen by an embedding site: provided by an enclosing scope, or not.
#[derive(Clone, Default)]
pub enum RegistryScope {
    Provided(ModeRegistry),
    #[default]
    NotProvided,
}

impl RegistryScope {
    pub fn get(&self) -> Option<&ModeRegistry> {
        match self {
            RegistryScope::Provided(registry) => Some(registry),
            RegistryScope::NotProvided => None,
        }
    }

    pub fn is_provided(&self) -> bool {
        self.get().is_some()
    }

    /// The hub, for callers that cannot work without it.
    ///
    /// # Panics
    ///
    /// If no hub was provided. That is a wiring bug, not a runtime condition.
    #[track_caller]
    pub fn require(&self) -> &ModeRegistry {
        match self {
            RegistryScope::Provided(registry) => registry,
            RegistryScope::NotProvided => {
                panic!("ModeRegistry used outside of the scope that provides it")
            }
        }
    }
}

impl From<ModeRegistry> for RegistryScope {
    fn from(registry: ModeRegistry) -> Self {
        RegistryScope::Provided(registry)
    }
}

impl From<Option<ModeRegistry>> for RegistryScope {
    fn from(registry: Option<ModeRegistry>) -> Self {
        registry.map_or(RegistryScope::NotProvided, RegistryScope::Provided)
    }
}
