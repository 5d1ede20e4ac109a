//! Per-embedding synchronizer.
//!
//! Each embedding site mounts one [`Synchronizer`] for the subordinate it
//! owns. With a hub in scope the instance registers and lets the hub push
//! mode changes; without one it listens for the subordinate's readiness
//! signal itself and re-sends (debounced) on every mode change.
//!
//! ```text
//!   Unregistered ──register ok──▶ Registered
//!        │
//!        └─no hub / late attempt failed──▶ StandaloneWaiting
//!                                               │
//!                                               └─READY or load──▶ StandaloneReady
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::channel::ChannelAdapter;
use crate::message::{InboundEvent, InboundMessage, Source};
use crate::registry::{ModeRegistry, Registration, RegistryScope};
use crate::store::MODE_STORE_KEY;
use crate::subordinate::SubordinateHandle;
use crate::theme::ModeSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Unregistered,
    Registered,
    StandaloneWaiting,
    StandaloneReady,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Settle time between the load signal and the first sends.
    pub load_delay: Duration,
    /// Quiet period after a mode change before a standalone send.
    pub debounce: Duration,
    /// Wait before the second registration attempt.
    pub late_registration: Duration,
    /// Register with a hub when one is in scope.
    pub use_registry: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(500),
            debounce: Duration::from_millis(1000),
            late_registration: Duration::from_millis(1000),
            use_registry: true,
        }
    }
}

/// Everything an embedding site needs from its host.
#[derive(Clone)]
pub struct HostContext {
    pub source: Arc<dyn ModeSource>,
    pub adapter: Arc<ChannelAdapter>,
    pub bus: MessageBus,
    pub scope: RegistryScope,
}

impl HostContext {
    /// Context whose source and adapter are the hub's own.
    pub fn with_registry(registry: ModeRegistry, bus: MessageBus) -> Self {
        Self {
            source: registry.source().clone(),
            adapter: registry.adapter().clone(),
            bus,
            scope: RegistryScope::Provided(registry),
        }
    }

    /// Context with no hub in scope.
    pub fn standalone(
        source: Arc<dyn ModeSource>,
        adapter: Arc<ChannelAdapter>,
        bus: MessageBus,
    ) -> Self {
        Self {
            source,
            adapter,
            bus,
            scope: RegistryScope::NotProvided,
        }
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub dark: bool,
    pub state: SyncState,
    pub ready: bool,
    pub using_registry: bool,
    /// Value currently held by the persistent fallback, if readable.
    pub stored: Option<String>,
}

enum Link {
    Unregistered,
    Registered(Registration),
    Standalone,
}

struct Shared {
    handle: SubordinateHandle,
    source: Arc<dyn ModeSource>,
    adapter: Arc<ChannelAdapter>,
    options: SyncOptions,
    link: Mutex<Link>,
    ready: AtomicBool,
    /// Liveness token; every scheduled task is a child of it.
    alive: CancellationToken,
}

impl Shared {
    fn state(&self) -> SyncState {
        match &*self.link.lock() {
            Link::Unregistered => SyncState::Unregistered,
            Link::Registered(_) => SyncState::Registered,
            Link::Standalone if self.ready.load(Ordering::SeqCst) => SyncState::StandaloneReady,
            Link::Standalone => SyncState::StandaloneWaiting,
        }
    }

    fn message_source(&self) -> Source {
        match &*self.link.lock() {
            Link::Registered(_) => Source::Context,
            Link::Unregistered | Link::Standalone => Source::Standalone,
        }
    }

    fn send_mode(&self) -> bool {
        let dark = self.source.resolve();
        self.adapter
            .deliver(&self.handle, dark, self.message_source())
    }

    fn request_ready(&self) -> bool {
        self.adapter
            .request_ready(&self.handle, self.message_source())
    }

    fn try_register(&self, registry: &ModeRegistry) -> bool {
        match registry.register(self.handle.clone()) {
            Ok(registration) => {
                tracing::info!(
                    origin = self.handle.origin(),
                    id = registration.id(),
                    "registered with mode registry"
                );
                *self.link.lock() = Link::Registered(registration);
                true
            }
            Err(e) => {
                tracing::warn!(origin = self.handle.origin(), "registration failed: {e}");
                false
            }
        }
    }

    fn handle_inbound(&self, event: &InboundEvent) -> bool {
        if !matches!(*self.link.lock(), Link::Standalone) {
            return false;
        }
        match event.accept(self.handle.origin()) {
            Some(InboundMessage::Ready) => {
                tracing::debug!(origin = self.handle.origin(), "subordinate reported ready");
                self.ready.store(true, Ordering::SeqCst);
                self.send_mode();
                true
            }
            None => false,
        }
    }
}

/// Façade owned by one embedding site. Tears itself down on drop.
pub struct Synchronizer {
    shared: Arc<Shared>,
}

impl Synchronizer {
    /// Mount for `handle`. Must be called inside a tokio runtime.
    pub fn mount(handle: SubordinateHandle, host: &HostContext, options: SyncOptions) -> Self {
        let shared = Arc::new(Shared {
            handle,
            source: host.source.clone(),
            adapter: host.adapter.clone(),
            options,
            link: Mutex::new(Link::Unregistered),
            ready: AtomicBool::new(false),
            alive: CancellationToken::new(),
        });

        let registry = if shared.options.use_registry {
            host.scope.get().cloned()
        } else {
            None
        };
        match registry {
            Some(registry) => {
                if !shared.try_register(&registry) {
                    tokio::spawn(late_registration(
                        Arc::downgrade(&shared),
                        registry,
                        host.bus.clone(),
                        shared.alive.child_token(),
                    ));
                }
            }
            None => go_standalone(&shared, &host.bus),
        }

        tokio::spawn(follow_mode(
            Arc::downgrade(&shared),
            shared.source.subscribe(),
            shared.alive.child_token(),
        ));

        Synchronizer { shared }
    }

    pub fn handle(&self) -> &SubordinateHandle {
        &self.shared.handle
    }

    pub fn state(&self) -> SyncState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn using_registry(&self) -> bool {
        self.state() == SyncState::Registered
    }

    /// The subordinate finished loading. After the settle delay, send the
    /// current mode, ask for readiness and consider the subordinate ready.
    pub fn on_load(&self) {
        tracing::debug!(origin = self.shared.handle.origin(), "subordinate loaded");
        tokio::spawn(settle_after_load(
            Arc::downgrade(&self.shared),
            self.shared.alive.child_token(),
            self.shared.options.load_delay,
        ));
    }

    /// Feed an inbound event directly. Only standalone instances react.
    /// Returns true if it was accepted as a readiness signal.
    pub fn on_message(&self, event: &InboundEvent) -> bool {
        self.shared.handle_inbound(event)
    }

    /// Send the current mode now.
    pub fn send_mode(&self) -> bool {
        self.shared.send_mode()
    }

    pub fn request_ready(&self) -> bool {
        self.shared.request_ready()
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state();
        SyncStatus {
            dark: self.shared.source.resolve(),
            state,
            ready: self.is_ready(),
            using_registry: state == SyncState::Registered,
            stored: self
                .shared
                .adapter
                .store()
                .get(MODE_STORE_KEY)
                .ok()
                .flatten(),
        }
    }

    /// Tear down: cancel scheduled work, unregister or detach the listener.
    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shared.alive.cancel();
        let link = std::mem::replace(&mut *self.shared.link.lock(), Link::Unregistered);
        if let Link::Registered(registration) = link {
            registration.unregister();
        }
        tracing::debug!(origin = self.shared.handle.origin(), "synchronizer unmounted");
    }
}

fn go_standalone(shared: &Arc<Shared>, bus: &MessageBus) {
    *shared.link.lock() = Link::Standalone;
    tracing::debug!(origin = shared.handle.origin(), "running standalone");
    tokio::spawn(listen(
        Arc::downgrade(shared),
        bus.subscribe(),
        shared.alive.child_token(),
    ));
}

async fn late_registration(
    shared: Weak<Shared>,
    registry: ModeRegistry,
    bus: MessageBus,
    cancel: CancellationToken,
) {
    let Some(delay) = shared.upgrade().map(|s| s.options.late_registration) else {
        return;
    };
    tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }
    let Some(shared) = shared.upgrade() else { return };
    if !matches!(*shared.link.lock(), Link::Unregistered) {
        return;
    }
    if !shared.try_register(&registry) {
        go_standalone(&shared, &bus);
    }
}

async fn settle_after_load(shared: Weak<Shared>, cancel: CancellationToken, delay: Duration) {
    tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(delay) => {}
    }
    let Some(shared) = shared.upgrade() else { return };
    if shared.alive.is_cancelled() {
        return;
    }
    shared.send_mode();
    shared.request_ready();
    // Optimistic: no acknowledgement is awaited.
    shared.ready.store(true, Ordering::SeqCst);
}

async fn listen(
    shared: Weak<Shared>,
    mut events: broadcast::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                let Some(shared) = shared.upgrade() else { return };
                shared.handle_inbound(&event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "inbound listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn follow_mode(
    shared: Weak<Shared>,
    mut changes: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        // Restart the quiet period on every further change.
        let debounce = match shared.upgrade() {
            Some(shared) => shared.options.debounce,
            None => return,
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = tokio::time::sleep(debounce) => break,
            }
        }
        let Some(shared) = shared.upgrade() else { return };
        if shared.state() == SyncState::StandaloneReady {
            shared.send_mode();
        }
    }
}
