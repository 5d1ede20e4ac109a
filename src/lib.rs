//! Keeps the host's light/dark display mode in step with embedded
//! subordinate contexts that can only be reached over an unreliable,
//! fire-and-forget message channel.

pub mod bus;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod message;
pub mod registry;
pub mod store;
pub mod subordinate;
pub mod sync;
pub mod theme;

#[cfg(test)]
pub(crate) mod testutil;

pub use channel::{ChannelAdapter, DeliveryReport, Outcome};
pub use error::{SendError, StoreError, SyncError};
pub use message::{InboundEvent, InboundMessage, OutboundMessage, Source};
pub use registry::{ModeRegistry, Registration, RegistryScope, RetrySchedule};
pub use subordinate::{Subordinate, SubordinateHandle};
pub use sync::{HostContext, SyncOptions, SyncState, SyncStatus, Synchronizer};
pub use theme::{ColorScheme, ModeSource, Preference, ThemeMode};
