use std::fmt;
use std::sync::Arc;

use crate::error::SendError;
use crate::message::OutboundMessage;

/// One embedded context the host can talk to.
///
/// Implementations wrap whatever the embedding point really is (a sandboxed
/// frame, a socket, a test double). All calls are best-effort and must not
/// block on the subordinate acknowledging anything.
pub trait Subordinate: Send + Sync {
    /// Whether the context currently exposes a live communication endpoint.
    fn is_reachable(&self) -> bool;

    /// Post `message` scoped to `target_origin`.
    fn post_message(&self, message: &OutboundMessage, target_origin: &str)
    -> Result<(), SendError>;

    /// The context's current navigable address, if it has one.
    fn location(&self) -> Option<String>;

    /// Point the context at a new address.
    fn navigate(&self, url: &str) -> Result<(), SendError>;
}

/// Reference to one subordinate plus its trusted origin.
///
/// Identity is the identity of the referenced subordinate: two handles built
/// from clones of the same `Arc` are the same handle.
#[derive(Clone)]
pub struct SubordinateHandle {
    frame: Arc<dyn Subordinate>,
    origin: Arc<str>,
}

impl SubordinateHandle {
    pub fn new(frame: Arc<dyn Subordinate>, origin: impl Into<Arc<str>>) -> Self {
        Self {
            frame,
            origin: origin.into(),
        }
    }

    pub fn frame(&self) -> &dyn Subordinate {
        self.frame.as_ref()
    }

    /// Scope for outbound sends and filter for inbound messages.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn same_as(&self, other: &SubordinateHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.frame), Arc::as_ptr(&other.frame))
    }
}

impl fmt::Debug for SubordinateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubordinateHandle")
            .field("frame", &Arc::as_ptr(&self.frame).cast::<()>())
            .field("origin", &self.origin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeFrame;

    #[test]
    fn identity_is_reference_equality() {
        let a = FakeFrame::new("http://h/");
        let b = FakeFrame::new("http://h/");
        let ha = SubordinateHandle::new(a.clone(), "http://h");
        let ha2 = SubordinateHandle::new(a, "http://other");
        let hb = SubordinateHandle::new(b, "http://h");
        assert!(ha.same_as(&ha2));
        assert!(!ha.same_as(&hb));
    }
}
