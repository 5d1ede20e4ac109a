//! Test doubles shared across module tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::SendError;
use crate::message::OutboundMessage;
use crate::subordinate::Subordinate;

/// A subordinate that records everything sent to it.
pub(crate) struct FakeFrame {
    reachable: AtomicBool,
    reject_posts: AtomicBool,
    location: Mutex<Option<String>>,
    posts: Mutex<Vec<(OutboundMessage, String)>>,
    navigations: Mutex<Vec<String>>,
}

impl FakeFrame {
    pub(crate) fn new(location: &str) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            reject_posts: AtomicBool::new(false),
            location: Mutex::new(if location.is_empty() {
                None
            } else {
                Some(location.to_string())
            }),
            posts: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn unreachable(location: &str) -> Arc<Self> {
        let frame = Self::new(location);
        frame.set_reachable(false);
        frame
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn set_reject_posts(&self, reject: bool) {
        self.reject_posts.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn posts(&self) -> Vec<(OutboundMessage, String)> {
        self.posts.lock().clone()
    }

    /// Values of the `DARK_MODE` messages received, in order.
    pub(crate) fn mode_values(&self) -> Vec<bool> {
        self.posts
            .lock()
            .iter()
            .filter_map(|(m, _)| m.mode_value())
            .collect()
    }

    pub(crate) fn ready_requests(&self) -> usize {
        self.posts
            .lock()
            .iter()
            .filter(|(m, _)| matches!(m, OutboundMessage::RequestReady { .. }))
            .count()
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }

    pub(crate) fn current_location(&self) -> Option<String> {
        self.location.lock().clone()
    }

    /// Total transport calls observed (posts + navigations).
    pub(crate) fn transport_calls(&self) -> usize {
        self.posts.lock().len() + self.navigations.lock().len()
    }
}

impl Subordinate for FakeFrame {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn post_message(
        &self,
        message: &OutboundMessage,
        target_origin: &str,
    ) -> Result<(), SendError> {
        if self.reject_posts.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }
        self.posts
            .lock()
            .push((message.clone(), target_origin.to_string()));
        Ok(())
    }

    fn location(&self) -> Option<String> {
        self.location.lock().clone()
    }

    fn navigate(&self, url: &str) -> Result<(), SendError> {
        *self.location.lock() = Some(url.to_string());
        self.navigations.lock().push(url.to_string());
        Ok(())
    }
}
