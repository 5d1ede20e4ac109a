//! Delivery of a mode value to one subordinate over every available transport.
//!
//! Three strategies run independently on each delivery:
//!
//! 1. message passing, scoped to the handle's origin;
//! 2. rewriting the subordinate's address with `dark_mode` / `dm_sync`;
//! 3. writing the value to the persistent fallback store.
//!
//! A failing strategy is logged and never stops the others. The store write
//! does not touch the subordinate, so it also runs when the endpoint is not
//! reachable yet; the other two need a live endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use url::Url;

use crate::message::{OutboundMessage, Source, now_millis};
use crate::store::{KeyValueStore, MODE_STORE_KEY};
use crate::subordinate::SubordinateHandle;

pub const DARK_MODE_PARAM: &str = "dark_mode";
pub const SYNC_TOKEN_PARAM: &str = "dm_sync";

/// Result of one strategy within a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Nothing to do (no address, or address already up to date).
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub reachable: bool,
    pub message: Outcome,
    pub url: Outcome,
    pub persisted: Outcome,
    /// Token minted for the URL strategy, if it ran.
    pub sync_token: Option<i64>,
}

impl DeliveryReport {
    fn unreachable(persisted: Outcome) -> Self {
        Self {
            reachable: false,
            message: Outcome::Skipped,
            url: Outcome::Skipped,
            persisted,
            sync_token: None,
        }
    }

    /// False only when the handle had no reachable endpoint at all.
    pub fn delivered(&self) -> bool {
        self.reachable
    }
}

pub struct ChannelAdapter {
    store: Arc<dyn KeyValueStore>,
    last_token: AtomicI64,
}

impl ChannelAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            last_token: AtomicI64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Deliver `is_dark` to `handle`. Returns false if it was unreachable.
    pub fn deliver(&self, handle: &SubordinateHandle, is_dark: bool, source: Source) -> bool {
        self.deliver_with_report(handle, is_dark, source).delivered()
    }

    pub fn deliver_with_report(
        &self,
        handle: &SubordinateHandle,
        is_dark: bool,
        source: Source,
    ) -> DeliveryReport {
        let persisted = self.persist(is_dark);
        if !handle.frame().is_reachable() {
            tracing::debug!(origin = handle.origin(), "cannot deliver, endpoint not reachable");
            return DeliveryReport::unreachable(persisted);
        }

        let message = self.post_mode(handle, is_dark, source);
        let sync_token = self.next_sync_token();
        let url = self.apply_url_fallback(handle, is_dark, sync_token);

        DeliveryReport {
            reachable: true,
            message,
            url,
            persisted,
            sync_token: Some(sync_token),
        }
    }

    /// Ask the subordinate to announce readiness. Message passing only.
    pub fn request_ready(&self, handle: &SubordinateHandle, source: Source) -> bool {
        if !handle.frame().is_reachable() {
            return false;
        }
        let message = OutboundMessage::request_ready(source);
        match handle.frame().post_message(&message, handle.origin()) {
            Ok(()) => {
                tracing::debug!(origin = handle.origin(), ?source, "requested ready state");
                true
            }
            Err(e) => {
                tracing::warn!(origin = handle.origin(), "ready request failed: {e}");
                false
            }
        }
    }

    fn post_mode(&self, handle: &SubordinateHandle, is_dark: bool, source: Source) -> Outcome {
        let message = OutboundMessage::dark_mode(is_dark, source);
        match handle.frame().post_message(&message, handle.origin()) {
            Ok(()) => {
                tracing::debug!(origin = handle.origin(), is_dark, ?source, "sent mode message");
                Outcome::Sent
            }
            Err(e) => {
                tracing::warn!(origin = handle.origin(), "mode message failed: {e}");
                Outcome::Failed
            }
        }
    }

    /// Rewrite the subordinate's address with the mode and `token`.
    /// Navigates only when something other than the token would change.
    pub fn apply_url_fallback(
        &self,
        handle: &SubordinateHandle,
        is_dark: bool,
        token: i64,
    ) -> Outcome {
        let Some(current) = handle.frame().location().filter(|l| !l.is_empty()) else {
            return Outcome::Skipped;
        };
        let next = match mode_url(&current, is_dark, token) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(address = %current, "URL fallback failed: {e}");
                return Outcome::Failed;
            }
        };
        if !address_changes(&current, &next) {
            return Outcome::Skipped;
        }
        match handle.frame().navigate(next.as_str()) {
            Ok(()) => {
                tracing::debug!(address = %next, is_dark, "updated subordinate address");
                Outcome::Sent
            }
            Err(e) => {
                tracing::warn!(address = %next, "navigation failed: {e}");
                Outcome::Failed
            }
        }
    }

    pub fn persist(&self, is_dark: bool) -> Outcome {
        match self.store.set(MODE_STORE_KEY, flag(is_dark)) {
            Ok(()) => Outcome::Sent,
            Err(e) => {
                tracing::debug!("could not persist mode: {e}");
                Outcome::Failed
            }
        }
    }

    /// Epoch-ms token, strictly increasing across calls.
    fn next_sync_token(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last_token.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_token
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

fn flag(is_dark: bool) -> &'static str {
    if is_dark { "1" } else { "0" }
}

/// Copy of `current` with `dark_mode` and `dm_sync` set. An existing
/// parameter is overwritten where it sits; a missing one is appended.
pub fn mode_url(current: &str, is_dark: bool, token: i64) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(current)?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    set_param(&mut pairs, DARK_MODE_PARAM, flag(is_dark));
    set_param(&mut pairs, SYNC_TOKEN_PARAM, &token.to_string());
    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url)
}

/// Overwrite the first `key` in place and drop any repeats, or append.
fn set_param(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    let mut seen = false;
    pairs.retain_mut(|(k, v)| {
        if k != key {
            return true;
        }
        if seen {
            return false;
        }
        seen = true;
        *v = value.to_string();
        true
    });
    if !seen {
        pairs.push((key.to_string(), value.to_string()));
    }
}

fn address_changes(current: &str, next: &Url) -> bool {
    match Url::parse(current) {
        Ok(current) => without_token(&current) != without_token(next),
        Err(_) => true,
    }
}

fn without_token(url: &Url) -> Url {
    let mut url = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != SYNC_TOKEN_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url
}
