//! Keep-alive capability injected by the host.
//!
//! The host decides what "staying alive" means (lease renewal, heartbeat,
//! nothing at all). The turn runner only promises to call `extend()` while
//! the session is active.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::session::SessionStatus;

pub trait KeepAlive: Send + Sync {
    /// Push back the host's idle deadline.
    fn extend(&self);
}

/// For hosts without an idle-eviction policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopKeepAlive;

impl KeepAlive for NoopKeepAlive {
    fn extend(&self) {}
}

/// Calls `extend()` at most once per interval, and only while the session
/// is streaming.
pub struct KeepAliveTicker {
    handle: Arc<dyn KeepAlive>,
    interval: Duration,
    last: Option<Instant>,
}

impl KeepAliveTicker {
    pub fn new(handle: Arc<dyn KeepAlive>, interval: Duration) -> Self {
        Self {
            handle,
            interval,
            last: None,
        }
    }

    /// Returns true when `extend()` was called.
    pub fn tick(&mut self, status: SessionStatus) -> bool {
        if !status.is_active() {
            return false;
        }
        let now = Instant::now();
        if self
            .last
            .is_some_and(|last| now.duration_since(last) < self.interval)
        {
            return false;
        }
        trace!(%status, "extending keep-alive");
        self.handle.extend();
        self.last = Some(now);
        true
    }
}
