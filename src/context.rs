//! Task context: the clock and scheduler hooks the client needs from its
//! embedder.
//!
//! Blocking server round trips are bracketed with uninterruptible-sleep
//! markers so the guest scheduler accounts the wait correctly. The bracket
//! is a scoped guard rather than a start/finish call pair, so early returns
//! and panics cannot leave a task marked asleep.

use std::time::{SystemTime, UNIX_EPOCH};

/// Ambient services provided by the embedding kernel. Passed explicitly to
/// every operation that may block or stamp a timestamp.
pub trait Context: Send + Sync {
    /// Current realtime clock reading, in nanoseconds since the Unix epoch.
    fn now_nanos(&self) -> i64;

    /// Mark the current task uninterruptible. Paired with
    /// [`Context::sleep_finish`] by [`UninterruptibleSleep`].
    fn sleep_start(&self) {}

    fn sleep_finish(&self) {}
}

/// Scoped uninterruptible-sleep marker around a blocking server call.
pub struct UninterruptibleSleep<'a> {
    ctx: &'a dyn Context,
}

impl<'a> UninterruptibleSleep<'a> {
    pub fn enter(ctx: &'a dyn Context) -> Self {
        ctx.sleep_start();
        Self { ctx }
    }
}

impl Drop for UninterruptibleSleep<'_> {
    fn drop(&mut self) {
        self.ctx.sleep_finish();
    }
}

/// A context backed by the host realtime clock, with no scheduler hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealtimeContext;

impl Context for RealtimeContext {
    fn now_nanos(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            // A pre-epoch clock is indistinguishable from zero for our
            // purposes.
            Err(_) => 0,
        }
    }
}
