//! Status poll scheduler
//!
//! Periodically asks the firmware for a status report with a realtime byte.
//! A new request is only written once the previous one was answered; if
//! answers stop coming, the outstanding count is forgotten after
//! `max_outstanding` ticks so a lost report never stalls polling for good.

use gcodestream_core::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Something the poll timer can ask for a status report
pub trait StatusRequester: Send + Sync + 'static {
    /// A request may be written now (connected, link open)
    fn can_poll(&self) -> bool;

    /// Write the realtime status request
    fn request_status(&self) -> Result<()>;
}

/// Poll timer settings and bookkeeping, shared with its task
#[derive(Debug)]
pub struct StatusPollTimer {
    enabled: AtomicBool,
    rate_ms: AtomicU64,
    min_rate_ms: u64,
    outstanding: AtomicU32,
    max_outstanding: AtomicU32,
}

impl StatusPollTimer {
    /// Create a timer polling every `rate_ms` (never faster than `min_rate_ms`)
    pub fn new(rate_ms: u64, min_rate_ms: u64, enabled: bool, max_outstanding: u32) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            rate_ms: AtomicU64::new(rate_ms.max(min_rate_ms)),
            min_rate_ms,
            outstanding: AtomicU32::new(0),
            max_outstanding: AtomicU32::new(max_outstanding.max(1)),
        }
    }

    /// Turn polling on or off; the task keeps running either way
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Polling is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Change the interval; applies from the next tick
    pub fn set_rate_ms(&self, rate_ms: u64) {
        let rate_ms = rate_ms.max(self.min_rate_ms);
        tracing::debug!("Status poll rate set to {}ms", rate_ms);
        self.rate_ms.store(rate_ms, Ordering::SeqCst);
    }

    /// Current interval in milliseconds
    pub fn rate_ms(&self) -> u64 {
        self.rate_ms.load(Ordering::SeqCst)
    }

    /// Change how many unanswered ticks are tolerated
    pub fn set_max_outstanding(&self, max_outstanding: u32) {
        self.max_outstanding
            .store(max_outstanding.max(1), Ordering::SeqCst);
    }

    /// A status report arrived
    pub fn report_received(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
    }

    /// Forget any unanswered request (new session, reset)
    pub fn reset(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
    }

    /// Ticks since the last request was written without an answer
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Decide whether this tick writes a request
    pub fn should_poll(&self) -> bool {
        if self
            .outstanding
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
        let waited = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        if waited >= self.max_outstanding.load(Ordering::SeqCst) {
            tracing::debug!("No status report after {} polls, polling again", waited);
            self.outstanding.store(0, Ordering::SeqCst);
        }
        false
    }

    /// Run the timer until the returned task is aborted
    pub fn spawn<R: StatusRequester>(self: &Arc<Self>, requester: Arc<R>) -> JoinHandle<()> {
        let timer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(timer.rate_ms())).await;
                if !timer.is_enabled() || !requester.can_poll() {
                    continue;
                }
                if timer.should_poll() {
                    if let Err(e) = requester.request_status() {
                        tracing::debug!("Status request not written: {}", e);
                        timer.reset();
                    }
                }
            }
        })
    }
}

impl Default for StatusPollTimer {
    fn default() -> Self {
        Self::new(200, 50, true, 20)
    }
}
