//! Interrupt flag and pause handling.
//!
//! A scan has exactly one point where control can be injected from outside:
//! the [`InterruptFlag`]. Every blocking wait in the engine races its own
//! polling against this flag, so a pause or abort request is noticed within
//! one polling interval (about 1 ms).
//!
//! When a pause is noticed, the retry wrapper asks a [`PauseHandler`] what to
//! do next. The handler is injected into the engine; the default one simply
//! resumes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::error::{ScanError, ScanResult};

/// Polling interval for every device, permit and motion wait.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pending external request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interrupt {
    /// Nothing requested
    #[default]
    None,
    /// Pause at the next interruptible point
    Pause,
    /// Abort the scan
    Abort,
}

impl std::fmt::Display for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::None => write!(f, "none"),
            Interrupt::Pause => write!(f, "pause"),
            Interrupt::Abort => write!(f, "abort"),
        }
    }
}

/// Cloneable handle to the shared "interrupt-or-pause requested" flag.
///
/// An abort request is sticky: a later pause request never downgrades it.
#[derive(Clone)]
pub struct InterruptFlag {
    tx: Arc<watch::Sender<Interrupt>>,
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptFlag {
    /// Create a flag with nothing requested
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Interrupt::None);
        Self { tx: Arc::new(tx) }
    }

    /// Current request
    pub fn current(&self) -> Interrupt {
        *self.tx.borrow()
    }

    /// Request a pause
    pub fn request_pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == Interrupt::None {
                *state = Interrupt::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Request an abort
    pub fn request_abort(&self) {
        self.tx.send_replace(Interrupt::Abort);
    }

    /// Consume a pending pause request, leaving aborts in place
    pub fn acknowledge_pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == Interrupt::Pause {
                *state = Interrupt::None;
                true
            } else {
                false
            }
        });
    }

    /// Clear every pending request
    pub fn clear(&self) {
        self.tx.send_replace(Interrupt::None);
    }

    /// Map the pending request to the error a blocking operation returns
    pub fn check(&self) -> ScanResult<()> {
        self.check_with(false)
    }

    /// Like [`check`](Self::check), optionally ignoring pause requests
    pub fn check_with(&self, ignore_pause: bool) -> ScanResult<()> {
        match self.current() {
            Interrupt::None => Ok(()),
            Interrupt::Pause if ignore_pause => Ok(()),
            Interrupt::Pause => Err(ScanError::PauseRequested),
            Interrupt::Abort => Err(ScanError::Interrupted),
        }
    }

    /// Resolve once a request is pending and return the matching error
    pub async fn requested(&self, ignore_pause: bool) -> ScanError {
        let mut rx = self.tx.subscribe();
        let pending = rx
            .wait_for(|state| match state {
                Interrupt::None => false,
                Interrupt::Pause => !ignore_pause,
                Interrupt::Abort => true,
            })
            .await
            .map(|state| *state);
        match pending {
            Ok(Interrupt::Pause) => ScanError::PauseRequested,
            Ok(_) => ScanError::Interrupted,
            Err(_) => ScanError::CorruptState("interrupt channel closed".to_string()),
        }
    }

    /// Sleep for `duration` unless a request arrives first
    pub async fn sleep(&self, duration: Duration) -> ScanResult<()> {
        self.check()?;
        tokio::select! {
            _ = sleep(duration) => Ok(()),
            err = self.requested(false) => Err(err),
        }
    }

    /// Poll `ready` every [`POLL_INTERVAL`] until it returns true.
    ///
    /// Returns `PauseRequested` or `Interrupted` as soon as a matching request
    /// is pending. Pause requests are ignored when `ignore_pause` is set.
    pub async fn poll_until<F, Fut>(&self, ignore_pause: bool, mut ready: F) -> ScanResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScanResult<bool>>,
    {
        loop {
            self.check_with(ignore_pause)?;
            if ready().await? {
                return Ok(());
            }
            tokio::select! {
                _ = sleep(POLL_INTERVAL) => {}
                err = self.requested(ignore_pause) => return Err(err),
            }
        }
    }
}

/// What the scan should do after a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    /// Retry the interrupted operation
    Resume,
    /// Let the motors come to rest, then end the scan as stopped
    Stop,
    /// Soft-abort the motors and end the scan as aborted
    Abort,
    /// Another pause arrived while handling this one; treated as `Resume`
    PauseAgain,
}

/// Strategy invoked whenever a scan operation is paused
#[async_trait]
pub trait PauseHandler: Send + Sync {
    /// Decide how to continue the scan named `scan`
    async fn handle_pause(&self, scan: &str) -> ScanResult<PauseDecision>;
}

/// Pause handler that always resumes
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPauseHandler;

#[async_trait]
impl PauseHandler for DefaultPauseHandler {
    async fn handle_pause(&self, scan: &str) -> ScanResult<PauseDecision> {
        debug!(scan = %scan, "Default pause handler resuming");
        Ok(PauseDecision::Resume)
    }
}

/// Pause handler that replays a queue of decisions, then resumes
#[derive(Default)]
pub struct ScriptedPauseHandler {
    decisions: Mutex<VecDeque<PauseDecision>>,
    calls: Mutex<usize>,
}

impl ScriptedPauseHandler {
    /// Create a handler returning `decisions` in order
    pub fn new(decisions: impl IntoIterator<Item = PauseDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    /// Number of pauses handled
    pub async fn calls(&self) -> usize {
        *self.calls.lock().await
    }
}

#[async_trait]
impl PauseHandler for ScriptedPauseHandler {
    async fn handle_pause(&self, _scan: &str) -> ScanResult<PauseDecision> {
        *self.calls.lock().await += 1;
        Ok(self
            .decisions
            .lock()
            .await
            .pop_front()
            .unwrap_or(PauseDecision::Resume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_not_downgraded_by_pause() {
        let flag = InterruptFlag::new();
        flag.request_abort();
        flag.request_pause();
        assert_eq!(flag.current(), Interrupt::Abort);
        flag.acknowledge_pause();
        assert!(matches!(flag.check(), Err(ScanError::Interrupted)));
    }

    #[test]
    fn requested_wakes_only_for_matching_requests() {
        use tokio_test::{assert_pending, assert_ready, task};

        let flag = InterruptFlag::new();
        let mut waiter = task::spawn(flag.requested(true));
        assert_pending!(waiter.poll());

        flag.request_pause();
        assert_pending!(waiter.poll());

        flag.request_abort();
        assert!(waiter.is_woken());
        assert!(matches!(assert_ready!(waiter.poll()), ScanError::Interrupted));

        flag.clear();
        let mut waiter = task::spawn(flag.requested(false));
        assert_pending!(waiter.poll());
        flag.request_pause();
        assert!(matches!(assert_ready!(waiter.poll()), ScanError::PauseRequested));
    }

    #[test]
    fn pause_can_be_ignored() {
        let flag = InterruptFlag::new();
        flag.request_pause();
        assert!(flag.check_with(true).is_ok());
        assert!(matches!(flag.check(), Err(ScanError::PauseRequested)));
        flag.acknowledge_pause();
        assert!(flag.check().is_ok());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_abort() {
        let flag = InterruptFlag::new();
        let remote = flag.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            remote.request_abort();
        });

        let started = std::time::Instant::now();
        let result = flag.sleep(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(ScanError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn poll_until_returns_when_ready() {
        let flag = InterruptFlag::new();
        let mut polls = 0;
        flag.poll_until(false, || {
            polls += 1;
            let done = polls >= 3;
            async move { Ok(done) }
        })
        .await
        .unwrap();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn scripted_handler_falls_back_to_resume() {
        let handler = ScriptedPauseHandler::new([PauseDecision::Stop]);
        assert_eq!(handler.handle_pause("s").await.unwrap(), PauseDecision::Stop);
        assert_eq!(handler.handle_pause("s").await.unwrap(), PauseDecision::Resume);
        assert_eq!(handler.calls().await, 2);
    }
}
