//! Cancellation handle threaded through every plugin call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;

/// Why a context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// `cancel` was called, usually because the host asked for shutdown.
    Cancelled,
    /// The context deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "context cancelled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    // Dropped on cancel, which disconnects every `done` receiver.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    deadline: Option<Instant>,
}

/// Cancellation signal with an optional deadline.
///
/// Clones share state. A context is cancelled at most once; the first
/// cancellation fixes the [`CancelReason`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a context with no deadline.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a context that cancels itself at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        let ctx = Self::build(Some(deadline));

        let weak: Weak<Inner> = Arc::downgrade(&ctx.inner);
        let done = ctx.inner.done_rx.clone();
        std::thread::spawn(move || {
            select! {
                recv(done) -> _ => {}
                recv(crossbeam_channel::at(deadline)) -> _ => {
                    if let Some(inner) = weak.upgrade() {
                        Context { inner }.cancel_with(CancelReason::DeadlineExceeded);
                    }
                }
            }
        });

        ctx
    }

    /// Create a context that cancels itself after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (done_tx, done_rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
                deadline,
            }),
        }
    }

    /// Cancel the context. Returns `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancel_with(CancelReason::Cancelled)
    }

    fn cancel_with(&self, reason: CancelReason) -> bool {
        let mut done_tx = self.inner.done_tx.lock();
        let Some(tx) = done_tx.take() else {
            return false;
        };
        *self.inner.reason.lock() = Some(reason);
        self.inner.cancelled.store(true, Ordering::Release);
        drop(tx);
        true
    }

    /// Check whether the context is cancelled or past its deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel_with(CancelReason::DeadlineExceeded);
                true
            }
            _ => false,
        }
    }

    /// Why the context was cancelled, if it was.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.is_cancelled() {
            *self.inner.reason.lock()
        } else {
            None
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// A receiver that disconnects when the context is cancelled.
    ///
    /// Nothing is ever sent on it, so it fits a `select!` arm:
    ///
    /// ```rust,ignore
    /// select! {
    ///     recv(work) -> item => handle(item),
    ///     recv(ctx.done()) -> _ => return Ok(()),
    /// }
    /// ```
    pub fn done(&self) -> Receiver<()> {
        self.inner.done_rx.clone()
    }

    /// Sleep for `duration` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        select! {
            recv(self.inner.done_rx) -> _ => true,
            default(duration) => self.is_cancelled(),
        }
    }

    /// Block until the context is cancelled.
    pub fn wait(&self) {
        let _ = self.inner.done_rx.recv();
    }

    pub(crate) fn done_ref(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.inner.cancelled.load(Ordering::Acquire))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_once() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.reason(), None);

        assert!(ctx.cancel());
        assert!(!ctx.cancel());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = Context::new();
        let clone = ctx.clone();

        clone.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_done_disconnects_on_cancel() {
        let ctx = Context::new();
        let done = ctx.done();
        assert!(done.try_recv().is_err());

        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.wait())
        };
        ctx.cancel();

        waiter.join().unwrap();
        assert!(matches!(
            done.recv_timeout(Duration::from_secs(1)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_deadline_cancels() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        assert!(ctx.deadline().is_some());

        ctx.wait();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));

        // A later explicit cancel does not change the reason.
        assert!(!ctx.cancel());
        assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[test]
    fn test_sleep_interrupted() {
        let ctx = Context::new();
        assert!(!ctx.sleep(Duration::from_millis(5)));

        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };

        let started = Instant::now();
        assert!(ctx.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }
}
