//! Bounded, ordered record channel between the host thread and plugin code.
//!
//! A full channel blocks the producer; that is the only backpressure in the
//! bridge. Dropping the last [`RecordSender`] closes the channel, and the
//! [`RecordReceiver`] still yields every record buffered before the close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Select, SendTimeoutError, Sender, TryRecvError, TrySendError};

use crate::context::Context;
use crate::record::Record;

/// Create a channel holding at most `capacity` records.
///
/// A capacity of zero makes every send wait for a matching receive.
pub fn channel(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = bounded(capacity);
    let counters = Arc::new(Counters::default());
    (
        RecordSender {
            tx,
            counters: counters.clone(),
            capacity,
        },
        RecordReceiver {
            rx,
            counters,
            capacity,
        },
    )
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    blocked_sends: AtomicU64,
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Records accepted by the channel.
    pub sent: u64,
    /// Records handed to the receiver.
    pub received: u64,
    /// Sends that found the channel full and had to wait.
    pub blocked_sends: u64,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            blocked_sends: self.blocked_sends.load(Ordering::Relaxed),
        }
    }
}

/// A record that could not be sent. The record is handed back.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The context was cancelled while waiting for space.
    #[error("send cancelled")]
    Cancelled(Record),
    /// The receiver is gone.
    #[error("channel closed")]
    Closed(Record),
    /// The channel is full (non-blocking send only).
    #[error("channel full")]
    Full(Record),
    /// No space before the deadline.
    #[error("send timed out")]
    Timeout(Record),
}

impl SendError {
    /// Recover the unsent record.
    pub fn into_record(self) -> Record {
        match self {
            Self::Cancelled(r) | Self::Closed(r) | Self::Full(r) | Self::Timeout(r) => r,
        }
    }
}

/// Producer side of a record channel.
#[derive(Debug, Clone)]
pub struct RecordSender {
    tx: Sender<Record>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl RecordSender {
    /// Send a record, waiting for space unless `ctx` is cancelled first.
    pub fn send(&self, ctx: &Context, record: Record) -> Result<(), SendError> {
        if ctx.is_cancelled() {
            return Err(SendError::Cancelled(record));
        }

        let record = match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Disconnected(r)) => return Err(SendError::Closed(r)),
            Err(TrySendError::Full(r)) => r,
        };

        self.counters.blocked_sends.fetch_add(1, Ordering::Relaxed);

        let done = ctx.done_ref();
        let mut sel = Select::new();
        let send_index = sel.send(&self.tx);
        let done_index = sel.recv(done);
        let op = sel.select();

        match op.index() {
            i if i == send_index => match op.send(&self.tx, record) {
                Ok(()) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => Err(SendError::Closed(e.into_inner())),
            },
            i => {
                debug_assert_eq!(i, done_index);
                let _ = op.recv(done);
                Err(SendError::Cancelled(record))
            }
        }
    }

    /// Send a record, waiting for space until `deadline`.
    pub fn send_deadline(&self, record: Record, deadline: Instant) -> Result<(), SendError> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.tx.send_timeout(record, timeout) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(r)) => Err(SendError::Timeout(r)),
            Err(SendTimeoutError::Disconnected(r)) => Err(SendError::Closed(r)),
        }
    }

    /// Send without waiting.
    pub fn try_send(&self, record: Record) -> Result<(), SendError> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(r)) => Err(SendError::Full(r)),
            Err(TrySendError::Disconnected(r)) => Err(SendError::Closed(r)),
        }
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Check if no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

/// Outcome of [`RecordReceiver::recv_or_cancel`].
#[derive(Debug)]
pub enum Received {
    /// The next record.
    Record(Record),
    /// The channel is closed and drained.
    Closed,
    /// The context was cancelled.
    Cancelled,
}

/// Consumer side of a record channel.
///
/// Iterating consumes records in send order and ends only once the channel is
/// closed and empty.
#[derive(Debug)]
pub struct RecordReceiver {
    rx: Receiver<Record>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl RecordReceiver {
    /// Wait for the next record. `None` once the channel is closed and empty.
    pub fn recv(&self) -> Option<Record> {
        let record = self.rx.recv().ok()?;
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Wait for the next record or for cancellation, whichever comes first.
    pub fn recv_or_cancel(&self, ctx: &Context) -> Received {
        if ctx.is_cancelled() {
            return Received::Cancelled;
        }

        crossbeam_channel::select! {
            recv(self.rx) -> record => match record {
                Ok(record) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    Received::Record(record)
                }
                Err(_) => Received::Closed,
            },
            recv(ctx.done_ref()) -> _ => Received::Cancelled,
        }
    }

    /// Take a record if one is buffered.
    pub fn try_recv(&self) -> Option<Record> {
        match self.rx.try_recv() {
            Ok(record) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                Some(record)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Borrowing iterator with the same semantics as consuming iteration.
    pub fn iter(&self) -> impl Iterator<Item = Record> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    /// Take every record buffered right now without waiting.
    pub fn drain(&self) -> impl Iterator<Item = Record> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

impl Iterator for RecordReceiver {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(i: i64) -> Record {
        Record::now("t").with_field("i", i)
    }

    fn index(record: &Record) -> i64 {
        record.get("i").and_then(|v| v.as_i64()).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let ctx = Context::new();
        let (tx, rx) = channel(16);

        for i in 0..10 {
            tx.send(&ctx, record(i)).unwrap();
        }
        drop(tx);

        let got: Vec<i64> = rx.map(|r| index(&r)).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_drains_buffered_records() {
        let ctx = Context::new();
        let (tx, rx) = channel(8);
        for i in 0..5 {
            tx.send(&ctx, record(i)).unwrap();
        }
        drop(tx);

        assert_eq!(rx.iter().count(), 5);
        assert!(rx.recv().is_none());
        assert_eq!(rx.stats().received, 5);
    }

    #[test]
    fn test_backpressure_blocks_sender() {
        let ctx = Context::new();
        let (tx, rx) = channel(2);

        let producer = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for i in 0..6 {
                    tx.send(&ctx, record(i)).unwrap();
                }
                tx.stats()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.len(), 2);

        let got: Vec<i64> = rx.iter().map(|r| index(&r)).collect();
        let stats = producer.join().unwrap();

        assert_eq!(got, (0..6).collect::<Vec<_>>());
        assert_eq!(stats.sent, 6);
        assert!(stats.blocked_sends >= 1);
    }

    #[test]
    fn test_blocked_send_cancelled() {
        let ctx = Context::new();
        let (tx, rx) = channel(1);
        tx.send(&ctx, record(0)).unwrap();

        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };

        let err = tx.send(&ctx, record(1)).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, SendError::Cancelled(_)));
        assert_eq!(index(&err.into_record()), 1);
        // The record accepted before cancellation is still there.
        assert_eq!(rx.try_recv().map(|r| index(&r)), Some(0));
    }

    #[test]
    fn test_send_to_dropped_receiver() {
        let ctx = Context::new();
        let (tx, rx) = channel(1);
        drop(rx);

        assert!(matches!(tx.send(&ctx, record(0)), Err(SendError::Closed(_))));
        assert!(matches!(tx.try_send(record(0)), Err(SendError::Closed(_))));
    }

    #[test]
    fn test_send_deadline_and_try_send() {
        let (tx, _rx) = channel(1);
        tx.try_send(record(0)).unwrap();

        assert!(matches!(tx.try_send(record(1)), Err(SendError::Full(_))));
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(matches!(
            tx.send_deadline(record(1), deadline),
            Err(SendError::Timeout(_))
        ));
    }

    #[test]
    fn test_rendezvous_channel() {
        let ctx = Context::new();
        let (tx, rx) = channel(0);

        let consumer = std::thread::spawn(move || rx.map(|r| index(&r)).collect::<Vec<_>>());
        for i in 0..3 {
            tx.send(&ctx, record(i)).unwrap();
        }
        drop(tx);

        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_recv_or_cancel() {
        let ctx = Context::new();
        let (tx, rx) = channel(4);
        tx.send(&ctx, record(7)).unwrap();

        assert!(matches!(rx.recv_or_cancel(&ctx), Received::Record(r) if index(&r) == 7));

        let canceller = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                ctx.cancel();
            })
        };
        assert!(matches!(rx.recv_or_cancel(&ctx), Received::Cancelled));
        canceller.join().unwrap();

        drop(tx);
        let fresh = Context::new();
        assert!(matches!(rx.recv_or_cancel(&fresh), Received::Closed));
    }
}
