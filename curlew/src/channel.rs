//! Cross-thread channels between producers, the reactor and consumers.
//!
//! Submissions travel over a bounded channel guarded by an open/closed gate.
//! Completions travel over an unbounded channel whose eventfd becomes
//! readable once per delivered batch. Releases (dropped completions, closed
//! sessions) travel over an unbounded channel that only the reactor drains.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::completion::Completion;
use crate::engine::TransferId;
use crate::error::Error;
use crate::notify::EventFd;
use crate::request::Token;
use crate::session::SessionKey;
use crate::transfer::Transfer;

/// Work the reactor must do on behalf of a dropped handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// The consumer dropped a completion.
    Transfer { session: SessionKey, id: TransferId },
    /// The last handle of a session was dropped.
    Session(SessionKey),
}

// ── Submissions ────────────────────────────────────────────────────

/// Producer side of the submission channel, shared by every session handle.
pub(crate) struct SubmissionSender {
    tx: Sender<Transfer>,
    // Closed once the reactor starts draining. Senders hold the read lock
    // across the send, so nothing lands after the reactor's final drain.
    open: RwLock<bool>,
    notify: Arc<EventFd>,
    pending: Arc<AtomicBool>,
    next_token: AtomicU64,
}

/// Reactor side of the submission channel.
pub(crate) struct SubmissionReceiver {
    rx: Receiver<Transfer>,
    notify: Arc<EventFd>,
    pending: Arc<AtomicBool>,
}

pub(crate) fn submission(
    capacity: usize,
) -> std::io::Result<(SubmissionSender, SubmissionReceiver)> {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let notify = Arc::new(EventFd::new()?);
    let pending = Arc::new(AtomicBool::new(false));
    Ok((
        SubmissionSender {
            tx,
            open: RwLock::new(true),
            notify: Arc::clone(&notify),
            pending: Arc::clone(&pending),
            next_token: AtomicU64::new(Token::AUTO_BASE),
        },
        SubmissionReceiver {
            rx,
            notify,
            pending,
        },
    ))
}

impl SubmissionSender {
    pub(crate) fn send(&self, transfer: Transfer) -> Result<(), Error> {
        let open = self.open.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            return Err(Error::ReactorStopped);
        }
        match self.tx.try_send(transfer) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(Error::SubmissionQueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(Error::ReactorStopped),
        }
        drop(open);
        // One wakeup per burst: the reactor clears `pending` before draining.
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify();
        }
        Ok(())
    }

    /// Reject every later `send`. Returns once in-progress sends finish.
    pub(crate) fn close(&self) {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.open.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_token(&self) -> Token {
        Token::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }
}

impl SubmissionReceiver {
    /// Reset the wakeup state. Call before draining so a submission racing
    /// with the drain produces a fresh wakeup.
    pub(crate) fn acknowledge(&self) {
        self.pending.store(false, Ordering::Release);
        self.notify.drain();
    }

    pub(crate) fn try_recv(&self) -> Option<Transfer> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.notify.raw_fd()
    }
}

// ── Completions ────────────────────────────────────────────────────

/// Reactor side of the completion channel.
pub(crate) struct CompletionSender {
    tx: Sender<Completion>,
    notify: Arc<EventFd>,
}

/// Consumer side of the completion channel.
///
/// Cloneable; every clone drains the same queue. [`notify_fd`](Self::notify_fd)
/// becomes readable when a batch is delivered, for consumers that integrate
/// with their own event loop.
#[derive(Clone)]
pub struct CompletionReceiver {
    rx: Receiver<Completion>,
    notify: Arc<EventFd>,
}

pub(crate) fn completion() -> std::io::Result<(CompletionSender, CompletionReceiver)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let notify = Arc::new(EventFd::new()?);
    Ok((
        CompletionSender {
            tx,
            notify: Arc::clone(&notify),
        },
        CompletionReceiver { rx, notify },
    ))
}

impl CompletionSender {
    /// Queue a batch and signal the descriptor once.
    pub(crate) fn send_batch(&self, batch: impl Iterator<Item = Completion>) {
        for completion in batch {
            // With every receiver gone the completion is dropped here, which
            // still queues its release.
            let _ = self.tx.send(completion);
        }
        self.notify.notify();
    }
}

impl CompletionReceiver {
    pub fn try_recv(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// Block for the next completion. Returns `None` once the reactor has
    /// exited and the queue is empty.
    pub fn recv(&self) -> Option<Completion> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Completion, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<Completion> {
        self.rx.try_iter().collect()
    }

    /// Descriptor that becomes readable when a batch is delivered.
    pub fn notify_fd(&self) -> RawFd {
        self.notify.raw_fd()
    }

    /// Reset the notification descriptor. Call before draining with
    /// [`try_recv`](Self::try_recv) or [`drain`](Self::drain).
    pub fn acknowledge(&self) {
        self.notify.drain();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
