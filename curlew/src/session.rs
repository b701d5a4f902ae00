//! Sessions: multiplexing contexts sharing one transfer engine.
//!
//! The producer side is [`Session`], a cheap cloneable handle. The reactor
//! side is [`SessionState`], created lazily when the first request of a
//! session is admitted and destroyed once the last handle is gone and no
//! transfer of the session holds engine state.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, trace};

use crate::channel::{Release, SubmissionSender};
use crate::completion::{Completion, ReleaseTicket};
use crate::engine::{
    EngineCallbacks, Finished, Readiness, SocketInterest, SocketTarget, TransferEngine,
    TransferId,
};
use crate::error::{Error, fatal};
use crate::metrics;
use crate::poller::{Poller, TimerEvent, TimerId};
use crate::request::{Request, Token};
use crate::transfer::{Transfer, TransferTable};

/// Identifies a session on its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(u64);

impl SessionKey {
    pub(crate) const fn new(value: u64) -> Self {
        SessionKey(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Handle for submitting requests into one session.
///
/// Transfers of a session share its engine: connection reuse, DNS cache and
/// cookie store. Handles are `Send + Sync` and cheap to clone. When the last
/// clone is dropped the reactor tears the session down after its remaining
/// transfers are released.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    key: SessionKey,
    submissions: Arc<SubmissionSender>,
    releases: Sender<Release>,
    used: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        key: SessionKey,
        submissions: Arc<SubmissionSender>,
        releases: Sender<Release>,
    ) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                key,
                submissions,
                releases,
                used: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.inner.key
    }

    /// Submit a request. Never blocks on network activity.
    ///
    /// Returns the request's token, assigning a fresh one if the request has
    /// none. Malformed requests are rejected here with
    /// [`Error::InvalidRequest`] and nothing is queued.
    pub fn submit(&self, request: impl Into<Request>) -> Result<Token, Error> {
        let request = request.into();
        request.validate()?;
        let token = match request.token() {
            Some(token) => token,
            None => self.inner.submissions.next_token(),
        };
        self.inner.used.store(true, Ordering::Release);
        self.inner
            .submissions
            .send(Transfer::new(self.inner.key, token, request))?;
        metrics::TRANSFERS_SUBMITTED.increment();
        Ok(token)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("key", &self.inner.key).finish()
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // A session that never submitted has no reactor state.
        if self.used.load(Ordering::Acquire) {
            let _ = self.releases.send(Release::Session(self.key));
        }
    }
}

// ── Reactor side ───────────────────────────────────────────────────

/// Reactor-owned state of one session.
pub(crate) struct SessionState<E> {
    key: SessionKey,
    engine: E,
    transfers: TransferTable,
    timer: Option<TimerId>,
    kick: bool,
    closing: bool,
}

/// Output of a session step: finished transfers and where their releases go.
pub(crate) struct Harvest<'a> {
    pub(crate) ready: &'a mut Vec<Completion>,
    pub(crate) releases: &'a Sender<Release>,
}

impl<E: TransferEngine> SessionState<E> {
    pub(crate) fn new(key: SessionKey, engine: E) -> Self {
        SessionState {
            key,
            engine,
            transfers: TransferTable::new(),
            timer: None,
            kick: false,
            closing: false,
        }
    }

    /// Hand a transfer to the engine.
    pub(crate) fn start(&mut self, poller: &mut Poller, transfer: Transfer, out: &mut Harvest<'_>) {
        let id = self.transfers.next_id();
        let added = {
            let mut glue = Glue {
                key: self.key,
                poller: &mut *poller,
                transfers: &mut self.transfers,
                timer: &mut self.timer,
                kick: &mut self.kick,
            };
            self.engine.add(id, &transfer.request, &mut glue)
        };
        match added {
            Ok(()) => {
                let inserted = self.transfers.insert(transfer);
                debug_assert_eq!(inserted, id);
                metrics::TRANSFERS_STARTED.increment();
                metrics::TRANSFERS_IN_FLIGHT.increment();
                trace!(session = self.key.0, ?id, "transfer started");
                if std::mem::take(&mut self.kick) {
                    self.socket_action(poller, SocketTarget::Timeout, Readiness::EMPTY, out);
                }
            }
            Err(err) => {
                debug!(session = self.key.0, error = %err, "engine rejected transfer");
                metrics::TRANSFERS_FAILED.increment();
                out.ready.push(Completion::rejected(transfer, err));
            }
        }
    }

    /// Drive the engine, then collect whatever finished. Repeats while the
    /// engine asks to be driven again at once.
    pub(crate) fn socket_action(
        &mut self,
        poller: &mut Poller,
        mut target: SocketTarget,
        mut readiness: Readiness,
        out: &mut Harvest<'_>,
    ) {
        loop {
            let mut glue = Glue {
                key: self.key,
                poller: &mut *poller,
                transfers: &mut self.transfers,
                timer: &mut self.timer,
                kick: &mut self.kick,
            };
            self.engine.socket_action(target, readiness, &mut glue);
            metrics::SOCKET_ACTIONS.increment();
            self.harvest(out);
            if !std::mem::take(&mut self.kick) {
                break;
            }
            target = SocketTarget::Timeout;
            readiness = Readiness::EMPTY;
        }
    }

    /// The session timer fired. Stale ids (replaced after they were already
    /// collected by the poller) are ignored.
    pub(crate) fn on_timer(&mut self, poller: &mut Poller, id: TimerId, out: &mut Harvest<'_>) {
        if self.timer != Some(id) {
            return;
        }
        self.timer = None;
        metrics::TIMERS_FIRED.increment();
        self.socket_action(poller, SocketTarget::Timeout, Readiness::EMPTY, out);
    }

    pub(crate) fn housekeeping(&mut self, poller: &mut Poller, out: &mut Harvest<'_>) {
        {
            let mut glue = Glue {
                key: self.key,
                poller: &mut *poller,
                transfers: &mut self.transfers,
                timer: &mut self.timer,
                kick: &mut self.kick,
            };
            self.engine.housekeeping(&mut glue);
        }
        if std::mem::take(&mut self.kick) {
            self.socket_action(poller, SocketTarget::Timeout, Readiness::EMPTY, out);
        }
    }

    fn harvest(&mut self, out: &mut Harvest<'_>) {
        while let Some(Finished { id, result }) = self.engine.info_read() {
            self.engine.remove(id);
            let info = self.engine.info(id).unwrap_or_default();
            self.engine.retire(id);
            let Some(transfer) = self.transfers.retire(id) else {
                debug!(session = self.key.0, ?id, "finish for unknown transfer");
                continue;
            };
            metrics::TRANSFERS_IN_FLIGHT.decrement();
            if result.is_ok() {
                metrics::TRANSFERS_COMPLETED.increment();
            } else {
                metrics::TRANSFERS_FAILED.increment();
            }
            trace!(session = self.key.0, ?id, ok = result.is_ok(), "transfer finished");
            let ticket = ReleaseTicket::new(self.key, id, out.releases.clone());
            out.ready.push(Completion::finished(transfer, result, info, ticket));
        }
    }

    /// The consumer dropped the completion for `id`.
    pub(crate) fn release(&mut self, id: TransferId) {
        if self.transfers.release(id) {
            self.engine.cleanup(id);
            metrics::TRANSFERS_RELEASED.increment();
        }
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Closing and holding no transfer slot.
    pub(crate) fn is_done(&self) -> bool {
        self.closing && self.transfers.is_empty()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.transfers.in_flight()
    }

    /// Disarm the timer and forget the session's sockets.
    pub(crate) fn teardown(&mut self, poller: &mut Poller) {
        if let Some(id) = self.timer.take() {
            poller.cancel(id);
        }
        poller.forget_session(self.key);
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }
}

/// Callback adapter between an engine and the reactor's poller and
/// transfer table.
struct Glue<'a> {
    key: SessionKey,
    poller: &'a mut Poller,
    transfers: &'a mut TransferTable,
    timer: &'a mut Option<TimerId>,
    kick: &'a mut bool,
}

impl EngineCallbacks for Glue<'_> {
    fn socket_interest(&mut self, socket: RawFd, interest: SocketInterest) {
        trace!(session = self.key.0, socket, ?interest, "socket interest");
        if let Err(e) = self.poller.set_interest(socket, self.key, interest) {
            fatal("socket registration", e);
        }
    }

    fn timer(&mut self, timeout_ms: i64) {
        if let Some(id) = self.timer.take() {
            self.poller.cancel(id);
        }
        match timeout_ms {
            ms if ms > 0 => {
                let id = self.poller.arm(
                    Duration::from_millis(ms as u64),
                    TimerEvent::Session(self.key),
                );
                *self.timer = Some(id);
                metrics::TIMERS_ARMED.increment();
            }
            0 => *self.kick = true,
            _ => {}
        }
    }

    fn header(&mut self, id: TransferId, chunk: &[u8]) -> usize {
        if let Some(transfer) = self.transfers.get_mut(id) {
            transfer.headers.append(chunk);
            metrics::HEADER_BYTES.add(chunk.len() as u64);
        }
        chunk.len()
    }

    fn body(&mut self, id: TransferId, chunk: &[u8]) -> usize {
        if let Some(transfer) = self.transfers.get_mut(id) {
            transfer.body.append(chunk);
            metrics::BODY_BYTES.add(chunk.len() as u64);
        }
        chunk.len()
    }
}
