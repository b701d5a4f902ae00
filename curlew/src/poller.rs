//! Readiness multiplexer and timer wheel for the reactor thread.
//!
//! Sockets are registered edge-triggered with their owning session. Timers
//! are one-shot and kept in deadline order; the poll timeout is bounded by
//! the earliest deadline.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::engine::{Readiness, SocketInterest};
use crate::metrics;
use crate::session::SessionKey;

pub(crate) const SUBMISSION: Token = Token(0);
pub(crate) const CONTROL: Token = Token(1);
const SOCKET_BASE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Session(SessionKey),
    Housekeeping,
}

/// One unit of work produced by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Submission,
    Control,
    Socket {
        session: SessionKey,
        fd: RawFd,
        readiness: Readiness,
    },
    Timer(TimerId, TimerEvent),
}

struct SocketEntry {
    session: SessionKey,
    // None: known to the session but not registered with the kernel.
    interest: Option<Interest>,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    sockets: HashMap<RawFd, SocketEntry>,
    timers: BTreeMap<(Instant, TimerId), TimerEvent>,
    deadlines: HashMap<TimerId, Instant>,
    next_timer: u64,
}

impl Poller {
    pub(crate) fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            sockets: HashMap::new(),
            timers: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_timer: 0,
        })
    }

    /// Register a notification descriptor under a reserved token.
    pub(crate) fn register_notify(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Replace the interest of `fd`, owned by `session`.
    pub(crate) fn set_interest(
        &mut self,
        fd: RawFd,
        session: SessionKey,
        interest: SocketInterest,
    ) -> io::Result<()> {
        let wanted = match interest {
            SocketInterest::None => None,
            SocketInterest::Read => Some(Interest::READABLE),
            SocketInterest::Write => Some(Interest::WRITABLE),
            SocketInterest::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
            SocketInterest::Remove => {
                if let Some(entry) = self.sockets.remove(&fd) {
                    metrics::SOCKETS_REGISTERED.decrement();
                    if entry.interest.is_some() {
                        self.deregister(fd)?;
                    }
                }
                return Ok(());
            }
        };

        let registry = self.poll.registry();
        let token = Token(fd as usize + SOCKET_BASE);
        let previous = match self.sockets.get(&fd) {
            Some(entry) => entry.interest,
            None => {
                metrics::SOCKETS_REGISTERED.increment();
                None
            }
        };
        match (previous, wanted) {
            (None, None) => {}
            (None, Some(interest)) => {
                match registry.register(&mut SourceFd(&fd), token, interest) {
                    // The kernel still has a registration we forgot about.
                    Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                        registry.reregister(&mut SourceFd(&fd), token, interest)?
                    }
                    other => other?,
                }
            }
            (Some(_), Some(interest)) => {
                match registry.reregister(&mut SourceFd(&fd), token, interest) {
                    // The descriptor was closed and its number reused.
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                        registry.register(&mut SourceFd(&fd), token, interest)?
                    }
                    other => other?,
                }
            }
            (Some(_), None) => self.deregister(fd)?,
        }
        self.sockets.insert(
            fd,
            SocketEntry {
                session,
                interest: wanted,
            },
        );
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // Closing a descriptor drops its registration implicitly.
            Err(e)
                if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    /// Forget every socket owned by `session` without touching the kernel
    /// registrations of descriptors it no longer owns.
    pub(crate) fn forget_session(&mut self, session: SessionKey) {
        let fds: Vec<RawFd> = self
            .sockets
            .iter()
            .filter(|(_, e)| e.session == session)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            if let Err(e) = self.set_interest(fd, session, SocketInterest::Remove) {
                tracing::warn!(fd, error = %e, "deregister on session close failed");
            }
        }
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    // ── Timers ─────────────────────────────────────────────────────

    pub(crate) fn arm(&mut self, after: Duration, event: TimerEvent) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        let deadline = Instant::now() + after;
        self.timers.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Disarm a timer. Returns false if it already fired or was cancelled.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.timers.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub(crate) fn armed(&self) -> usize {
        self.timers.len()
    }

    /// Armed timers carrying `event`.
    pub(crate) fn armed_for(&self, event: TimerEvent) -> usize {
        self.timers.values().filter(|e| **e == event).count()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    // ── Poll ───────────────────────────────────────────────────────

    /// Wait for readiness or the earliest timer, at most `max_wait`, and
    /// append the resulting work to `out`: readiness first, then timers in
    /// deadline order.
    pub(crate) fn poll(&mut self, max_wait: Duration, out: &mut Vec<Dispatch>) -> io::Result<()> {
        let wait = match self.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(max_wait),
            None => max_wait,
        };
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        metrics::POLLS.increment();

        for event in self.events.iter() {
            match event.token() {
                SUBMISSION => out.push(Dispatch::Submission),
                CONTROL => out.push(Dispatch::Control),
                Token(t) => {
                    let fd = (t - SOCKET_BASE) as RawFd;
                    let Some(entry) = self.sockets.get(&fd) else {
                        continue;
                    };
                    let mut readiness = Readiness::EMPTY;
                    if event.is_readable() || event.is_read_closed() {
                        readiness |= Readiness::READABLE;
                    }
                    if event.is_writable() || event.is_write_closed() {
                        readiness |= Readiness::WRITABLE;
                    }
                    if event.is_error() {
                        readiness |= Readiness::ERROR;
                    }
                    out.push(Dispatch::Socket {
                        session: entry.session,
                        fd,
                        readiness,
                    });
                }
            }
        }

        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            let event = entry.remove();
            self.deadlines.remove(&id);
            out.push(Dispatch::Timer(id, event));
        }
        Ok(())
    }
}
