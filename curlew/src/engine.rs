//! Transfer-engine capability.
//!
//! The reactor never interprets protocol state. It hands requests to a
//! [`TransferEngine`], forwards socket readiness and timeouts to it, and
//! receives socket-interest changes, timer requests and response bytes back
//! through [`EngineCallbacks`]. One engine instance serves one
//! [`Session`](crate::Session) and is only ever touched by the reactor
//! thread.

use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

use crate::error::{Error, TransferError};
use crate::request::Request;

/// Reactor-assigned handle for one transfer inside an engine.
///
/// The generation distinguishes a reused index from the transfer that held
/// it before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TransferId {
    /// Construct an id directly. The reactor assigns ids itself; this is for
    /// driving an engine outside a reactor.
    pub const fn new(index: u32, generation: u32) -> Self {
        TransferId { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// What an engine wants to hear about a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    /// Keep the socket known but report nothing.
    None,
    Read,
    Write,
    ReadWrite,
    /// Forget the socket entirely.
    Remove,
}

/// Readiness reported for a socket.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b001);
    pub const WRITABLE: Readiness = Readiness(0b010);
    pub const ERROR: Readiness = Readiness(0b100);

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READABLE");
        }
        if self.is_writable() {
            set.entry(&"WRITABLE");
        }
        if self.is_error() {
            set.entry(&"ERROR");
        }
        set.finish()
    }
}

/// Target of a [`TransferEngine::socket_action`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTarget {
    Socket(RawFd),
    /// The session timer fired, or the engine asked to be driven at once.
    Timeout,
}

/// Calls an engine makes back into the reactor.
///
/// Only valid for the duration of the engine call it was passed to.
pub trait EngineCallbacks {
    /// Replace the readiness interest of `socket`. Each call supersedes the
    /// previous one for that socket.
    fn socket_interest(&mut self, socket: RawFd, interest: SocketInterest);

    /// Set the session timer. A negative value cancels it, zero asks to be
    /// driven with [`SocketTarget::Timeout`] as soon as the current call
    /// returns, and a positive value fires once after that many
    /// milliseconds. Any previously requested timer is replaced.
    fn timer(&mut self, timeout_ms: i64);

    /// Append one raw header line (terminator included) to the transfer's
    /// header chain. Returns the number of bytes taken.
    fn header(&mut self, id: TransferId, chunk: &[u8]) -> usize;

    /// Append decoded body bytes. Returns the number of bytes taken.
    fn body(&mut self, id: TransferId, chunk: &[u8]) -> usize;
}

/// A finished-transfer notice from [`TransferEngine::info_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub id: TransferId,
    pub result: Result<(), TransferError>,
}

/// Phase timings of a transfer, in seconds from its start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub total: f64,
    pub name_lookup: f64,
    pub connect: f64,
    pub app_connect: f64,
    pub pre_transfer: f64,
    pub start_transfer: f64,
}

/// Byte counts of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSizes {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Post-transfer metadata read from an engine after it reports a finish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferInfo {
    pub response_code: u32,
    pub effective_url: Option<String>,
    /// Resolved target of a redirect response. Redirects are not followed.
    pub redirect_url: Option<String>,
    pub timings: Timings,
    pub sizes: TransferSizes,
    /// Snapshot of the session cookie store in Netscape format.
    pub cookies: Vec<String>,
}

/// Socket-driven multi-transfer engine.
///
/// Lifecycle of one transfer: [`add`](Self::add), any number of
/// [`socket_action`](Self::socket_action) calls, a [`Finished`] from
/// [`info_read`](Self::info_read), then [`remove`](Self::remove),
/// [`info`](Self::info) and [`retire`](Self::retire) on the same pass.
/// [`cleanup`](Self::cleanup) follows later, once the consumer has released
/// the completion. An id is never reused before its `cleanup`.
pub trait TransferEngine {
    /// Start a transfer. The engine must not call back with response data
    /// from inside `add`; it typically asks for `timer(0)` instead.
    fn add(
        &mut self,
        id: TransferId,
        request: &Request,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), TransferError>;

    /// Drive the engine after readiness on a socket or a timeout. Returns
    /// the number of transfers still running.
    fn socket_action(
        &mut self,
        target: SocketTarget,
        readiness: Readiness,
        cb: &mut dyn EngineCallbacks,
    ) -> usize;

    /// Next finished transfer, if any.
    fn info_read(&mut self) -> Option<Finished>;

    /// Detach a finished transfer from the engine's driving state.
    fn remove(&mut self, id: TransferId);

    /// Metadata of a removed transfer.
    fn info(&self, id: TransferId) -> Option<TransferInfo>;

    /// Release per-transfer request resources (headers, body, credentials).
    fn retire(&mut self, id: TransferId);

    /// Destroy the remaining per-transfer state.
    fn cleanup(&mut self, id: TransferId);

    /// Transfers added and not yet finished.
    fn running(&self) -> usize;

    /// Periodic maintenance, run from the reactor's housekeeping timer.
    fn housekeeping(&mut self, _cb: &mut dyn EngineCallbacks) {}
}

/// Creates one engine per session, on the reactor thread, at first use.
pub trait EngineFactory: Send + 'static {
    type Engine: TransferEngine;

    fn create(&self) -> Result<Self::Engine, Error>;
}
