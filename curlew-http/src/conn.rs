//! Outbound connections.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::time::Instant;

use curlew::{EngineCallbacks, SocketInterest};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::HttpError;
use crate::stream::Stream;
use crate::target::PoolKey;

/// Start a non-blocking connect. The connect completes, or fails, once the
/// socket turns writable.
pub(crate) fn connect(addr: SocketAddr, nodelay: bool) -> Result<TcpStream, HttpError> {
    let fail = |source: io::Error| HttpError::Connect { addr, source };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(fail)?;
    socket.set_nonblocking(true).map_err(fail)?;
    if nodelay {
        socket.set_nodelay(true).map_err(fail)?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(fail(e)),
    }
    Ok(socket.into())
}

/// A connection owned by one transfer or parked in the idle pool.
pub(crate) struct Conn {
    pub(crate) stream: Stream,
    pub(crate) key: PoolKey,
    pub(crate) peer: SocketAddr,
    fd: RawFd,
    interest: SocketInterest,
    /// Completed request/response exchanges.
    pub(crate) uses: u32,
    /// When the connection was last parked.
    pub(crate) idle_since: Option<Instant>,
}

impl Conn {
    pub(crate) fn new(stream: Stream, key: PoolKey, peer: SocketAddr) -> Self {
        let fd = stream.fd();
        Conn {
            stream,
            key,
            peer,
            fd,
            interest: SocketInterest::None,
            uses: 0,
            idle_since: None,
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Report `interest` to the reactor if it differs from the last report.
    pub(crate) fn want(&mut self, interest: SocketInterest, cb: &mut dyn EngineCallbacks) {
        if self.interest != interest {
            tracing::trace!(fd = self.fd, ?interest, "socket interest");
            self.interest = interest;
            cb.socket_interest(self.fd, interest);
        }
    }

    /// Forget the socket in the reactor and close it.
    pub(crate) fn close(mut self, cb: &mut dyn EngineCallbacks) {
        self.want(SocketInterest::Remove, cb);
        crate::metrics::CONNECTIONS_CLOSED.increment();
        self.stream.close();
    }
}
