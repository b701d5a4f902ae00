//! Non-blocking byte stream over TCP, optionally wrapped in TLS.

use std::io::{self, Read as _, Write as _};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
#[cfg(feature = "tls")]
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::error::HttpError;

pub(crate) struct Stream {
    tcp: TcpStream,
    /// Plaintext waiting for the socket (plain connections only).
    out: BytesMut,
    #[cfg(feature = "tls")]
    tls: Option<Box<rustls::ClientConnection>>,
}

impl Stream {
    pub(crate) fn new(tcp: TcpStream) -> Self {
        Stream {
            tcp,
            out: BytesMut::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub(crate) fn start_tls(
        &mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<(), HttpError> {
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| HttpError::Tls(format!("invalid server name {server_name}: {e}")))?;
        let mut conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| HttpError::Tls(e.to_string()))?;
        // Whole request bodies are queued at once.
        conn.set_buffer_limit(None);
        self.tls = Some(Box::new(conn));
        Ok(())
    }

    pub(crate) fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// Advance the TLS handshake as far as the socket allows. Returns
    /// `true` once it is complete; plain streams are always complete.
    pub(crate) fn handshake(&mut self) -> Result<bool, HttpError> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            loop {
                while tls.wants_write() {
                    match tls.write_tls(&mut self.tcp) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(HttpError::Io(e)),
                    }
                }
                if !tls.is_handshaking() {
                    return Ok(true);
                }
                match tls.read_tls(&mut self.tcp) {
                    Ok(0) => return Err(HttpError::ConnectionClosed),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(HttpError::Io(e)),
                }
                tls.process_new_packets()
                    .map_err(|e| HttpError::Tls(e.to_string()))?;
            }
        }
        Ok(true)
    }

    /// Queue bytes for sending. Nothing is written until [`flush`](Self::flush).
    pub(crate) fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            return tls.writer().write_all(data);
        }
        self.out.extend_from_slice(data);
        Ok(())
    }

    /// Write queued bytes. Returns `true` once everything is on the wire,
    /// `false` when the socket stopped accepting data.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            while tls.wants_write() {
                match tls.write_tls(&mut self.tcp) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
            return Ok(true);
        }
        while !self.out.is_empty() {
            match self.tcp.write(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read decrypted bytes. `Ok(0)` means the peer closed the stream.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            loop {
                match tls.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    // Closed without close_notify.
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                if tls.read_tls(&mut self.tcp)? == 0 {
                    return Ok(0);
                }
                tls.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
        loop {
            match self.tcp.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    /// Pending output the socket has not taken yet.
    pub(crate) fn wants_write(&self) -> bool {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_ref() {
            return tls.wants_write();
        }
        !self.out.is_empty()
    }

    /// An idle connection is usable only if the peer has neither closed it
    /// nor sent anything unsolicited.
    pub(crate) fn is_alive(&self) -> bool {
        let mut byte = 0u8;
        let n = unsafe {
            libc::recv(
                self.fd(),
                (&mut byte as *mut u8).cast(),
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock
    }

    /// Connect outcome of a non-blocking connect, once writable.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.tcp.take_error()
    }

    /// Best-effort TLS close_notify before the socket is dropped.
    pub(crate) fn close(mut self) {
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut self.tcp);
        }
        let _ = self.tcp.shutdown(std::net::Shutdown::Both);
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.tcp.as_raw_fd()
    }
}
