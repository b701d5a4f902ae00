//! The HTTP/1.1 transfer engine.
//!
//! One [`HttpEngine`] serves one session. Transfers share its cookie jar,
//! DNS cache and idle-connection pool, and with TLS its client config, so
//! rustls session resumption carries across transfers of the session.
//!
//! Every transfer moves through the same phases:
//!
//! ```text
//! Queued -> Connecting -> [Handshaking] -> Sending -> Receiving -> Done
//!        \______________ reused connection ______/
//! ```
//!
//! `add` only queues and asks for an immediate timeout; all I/O happens in
//! `socket_action`, so response data is never delivered from inside `add`.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use curlew::{
    EngineCallbacks, EngineFactory, Finished, Readiness, Request, SocketInterest, SocketTarget,
    Timings, TransferEngine, TransferError, TransferId, TransferInfo, TransferSizes,
};

use crate::config::HttpConfig;
use crate::conn::{self, Conn};
use crate::cookie::CookieJar;
use crate::dns::DnsCache;
use crate::error::HttpError;
use crate::global::{self, GlobalGuard};
use crate::metrics;
use crate::parse::{ResponseParser, Sink};
use crate::pool::IdlePool;
use crate::stream::Stream;
use crate::target::Target;
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Connecting,
    Handshaking,
    Sending,
    Receiving,
    Done,
}

/// Offsets from the transfer start at which each phase ended.
#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    name_lookup: Option<Duration>,
    connect: Option<Duration>,
    app_connect: Option<Duration>,
    pre_transfer: Option<Duration>,
    start_transfer: Option<Duration>,
}

struct Exchange {
    target: Target,
    /// Serialized request; dropped on retire.
    request: Option<Bytes>,
    upload_len: u64,
    phase: Phase,
    conn: Option<Conn>,
    addrs: Vec<SocketAddr>,
    next_addr: usize,
    parser: ResponseParser,
    started: Instant,
    connect_deadline: Option<Instant>,
    deadline: Option<Instant>,
    request_queued: bool,
    marks: Marks,
    info: Option<TransferInfo>,
}

impl Exchange {
    fn elapsed(&self) -> Option<Duration> {
        Some(self.started.elapsed())
    }

    fn connecting(&self) -> bool {
        matches!(
            self.phase,
            Phase::Queued | Phase::Connecting | Phase::Handshaking
        )
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.phase == Phase::Done {
            return None;
        }
        let connect = self.connect_deadline.filter(|_| self.connecting());
        match (connect, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn timings(&self) -> Timings {
        let secs = |mark: Option<Duration>| mark.map_or(0.0, |d| d.as_secs_f64());
        Timings {
            total: self.started.elapsed().as_secs_f64(),
            name_lookup: secs(self.marks.name_lookup),
            connect: secs(self.marks.connect),
            app_connect: secs(self.marks.app_connect),
            pre_transfer: secs(self.marks.pre_transfer),
            start_transfer: secs(self.marks.start_transfer),
        }
    }
}

/// Forwards parsed response pieces to the session glue.
struct Deliver<'a> {
    id: TransferId,
    cb: &'a mut dyn EngineCallbacks,
}

impl Sink for Deliver<'_> {
    fn header(&mut self, line: &[u8]) {
        self.cb.header(self.id, line);
    }

    fn body(&mut self, chunk: &[u8]) {
        self.cb.body(self.id, chunk);
    }
}

/// HTTP/1.1 engine for one session.
pub struct HttpEngine {
    config: Arc<HttpConfig>,
    #[cfg(feature = "tls")]
    tls: Arc<rustls::ClientConfig>,
    exchanges: HashMap<TransferId, Exchange>,
    sockets: HashMap<RawFd, TransferId>,
    queued: VecDeque<TransferId>,
    finished: VecDeque<Finished>,
    pool: IdlePool<Conn>,
    dns: DnsCache,
    jar: CookieJar,
    running: usize,
    /// Deadline last reported through the timer callback.
    armed: Option<Instant>,
    scratch: Vec<u8>,
}

impl HttpEngine {
    fn new(
        config: Arc<HttpConfig>,
        #[cfg(feature = "tls")] tls: Arc<rustls::ClientConfig>,
    ) -> Self {
        HttpEngine {
            pool: IdlePool::new(config.max_idle_connections),
            dns: DnsCache::new(config.dns_cache_ttl),
            scratch: vec![0; config.read_buffer_size.max(1)],
            config,
            #[cfg(feature = "tls")]
            tls,
            exchanges: HashMap::new(),
            sockets: HashMap::new(),
            queued: VecDeque::new(),
            finished: VecDeque::new(),
            jar: CookieJar::new(),
            running: 0,
            armed: None,
        }
    }

    /// Cookie store shared by the transfers of this session.
    pub fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    /// Idle keep-alive connections currently parked.
    pub fn idle_connections(&self) -> usize {
        self.pool.len()
    }

    fn drive(&mut self, id: TransferId, readiness: Readiness, cb: &mut dyn EngineCallbacks) {
        let Some(mut ex) = self.exchanges.remove(&id) else {
            return;
        };
        if ex.phase == Phase::Done {
            self.exchanges.insert(id, ex);
            return;
        }
        let result = match self.step(id, &mut ex, readiness, cb) {
            Ok(false) => {
                self.exchanges.insert(id, ex);
                return;
            }
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        };
        self.complete(id, ex, result, cb);
    }

    /// Advance `ex` as far as the sockets allow. `Ok(true)` once the
    /// response is complete.
    fn step(
        &mut self,
        id: TransferId,
        ex: &mut Exchange,
        readiness: Readiness,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<bool, HttpError> {
        loop {
            match ex.phase {
                Phase::Queued => self.start(id, ex, cb)?,
                Phase::Connecting => {
                    if !(readiness.is_writable() || readiness.is_error()) {
                        return Ok(false);
                    }
                    let conn = ex.conn.as_ref().ok_or(HttpError::ConnectionClosed)?;
                    let failure = match conn.stream.take_error() {
                        Ok(None) => None,
                        Ok(Some(e)) | Err(e) => Some(e),
                    };
                    if let Some(source) = failure {
                        let addr = conn.peer;
                        tracing::debug!(transfer = ?id, %addr, error = %source, "connect failed");
                        self.drop_conn(ex, cb);
                        self.connect_next(id, ex, cb, HttpError::Connect { addr, source })?;
                        return Ok(false);
                    }
                    ex.marks.connect = ex.elapsed();
                    if ex.target.tls {
                        self.start_tls(ex)?;
                        ex.phase = Phase::Handshaking;
                    } else {
                        ex.marks.app_connect = ex.marks.connect;
                        ex.phase = Phase::Sending;
                    }
                }
                Phase::Handshaking => {
                    let conn = ex.conn.as_mut().ok_or(HttpError::ConnectionClosed)?;
                    if conn.stream.handshake()? {
                        metrics::TLS_HANDSHAKES.increment();
                        ex.marks.app_connect = Some(ex.started.elapsed());
                        ex.phase = Phase::Sending;
                    } else {
                        let interest = if conn.stream.wants_write() {
                            SocketInterest::ReadWrite
                        } else {
                            SocketInterest::Read
                        };
                        conn.want(interest, cb);
                        return Ok(false);
                    }
                }
                Phase::Sending => {
                    let conn = ex.conn.as_mut().ok_or(HttpError::ConnectionClosed)?;
                    if !ex.request_queued {
                        if let Some(request) = ex.request.as_ref() {
                            conn.stream.queue(request)?;
                            metrics::BYTES_SENT.add(request.len() as u64);
                        }
                        ex.request_queued = true;
                        ex.marks.pre_transfer = Some(ex.started.elapsed());
                    }
                    if conn.stream.flush()? {
                        ex.phase = Phase::Receiving;
                        conn.want(SocketInterest::Read, cb);
                    } else {
                        conn.want(SocketInterest::Write, cb);
                        return Ok(false);
                    }
                }
                Phase::Receiving => {
                    let conn = ex.conn.as_mut().ok_or(HttpError::ConnectionClosed)?;
                    loop {
                        match conn.stream.read(&mut self.scratch) {
                            Ok(0) => {
                                ex.parser.finish()?;
                                return Ok(true);
                            }
                            Ok(n) => {
                                metrics::BYTES_RECEIVED.add(n as u64);
                                if ex.marks.start_transfer.is_none() {
                                    ex.marks.start_transfer = Some(ex.started.elapsed());
                                }
                                let mut sink = Deliver { id, cb: &mut *cb };
                                if ex.parser.feed(&self.scratch[..n], &mut sink)? {
                                    return Ok(true);
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                            Err(e) => return Err(HttpError::Io(e)),
                        }
                    }
                }
                Phase::Done => return Ok(true),
            }
        }
    }

    /// Pick a connection for a queued transfer: a live idle one for the
    /// same origin, or a new connect to the first resolved address.
    fn start(
        &mut self,
        id: TransferId,
        ex: &mut Exchange,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), HttpError> {
        tracing::debug!(transfer = ?id, url = %ex.target.url, "transfer started");
        let key = ex.target.pool_key();
        while let Some(conn) = self.pool.checkout(&key) {
            if !conn.stream.is_alive() {
                conn.close(cb);
                continue;
            }
            metrics::CONNECTIONS_REUSED.increment();
            tracing::debug!(transfer = ?id, fd = conn.fd(), uses = conn.uses, "reusing connection");
            let now = ex.elapsed();
            ex.marks.name_lookup = now;
            ex.marks.connect = now;
            ex.marks.app_connect = now;
            self.sockets.insert(conn.fd(), id);
            ex.conn = Some(conn);
            ex.phase = Phase::Sending;
            return Ok(());
        }

        let addrs = self.dns.resolve(&ex.target, Instant::now())?;
        ex.marks.name_lookup = ex.elapsed();
        ex.addrs = addrs;
        ex.next_addr = 0;
        let unresolved = HttpError::Resolve(ex.target.host().to_string());
        self.connect_next(id, ex, cb, unresolved)
    }

    /// Connect to the next untried address. `last` is reported when every
    /// address has failed.
    fn connect_next(
        &mut self,
        id: TransferId,
        ex: &mut Exchange,
        cb: &mut dyn EngineCallbacks,
        mut last: HttpError,
    ) -> Result<(), HttpError> {
        while let Some(&addr) = ex.addrs.get(ex.next_addr) {
            ex.next_addr += 1;
            match conn::connect(addr, self.config.tcp_nodelay) {
                Ok(tcp) => {
                    let mut conn = Conn::new(Stream::new(tcp), ex.target.pool_key(), addr);
                    tracing::debug!(transfer = ?id, %addr, fd = conn.fd(), "connecting");
                    metrics::CONNECTIONS_OPENED.increment();
                    self.sockets.insert(conn.fd(), id);
                    conn.want(SocketInterest::Write, cb);
                    ex.conn = Some(conn);
                    ex.phase = Phase::Connecting;
                    return Ok(());
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    #[cfg(feature = "tls")]
    fn start_tls(&self, ex: &mut Exchange) -> Result<(), HttpError> {
        let server_name = ex.target.server_name();
        let conn = ex.conn.as_mut().ok_or(HttpError::ConnectionClosed)?;
        conn.stream.start_tls(self.tls.clone(), &server_name)
    }

    #[cfg(not(feature = "tls"))]
    fn start_tls(&self, _ex: &mut Exchange) -> Result<(), HttpError> {
        Err(HttpError::TlsUnavailable)
    }

    fn drop_conn(&mut self, ex: &mut Exchange, cb: &mut dyn EngineCallbacks) {
        if let Some(conn) = ex.conn.take() {
            self.sockets.remove(&conn.fd());
            conn.close(cb);
        }
    }

    fn park(&mut self, mut conn: Conn, cb: &mut dyn EngineCallbacks) {
        conn.want(SocketInterest::None, cb);
        conn.uses += 1;
        let key = conn.key.clone();
        metrics::CONNECTIONS_PARKED.increment();
        for evicted in self.pool.park(key, conn, Instant::now()) {
            evicted.close(cb);
        }
    }

    /// Record the outcome of a transfer and queue its [`Finished`] notice.
    fn complete(
        &mut self,
        id: TransferId,
        mut ex: Exchange,
        result: Result<(), HttpError>,
        cb: &mut dyn EngineCallbacks,
    ) {
        if let Some(conn) = ex.conn.take() {
            self.sockets.remove(&conn.fd());
            if result.is_ok() && ex.parser.reusable() {
                self.park(conn, cb);
            } else {
                conn.close(cb);
            }
        }
        self.queued.retain(|queued| *queued != id);

        let head = ex.parser.head();
        for set_cookie in &head.set_cookies {
            self.jar.store_set_cookie(set_cookie, &ex.target.url);
        }
        let redirect_url = if (300..400).contains(&head.status) {
            head.location
                .as_deref()
                .and_then(|location| ex.target.resolve(location))
        } else {
            None
        };
        let info = TransferInfo {
            response_code: u32::from(head.status),
            effective_url: Some(ex.target.effective_url()),
            redirect_url,
            timings: ex.timings(),
            sizes: TransferSizes {
                uploaded: ex.upload_len,
                downloaded: ex.parser.body_bytes(),
            },
            cookies: self.jar.netscape_lines(),
        };

        match &result {
            Ok(()) => tracing::debug!(transfer = ?id, status = info.response_code, "transfer done"),
            Err(e) => {
                if matches!(e, HttpError::Timeout(_)) {
                    metrics::TIMEOUTS.increment();
                }
                tracing::debug!(transfer = ?id, error = %e, "transfer failed");
            }
        }

        ex.info = Some(info);
        ex.phase = Phase::Done;
        self.running = self.running.saturating_sub(1);
        self.finished.push_back(Finished {
            id,
            result: result.map_err(TransferError::from),
        });
        self.exchanges.insert(id, ex);
    }

    /// Fail every transfer whose connect or total deadline has passed.
    fn expire(&mut self, now: Instant, cb: &mut dyn EngineCallbacks) {
        let expired: Vec<(TransferId, HttpError)> = self
            .exchanges
            .iter()
            .filter(|(_, ex)| ex.phase != Phase::Done)
            .filter_map(|(&id, ex)| {
                let elapsed = now.saturating_duration_since(ex.started).as_millis();
                if ex.deadline.is_some_and(|d| d <= now) {
                    return Some((
                        id,
                        HttpError::Timeout(format!(
                            "operation timed out after {elapsed} milliseconds with {} bytes received",
                            ex.parser.body_bytes()
                        )),
                    ));
                }
                if ex.connecting() && ex.connect_deadline.is_some_and(|d| d <= now) {
                    return Some((
                        id,
                        HttpError::Timeout(format!(
                            "connection timed out after {elapsed} milliseconds"
                        )),
                    ));
                }
                None
            })
            .collect();
        for (id, err) in expired {
            if let Some(ex) = self.exchanges.remove(&id) {
                self.complete(id, ex, Err(err), cb);
            }
        }
    }

    /// Report the earliest deadline if it changed since the last report.
    fn update_timer(&mut self, cb: &mut dyn EngineCallbacks) {
        let next = self
            .exchanges
            .values()
            .filter_map(Exchange::next_deadline)
            .min();
        if next == self.armed {
            return;
        }
        self.armed = next;
        match next {
            Some(at) => {
                let wait = at.saturating_duration_since(Instant::now());
                let ms = wait.as_nanos().div_ceil(1_000_000).max(1);
                cb.timer(i64::try_from(ms).unwrap_or(i64::MAX));
            }
            None => cb.timer(-1),
        }
    }
}

impl TransferEngine for HttpEngine {
    fn add(
        &mut self,
        id: TransferId,
        request: &Request,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), TransferError> {
        let target = Target::parse(request.url())?;
        if target.tls && !cfg!(feature = "tls") {
            return Err(HttpError::TlsUnavailable.into());
        }
        for line in request.cookies() {
            self.jar.load(line, &target.url)?;
        }
        let cookie = self.jar.header_for(&target.url);
        let encoded = wire::encode_request(request, &target, cookie.as_deref());

        let started = Instant::now();
        let connect_timeout = request
            .connect_timeout()
            .unwrap_or(self.config.connect_timeout);
        let head_request = request.method().eq_ignore_ascii_case("HEAD");
        self.exchanges.insert(
            id,
            Exchange {
                target,
                request: Some(encoded),
                upload_len: request.body().map_or(0, |b| b.len() as u64),
                phase: Phase::Queued,
                conn: None,
                addrs: Vec::new(),
                next_addr: 0,
                parser: ResponseParser::new(head_request),
                started,
                connect_deadline: Some(started + connect_timeout),
                deadline: request.timeout().map(|t| started + t),
                request_queued: false,
                marks: Marks::default(),
                info: None,
            },
        );
        self.queued.push_back(id);
        self.running += 1;
        tracing::trace!(transfer = ?id, "transfer queued");
        // The kick replaces whatever timer was armed.
        cb.timer(0);
        self.armed = None;
        Ok(())
    }

    fn socket_action(
        &mut self,
        target: SocketTarget,
        readiness: Readiness,
        cb: &mut dyn EngineCallbacks,
    ) -> usize {
        match target {
            SocketTarget::Socket(fd) => match self.sockets.get(&fd) {
                Some(&id) => self.drive(id, readiness, cb),
                None => tracing::trace!(fd, "event for unowned socket"),
            },
            SocketTarget::Timeout => {
                // One-shot: whatever was armed has fired or been replaced.
                self.armed = None;
                while let Some(id) = self.queued.pop_front() {
                    self.drive(id, Readiness::EMPTY, cb);
                }
            }
        }
        self.expire(Instant::now(), cb);
        self.update_timer(cb);
        self.running
    }

    fn info_read(&mut self) -> Option<Finished> {
        self.finished.pop_front()
    }

    fn remove(&mut self, id: TransferId) {
        if let Some(ex) = self.exchanges.get_mut(&id)
            && ex.phase != Phase::Done
        {
            // Abandoned while running: dropping the connection closes it.
            if let Some(conn) = ex.conn.take() {
                self.sockets.remove(&conn.fd());
            }
            ex.phase = Phase::Done;
            self.running = self.running.saturating_sub(1);
            self.queued.retain(|queued| *queued != id);
        }
    }

    fn info(&self, id: TransferId) -> Option<TransferInfo> {
        self.exchanges.get(&id).and_then(|ex| ex.info.clone())
    }

    fn retire(&mut self, id: TransferId) {
        if let Some(ex) = self.exchanges.get_mut(&id) {
            ex.request = None;
            ex.addrs = Vec::new();
        }
    }

    fn cleanup(&mut self, id: TransferId) {
        self.exchanges.remove(&id);
    }

    fn running(&self) -> usize {
        self.running
    }

    fn housekeeping(&mut self, cb: &mut dyn EngineCallbacks) {
        let now = Instant::now();
        for conn in self.pool.expire(now, self.config.idle_timeout) {
            tracing::debug!(fd = conn.fd(), uses = conn.uses, "closing idle connection");
            conn.close(cb);
        }
        self.dns.purge(now);
    }
}

/// Creates one [`HttpEngine`] per session.
///
/// Holds a [`GlobalGuard`] for as long as it lives.
pub struct HttpEngineFactory {
    config: Arc<HttpConfig>,
    #[cfg(feature = "tls")]
    tls: Arc<rustls::ClientConfig>,
    _global: GlobalGuard,
}

impl HttpEngineFactory {
    pub fn new(config: HttpConfig) -> Self {
        let global = global::init();
        #[cfg(feature = "tls")]
        let tls = match &config.tls_client {
            Some(tls) => tls.client_config.clone(),
            None => default_tls_config(),
        };
        HttpEngineFactory {
            config: Arc::new(config),
            #[cfg(feature = "tls")]
            tls,
            _global: global,
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl Default for HttpEngineFactory {
    fn default() -> Self {
        Self::new(HttpConfig::default())
    }
}

impl EngineFactory for HttpEngineFactory {
    type Engine = HttpEngine;

    fn create(&self) -> Result<HttpEngine, curlew::Error> {
        #[cfg(feature = "tls")]
        let engine = HttpEngine::new(self.config.clone(), self.tls.clone());
        #[cfg(not(feature = "tls"))]
        let engine = HttpEngine::new(self.config.clone());
        Ok(engine)
    }
}

/// Client config trusting the bundled web PKI roots.
#[cfg(feature = "tls")]
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}
