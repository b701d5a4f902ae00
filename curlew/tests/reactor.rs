//! Integration tests: reactor behaviour with a scripted engine.
//!
//! The engine backs each transfer with a Unix socket pair (real readiness
//! through the poller) or with the session timer, selected by the request
//! path:
//!
//! - `/chunks/N`: body of N pieces streamed over a socket pair
//! - `/delay/MS`: empty body after MS milliseconds
//! - `/fail`: transport failure on the first timeout
//! - `/reject`: refused by `add`

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use curlew::{
    Completion, Config, ConfigBuilder, EngineCallbacks, EngineFactory, Error, Finished,
    HostLock, Reactor, ReactorBuilder, ReactorHandle, Readiness, Request, SocketInterest,
    SocketTarget, Token, TransferEngine, TransferError, TransferId, TransferInfo,
};

// ── Scripted engine ─────────────────────────────────────────────────

#[derive(Default)]
struct Stats {
    engines: AtomicUsize,
    dropped: AtomicUsize,
    cleanups: AtomicUsize,
    registrations: AtomicUsize,
}

enum Job {
    Stream { id: TransferId, sock: UnixStream },
    Delay { id: TransferId, due: Instant },
    Fail { id: TransferId },
}

struct Scripted {
    stats: Arc<Stats>,
    jobs: Vec<Job>,
    finished: VecDeque<Finished>,
    done: HashSet<TransferId>,
}

fn payload(n: usize) -> Vec<u8> {
    (0..n).flat_map(|i| format!("chunk-{i};").into_bytes()).collect()
}

impl Scripted {
    fn finish(&mut self, id: TransferId, result: Result<(), TransferError>) {
        self.done.insert(id);
        self.finished.push_back(Finished { id, result });
    }

    fn rearm(&self, cb: &mut dyn EngineCallbacks) {
        let now = Instant::now();
        let mut next: Option<i64> = None;
        for job in &self.jobs {
            let ms = match job {
                Job::Delay { due, .. } => due.saturating_duration_since(now).as_millis() as i64 + 1,
                Job::Fail { .. } => 0,
                Job::Stream { .. } => continue,
            };
            next = Some(next.map_or(ms, |n| n.min(ms)));
        }
        cb.timer(next.unwrap_or(-1));
    }
}

impl TransferEngine for Scripted {
    fn add(
        &mut self,
        id: TransferId,
        request: &Request,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), TransferError> {
        let path = request.url().splitn(4, '/').nth(3).unwrap_or_default();
        let mut parts = path.split('/');
        match (parts.next(), parts.next()) {
            (Some("chunks"), Some(n)) => {
                let n: usize = n.parse().map_err(|_| TransferError::new("bad count"))?;
                let (local, mut peer) =
                    UnixStream::pair().map_err(|e| TransferError::new(e.to_string()))?;
                local.set_nonblocking(true).map_err(|e| TransferError::new(e.to_string()))?;
                for i in 0..n {
                    peer.write_all(format!("chunk-{i};").as_bytes())
                        .map_err(|e| TransferError::new(e.to_string()))?;
                }
                drop(peer);
                cb.socket_interest(local.as_raw_fd(), SocketInterest::Read);
                self.stats.registrations.fetch_add(1, Ordering::Relaxed);
                self.jobs.push(Job::Stream { id, sock: local });
            }
            (Some("delay"), Some(ms)) => {
                let ms: u64 = ms.parse().map_err(|_| TransferError::new("bad delay"))?;
                self.jobs.push(Job::Delay {
                    id,
                    due: Instant::now() + Duration::from_millis(ms),
                });
                cb.timer(0);
            }
            (Some("fail"), _) => {
                self.jobs.push(Job::Fail { id });
                cb.timer(0);
            }
            _ => return Err(TransferError::new(format!("unsupported path {path:?}"))),
        }
        Ok(())
    }

    fn socket_action(
        &mut self,
        target: SocketTarget,
        _readiness: Readiness,
        cb: &mut dyn EngineCallbacks,
    ) -> usize {
        let now = Instant::now();
        let jobs = std::mem::take(&mut self.jobs);
        for job in jobs {
            match job {
                Job::Stream { id, mut sock } if target == SocketTarget::Socket(sock.as_raw_fd()) => {
                    let fd: RawFd = sock.as_raw_fd();
                    let mut buf = [0u8; 7];
                    let eof = loop {
                        match sock.read(&mut buf) {
                            Ok(0) => break true,
                            Ok(n) => {
                                cb.body(id, &buf[..n]);
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                            Err(_) => break true,
                        }
                    };
                    if eof {
                        cb.header(id, b"HTTP/1.1 200 OK\r\n");
                        cb.header(id, b"\r\n");
                        cb.socket_interest(fd, SocketInterest::Remove);
                        self.finish(id, Ok(()));
                    } else {
                        self.jobs.push(Job::Stream { id, sock });
                    }
                }
                Job::Delay { id, due } if target == SocketTarget::Timeout && due <= now => {
                    self.finish(id, Ok(()));
                }
                Job::Fail { id } if target == SocketTarget::Timeout => {
                    self.finish(id, Err(TransferError::new("connection refused")));
                }
                other => self.jobs.push(other),
            }
        }
        self.rearm(cb);
        self.jobs.len()
    }

    fn info_read(&mut self) -> Option<Finished> {
        self.finished.pop_front()
    }

    fn remove(&mut self, _id: TransferId) {}

    fn info(&self, id: TransferId) -> Option<TransferInfo> {
        self.done.contains(&id).then(|| TransferInfo {
            response_code: 200,
            ..Default::default()
        })
    }

    fn retire(&mut self, _id: TransferId) {}

    fn cleanup(&mut self, id: TransferId) {
        assert!(self.done.remove(&id), "cleanup of unknown transfer");
        self.stats.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    fn running(&self) -> usize {
        self.jobs.len()
    }
}

impl Drop for Scripted {
    fn drop(&mut self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

struct ScriptedFactory {
    stats: Arc<Stats>,
}

impl EngineFactory for ScriptedFactory {
    type Engine = Scripted;

    fn create(&self) -> Result<Scripted, Error> {
        self.stats.engines.fetch_add(1, Ordering::Relaxed);
        Ok(Scripted {
            stats: Arc::clone(&self.stats),
            jobs: Vec::new(),
            finished: VecDeque::new(),
            done: HashSet::new(),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    ConfigBuilder::new()
        .max_poll_wait(Duration::from_millis(20))
        .housekeeping_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

fn launch() -> (
    ReactorHandle,
    thread::JoinHandle<Result<(), Error>>,
    Arc<Stats>,
) {
    let stats = Arc::new(Stats::default());
    let (handle, join) = ReactorBuilder::new(test_config())
        .launch(ScriptedFactory {
            stats: Arc::clone(&stats),
        })
        .unwrap();
    (handle, join, stats)
}

fn collect(handle: &ReactorHandle, n: usize) -> HashMap<Token, Completion> {
    let rx = handle.completions();
    let mut out = HashMap::new();
    while out.len() < n {
        let c = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timed out waiting for completions");
        assert!(out.insert(c.token(), c).is_none(), "duplicate completion");
    }
    out
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out: {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn shutdown(handle: ReactorHandle, join: thread::JoinHandle<Result<(), Error>>) {
    handle.stop();
    join.join().unwrap().unwrap();
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn dummy_requests_complete_without_engine() {
    let (handle, join, stats) = launch();
    let session = handle.session();
    let tokens: Vec<Token> = (0..10)
        .map(|_| session.submit(Request::dummy()).unwrap())
        .collect();

    let done = collect(&handle, tokens.len());
    for token in &tokens {
        let c = &done[token];
        assert!(c.is_ok());
        let resp = c.response().unwrap();
        assert!(resp.header_bytes().is_empty());
        assert!(resp.body_bytes().is_empty());
    }
    assert_eq!(stats.engines.load(Ordering::Relaxed), 0);
    assert_eq!(stats.registrations.load(Ordering::Relaxed), 0);
    shutdown(handle, join);
}

#[test]
fn socket_transfer_delivers_whole_body() {
    let (handle, join, _stats) = launch();
    let session = handle.session();
    let token = session
        .submit(Request::get("http://fake/chunks/40").token(11))
        .unwrap();
    assert_eq!(token, Token::new(11));

    let done = collect(&handle, 1);
    let resp = done[&token].response().unwrap();
    assert_eq!(resp.response_code(), 200);
    assert_eq!(&resp.body_bytes()[..], &payload(40)[..]);
    assert!(resp.body_chunks().len() > 1);
    assert_eq!(&resp.header_bytes()[..], b"HTTP/1.1 200 OK\r\n\r\n");
    shutdown(handle, join);
}

#[test]
fn concurrent_transfers_do_not_interleave() {
    let (handle, join, _stats) = launch();
    let session = handle.session();
    let a = session.submit(Request::get("http://fake/chunks/300")).unwrap();
    let b = session.submit(Request::get("http://fake/chunks/7")).unwrap();
    let c = session.submit(Request::get("http://fake/chunks/120")).unwrap();

    let done = collect(&handle, 3);
    assert_eq!(&done[&a].response().unwrap().body_bytes()[..], &payload(300)[..]);
    assert_eq!(&done[&b].response().unwrap().body_bytes()[..], &payload(7)[..]);
    assert_eq!(&done[&c].response().unwrap().body_bytes()[..], &payload(120)[..]);
    shutdown(handle, join);
}

#[test]
fn every_submission_completes_exactly_once() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 150;

    let (handle, join, _stats) = launch();
    let producers: Vec<_> = (0..THREADS)
        .map(|t| {
            let session = handle.session();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| {
                        let token = ((t * PER_THREAD) + i) as u64;
                        let url = match i % 3 {
                            0 => "http://fake/delay/2",
                            1 => "http://fake/chunks/3",
                            _ => "http://fake/fail",
                        };
                        session
                            .submit(Request::get(url).token(token))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut submitted = HashSet::new();
    for p in producers {
        for token in p.join().unwrap() {
            assert!(submitted.insert(token));
        }
    }

    let done = collect(&handle, THREADS * PER_THREAD);
    let delivered: HashSet<Token> = done.keys().copied().collect();
    assert_eq!(delivered, submitted);
    for (token, c) in &done {
        let failed = token.value() as usize % PER_THREAD % 3 == 2;
        assert_eq!(c.is_ok(), !failed, "token {token:?}");
    }
    assert!(handle.completions().try_recv().is_none());
    shutdown(handle, join);
}

#[test]
fn transport_errors_surface_in_completion() {
    let (handle, join, _stats) = launch();
    let session = handle.session();
    let failed = session.submit(Request::get("http://fake/fail")).unwrap();
    let rejected = session.submit(Request::get("http://fake/reject")).unwrap();

    let done = collect(&handle, 2);
    assert_eq!(done[&failed].error(), Some("connection refused"));
    assert!(done[&failed].response().is_none());
    assert!(done[&rejected].error().unwrap().contains("unsupported path"));
    shutdown(handle, join);
}

#[test]
fn invalid_request_rejected_synchronously() {
    let (handle, join, _stats) = launch();
    let session = handle.session();
    let err = session.submit(Request::get("not a url")).unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    let err = session
        .submit(Request::get("http://fake/delay/1").header("Bad\nName", "x"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    thread::sleep(Duration::from_millis(50));
    assert!(handle.completions().try_recv().is_none());
    shutdown(handle, join);
}

#[test]
fn stop_drains_in_flight_transfers() {
    let (handle, join, _stats) = launch();
    let session = handle.session();
    let tokens: Vec<Token> = (0..20)
        .map(|_| session.submit(Request::get("http://fake/delay/100")).unwrap())
        .collect();

    handle.stop();
    join.join().unwrap().unwrap();

    let rx = handle.completions();
    let delivered: HashSet<Token> = rx.drain().iter().map(Completion::token).collect();
    assert_eq!(delivered, tokens.into_iter().collect::<HashSet<_>>());

    assert!(!handle.is_accepting());
    let err = session.submit(Request::get("http://fake/delay/1")).unwrap_err();
    assert!(matches!(err, Error::ReactorStopped));
    assert!(rx.recv().is_none());
}

#[test]
fn dropped_completions_release_engine_state() {
    let (handle, join, stats) = launch();
    let session = handle.session();
    for _ in 0..8 {
        session.submit(Request::get("http://fake/chunks/2")).unwrap();
    }
    let done = collect(&handle, 8);
    assert_eq!(stats.cleanups.load(Ordering::Relaxed), 0);

    drop(done);
    wait_until("cleanups", || stats.cleanups.load(Ordering::Relaxed) == 8);
    shutdown(handle, join);
}

#[test]
fn session_torn_down_after_last_handle_and_release() {
    let (handle, join, stats) = launch();
    let session = handle.session();
    let clone = session.clone();
    session.submit(Request::get("http://fake/delay/5")).unwrap();
    let done = collect(&handle, 1);
    assert_eq!(stats.engines.load(Ordering::Relaxed), 1);

    drop(session);
    drop(clone);
    thread::sleep(Duration::from_millis(60));
    // The completion still pins the session's engine.
    assert_eq!(stats.dropped.load(Ordering::Relaxed), 0);

    drop(done);
    wait_until("engine dropped", || stats.dropped.load(Ordering::Relaxed) == 1);
    shutdown(handle, join);
}

#[test]
fn sessions_get_separate_engines() {
    let (handle, join, stats) = launch();
    let one = handle.session();
    let two = handle.session();
    assert_ne!(one.key(), two.key());
    one.submit(Request::get("http://fake/delay/1")).unwrap();
    two.submit(Request::get("http://fake/delay/1")).unwrap();
    one.submit(Request::get("http://fake/delay/1")).unwrap();
    collect(&handle, 3);
    assert_eq!(stats.engines.load(Ordering::Relaxed), 2);
    shutdown(handle, join);
}

#[test]
fn notify_fd_readable_after_delivery() {
    let (handle, join, _stats) = launch();
    let rx = handle.completions();
    let session = handle.session();
    session.submit(Request::dummy()).unwrap();

    let mut pfd = libc::pollfd {
        fd: rx.notify_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 5000) };
    assert_eq!(n, 1);
    rx.acknowledge();
    assert!(rx.try_recv().is_some());
    shutdown(handle, join);
}

// ── Host lock ───────────────────────────────────────────────────────

/// Mutex-like lock that can be released and taken from any thread.
#[derive(Default)]
struct Gil {
    held: Mutex<bool>,
    cv: Condvar,
    acquires: AtomicUsize,
}

impl Gil {
    fn lock(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn unlock(&self) {
        *self.held.lock().unwrap() = false;
        self.cv.notify_all();
    }

    fn is_held(&self) -> bool {
        *self.held.lock().unwrap()
    }
}

impl HostLock for Gil {
    fn release(&self) {
        self.unlock();
    }

    fn acquire(&self) {
        self.lock();
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn host_lock_released_while_reactor_waits() {
    let gil = Arc::new(Gil::default());
    let stats = Arc::new(Stats::default());
    let (tx, rx) = crossbeam_channel::bounded(1);

    let reactor_gil = Arc::clone(&gil);
    let factory = ScriptedFactory {
        stats: Arc::clone(&stats),
    };
    let join = thread::spawn(move || {
        reactor_gil.lock();
        let (mut reactor, handle) = Reactor::new(test_config(), factory).unwrap();
        tx.send(handle).unwrap();
        let result = reactor.run_with_host_lock(&*reactor_gil);
        assert!(reactor_gil.is_held());
        reactor_gil.unlock();
        result
    });
    let handle = rx.recv().unwrap();

    // Blocks forever if the reactor kept the lock across its poll.
    gil.lock();
    let session = handle.session();
    let token = session.submit(Request::get("http://fake/delay/10")).unwrap();
    gil.unlock();

    let c = handle
        .completions()
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert_eq!(c.token(), token);
    assert!(gil.acquires.load(Ordering::Relaxed) >= 1);

    handle.stop();
    join.join().unwrap().unwrap();
    assert!(!gil.is_held());
}
