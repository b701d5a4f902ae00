//! The single-threaded reactor loop and its thread-safe handle.
//!
//! Each iteration admits queued submissions, processes releases, polls for
//! readiness and timers, dispatches the results to the owning sessions'
//! engines, and delivers finished transfers to the completion channel in
//! batches.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::channel::{
    self, CompletionReceiver, CompletionSender, Release, SubmissionReceiver, SubmissionSender,
};
use crate::completion::Completion;
use crate::config::Config;
use crate::engine::{EngineFactory, SocketTarget};
use crate::error::{Error, TransferError};
use crate::host::{HostLock, NativeRegion, NoHostLock};
use crate::metrics;
use crate::notify::EventFd;
use crate::poller::{self, Dispatch, Poller, TimerEvent, TimerId};
use crate::session::{Harvest, Session, SessionKey, SessionState};

/// State shared between the reactor and its handles.
struct Shared {
    stop: AtomicBool,
    control: EventFd,
    submissions: Arc<SubmissionSender>,
    releases: Sender<Release>,
    completions: CompletionReceiver,
    next_session: AtomicU64,
}

/// Thread-safe handle to a running (or not yet started) reactor.
///
/// Creates sessions, hands out completion receivers and requests shutdown.
/// Cheap to clone.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Open a new session on this reactor.
    pub fn session(&self) -> Session {
        let key = SessionKey::new(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        Session::new(
            key,
            Arc::clone(&self.shared.submissions),
            self.shared.releases.clone(),
        )
    }

    /// Receiver for completions of every session on this reactor.
    pub fn completions(&self) -> CompletionReceiver {
        self.shared.completions.clone()
    }

    /// Ask the reactor to stop.
    ///
    /// Submissions are rejected from the moment the reactor notices. Requests
    /// already queued and transfers in flight still run to completion and are
    /// delivered before the loop returns.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            self.shared.control.notify();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// False once the reactor has stopped accepting submissions.
    pub fn is_accepting(&self) -> bool {
        self.shared.submissions.is_open()
    }
}

/// Single-threaded event loop driving every session's engine.
///
/// Construct on the thread that will run it, or use [`ReactorBuilder`] to
/// spawn a dedicated thread.
pub struct Reactor<F: EngineFactory> {
    config: Config,
    factory: F,
    poller: Poller,
    sessions: HashMap<SessionKey, SessionState<F::Engine>>,
    submissions: SubmissionReceiver,
    completions: CompletionSender,
    releases_rx: Receiver<Release>,
    releases_tx: Sender<Release>,
    shared: Arc<Shared>,
    housekeeping: Option<TimerId>,
    ready: Vec<Completion>,
    dispatch: Vec<Dispatch>,
}

impl<F: EngineFactory> Reactor<F> {
    pub fn new(config: Config, factory: F) -> Result<(Self, ReactorHandle), Error> {
        config.validate()?;
        let poller = Poller::new(config.events_capacity)?;
        let (submit_tx, submit_rx) = channel::submission(config.submission_capacity)?;
        let (complete_tx, complete_rx) = channel::completion()?;
        let (releases_tx, releases_rx) = crossbeam_channel::unbounded();
        let control = EventFd::new()?;

        poller.register_notify(submit_rx.raw_fd(), poller::SUBMISSION)?;
        poller.register_notify(control.raw_fd(), poller::CONTROL)?;

        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            control,
            submissions: Arc::new(submit_tx),
            releases: releases_tx.clone(),
            completions: complete_rx,
            next_session: AtomicU64::new(1),
        });

        let reactor = Reactor {
            ready: Vec::with_capacity(config.max_completion_batch),
            dispatch: Vec::with_capacity(config.events_capacity),
            config,
            factory,
            poller,
            sessions: HashMap::new(),
            submissions: submit_rx,
            completions: complete_tx,
            releases_rx,
            releases_tx,
            shared: Arc::clone(&shared),
            housekeeping: None,
        };
        Ok((reactor, ReactorHandle { shared }))
    }

    /// Run until stopped and drained.
    pub fn run(&mut self) -> Result<(), Error> {
        self.run_with_host_lock(&NoHostLock)
    }

    /// Run until stopped and drained, releasing `lock` for the whole loop
    /// and reacquiring it only while completions are delivered.
    pub fn run_with_host_lock(&mut self, lock: &dyn HostLock) -> Result<(), Error> {
        let region = NativeRegion::enter(lock);
        info!("reactor started");
        self.housekeeping = Some(
            self.poller
                .arm(self.config.housekeeping_interval, TimerEvent::Housekeeping),
        );

        let mut draining = false;
        let result = loop {
            self.process_releases(&region);
            self.admit(&region);
            self.deliver(&region);

            if !draining && self.shared.stop.load(Ordering::Acquire) {
                draining = true;
                self.shared.submissions.close();
                // Anything that passed the gate is queued by now.
                self.admit(&region);
                self.deliver(&region);
                info!(in_flight = self.in_flight(), "reactor draining");
            }
            if draining && self.in_flight() == 0 {
                break Ok(());
            }

            let mut dispatch = std::mem::take(&mut self.dispatch);
            if let Err(e) = self.poller.poll(self.config.max_poll_wait, &mut dispatch) {
                self.dispatch = dispatch;
                break Err(Error::Io(e));
            }
            for d in dispatch.drain(..) {
                self.dispatch_one(d, &region);
            }
            self.dispatch = dispatch;
            self.deliver(&region);
        };

        self.shared.submissions.close();
        if let Some(id) = self.housekeeping.take() {
            self.poller.cancel(id);
        }
        match &result {
            Ok(()) => info!("reactor stopped"),
            Err(e) => warn!(error = %e, "reactor stopped on error"),
        }
        result
    }

    /// Transfers handed to an engine and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.sessions.values().map(SessionState::in_flight).sum()
    }

    fn admit(&mut self, region: &NativeRegion<'_>) {
        self.submissions.acknowledge();
        while let Some(transfer) = self.submissions.try_recv() {
            if transfer.request.is_dummy() {
                metrics::TRANSFERS_DUMMY.increment();
                self.ready.push(Completion::dummy(transfer));
            } else {
                let key = transfer.session;
                let session = match self.sessions.entry(key) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(v) => match self.factory.create() {
                        Ok(engine) => {
                            debug!(session = key.value(), "session created");
                            metrics::SESSIONS_ACTIVE.increment();
                            v.insert(SessionState::new(key, engine))
                        }
                        Err(e) => {
                            warn!(session = key.value(), error = %e, "engine creation failed");
                            metrics::TRANSFERS_FAILED.increment();
                            self.ready.push(Completion::rejected(
                                transfer,
                                TransferError::new(e.to_string()),
                            ));
                            continue;
                        }
                    },
                };
                session.start(
                    &mut self.poller,
                    transfer,
                    &mut Harvest {
                        ready: &mut self.ready,
                        releases: &self.releases_tx,
                    },
                );
            }
            if self.ready.len() >= self.config.max_completion_batch {
                self.deliver(region);
            }
        }
    }

    fn process_releases(&mut self, region: &NativeRegion<'_>) {
        while let Ok(release) = self.releases_rx.try_recv() {
            match release {
                Release::Transfer { session, id } => {
                    if let Some(state) = self.sessions.get_mut(&session) {
                        state.release(id);
                    }
                }
                Release::Session(key) => {
                    // The session's last submissions were queued before its
                    // release was sent. Admit them so they run on the state
                    // being closed instead of creating a new one.
                    self.admit(region);
                    if let Some(state) = self.sessions.get_mut(&key) {
                        state.mark_closing();
                    }
                }
            }
        }

        let poller = &mut self.poller;
        self.sessions.retain(|key, state| {
            if !state.is_done() {
                return true;
            }
            state.teardown(poller);
            metrics::SESSIONS_ACTIVE.decrement();
            debug!(session = key.value(), "session closed");
            false
        });
    }

    fn dispatch_one(&mut self, dispatch: Dispatch, region: &NativeRegion<'_>) {
        let mut out = Harvest {
            ready: &mut self.ready,
            releases: &self.releases_tx,
        };
        match dispatch {
            // Admission happens at the top of every iteration.
            Dispatch::Submission => {}
            Dispatch::Control => {
                self.shared.control.drain();
            }
            Dispatch::Socket {
                session,
                fd,
                readiness,
            } => {
                if let Some(state) = self.sessions.get_mut(&session) {
                    state.socket_action(
                        &mut self.poller,
                        SocketTarget::Socket(fd),
                        readiness,
                        &mut out,
                    );
                }
            }
            Dispatch::Timer(id, TimerEvent::Session(key)) => {
                if let Some(state) = self.sessions.get_mut(&key) {
                    state.on_timer(&mut self.poller, id, &mut out);
                }
            }
            Dispatch::Timer(_, TimerEvent::Housekeeping) => {
                for state in self.sessions.values_mut() {
                    state.housekeeping(&mut self.poller, &mut out);
                }
                self.housekeeping = Some(
                    self.poller
                        .arm(self.config.housekeeping_interval, TimerEvent::Housekeeping),
                );
                self.process_releases(region);
            }
        }
        if self.ready.len() >= self.config.max_completion_batch {
            self.deliver(region);
        }
    }

    /// Hand every ready completion to the consumer as one batch.
    fn deliver(&mut self, region: &NativeRegion<'_>) {
        if self.ready.is_empty() {
            return;
        }
        let completions = &self.completions;
        let ready = &mut self.ready;
        region.with_host(|| completions.send_batch(ready.drain(..)));
        metrics::COMPLETION_BATCHES.increment();
    }
}

/// Spawns a reactor on a dedicated, named thread.
pub struct ReactorBuilder {
    config: Config,
}

impl ReactorBuilder {
    pub fn new(config: Config) -> Self {
        ReactorBuilder { config }
    }

    /// Start the reactor thread. The engine factory moves to the thread and
    /// every engine is created there.
    ///
    /// Returns the handle and the thread's join handle, whose result is the
    /// reactor's exit status.
    pub fn launch<F: EngineFactory>(
        self,
        factory: F,
    ) -> Result<(ReactorHandle, JoinHandle<Result<(), Error>>), Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let name = self.config.thread_name.clone();
        let config = self.config;

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let (mut reactor, handle) = match Reactor::new(config, factory) {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = tx.send(Ok(handle));
                reactor.run()
            })
            .map_err(Error::Io)?;

        match rx.recv() {
            Ok(Ok(handle)) => Ok((handle, join)),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(Error::ReactorStopped),
        }
    }
}
