//! Process-wide setup shared by every engine.
//!
//! The first live [`GlobalGuard`] ignores `SIGPIPE`, so writes to a
//! closed socket fail with `EPIPE` instead of killing the process, and
//! installs the ring crypto provider as the process default when no other
//! provider is installed. Dropping the last guard restores the previous
//! `SIGPIPE` disposition.

use std::sync::Mutex;

struct State {
    refs: usize,
    previous_sigpipe: Option<libc::sighandler_t>,
}

static STATE: Mutex<State> = Mutex::new(State {
    refs: 0,
    previous_sigpipe: None,
});

/// Keeps the process-wide setup alive. See [`init`].
#[derive(Debug)]
pub struct GlobalGuard {
    _private: (),
}

/// Take a reference on the process-wide setup, performing it if this is
/// the first live guard.
pub fn init() -> GlobalGuard {
    let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
    if state.refs == 0 {
        let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        state.previous_sigpipe = (previous != libc::SIG_ERR).then_some(previous);
        #[cfg(feature = "tls")]
        {
            // Fails harmlessly when the application installed one already.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
        tracing::debug!("global setup done");
    }
    state.refs += 1;
    GlobalGuard { _private: () }
}

/// Number of live guards.
pub fn active() -> usize {
    STATE.lock().unwrap_or_else(|e| e.into_inner()).refs
}

impl Clone for GlobalGuard {
    fn clone(&self) -> Self {
        init()
    }
}

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            if let Some(previous) = state.previous_sigpipe.take() {
                unsafe { libc::signal(libc::SIGPIPE, previous) };
            }
            tracing::debug!("global setup released");
        }
    }
}
