//! Host-runtime lock regions.
//!
//! An embedding runtime may require the thread that drives the reactor to
//! hold a global lock while it touches host-visible state (an interpreter
//! lock, for example). The reactor gives that lock up for the whole of its
//! loop and takes it back only around completion delivery, so producers and
//! consumers on other threads keep running while the reactor blocks in poll.

/// Lock owned by an embedding runtime.
///
/// `release` is called before the reactor enters native code that may block.
/// `acquire` is called before the reactor touches host-visible state.
/// Calls always alternate, starting with `release`.
pub trait HostLock: Send + Sync {
    fn release(&self);
    fn acquire(&self);
}

/// No-op lock for reactors not embedded in a host runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostLock;

impl HostLock for NoHostLock {
    fn release(&self) {}
    fn acquire(&self) {}
}

/// Scope in which the host lock is released.
///
/// Entering releases the lock and dropping reacquires it, so the caller
/// holds the lock again when the reactor returns, even on unwind.
pub(crate) struct NativeRegion<'a> {
    lock: &'a dyn HostLock,
}

impl<'a> NativeRegion<'a> {
    pub(crate) fn enter(lock: &'a dyn HostLock) -> Self {
        lock.release();
        NativeRegion { lock }
    }

    /// Run `f` with the host lock held, releasing it again afterwards.
    pub(crate) fn with_host<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Release<'b>(&'b dyn HostLock);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.release();
            }
        }

        self.lock.acquire();
        let _release = Release(self.lock);
        f()
    }
}

impl Drop for NativeRegion<'_> {
    fn drop(&mut self) {
        self.lock.acquire();
    }
}
