//! curlew — embeddable asynchronous HTTP transfer reactor.
//!
//! One reactor thread multiplexes many concurrent transfers over a readiness
//! poller. Producers on any thread submit requests through a [`Session`];
//! finished transfers come back as [`Completion`]s on a
//! [`CompletionReceiver`], whose descriptor becomes readable once per
//! delivered batch. Protocol work is delegated to a pluggable
//! [`TransferEngine`], one instance per session.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use curlew::{Config, ReactorBuilder, Request};
//!
//! let (handle, thread) = ReactorBuilder::new(Config::default())
//!     .launch(curlew_http::HttpEngineFactory::default())?;
//! let session = handle.session();
//! let token = session.submit(Request::get("http://example.com/"))?;
//!
//! let completion = handle.completions().recv().unwrap();
//! assert_eq!(completion.token(), token);
//! println!("{}", completion.response().unwrap().text());
//!
//! handle.stop();
//! thread.join().unwrap()?;
//! ```
//!
//! # Platform
//!
//! Linux only. Wakeups use eventfd and readiness uses epoll.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod channel;
pub(crate) mod metrics;
pub(crate) mod notify;
pub(crate) mod poller;
pub(crate) mod transfer;

// ── Public modules ──────────────────────────────────────────────────────
pub mod chain;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod reactor;
pub mod request;
pub mod session;

// ── Re-exports: Reactor ─────────────────────────────────────────────────

/// Single-threaded event loop.
pub use reactor::Reactor;
/// Spawns a reactor on its own thread.
pub use reactor::ReactorBuilder;
/// Thread-safe reactor handle.
pub use reactor::ReactorHandle;

// ── Re-exports: Requests and results ────────────────────────────────────

/// Consumer side of the completion channel.
pub use channel::CompletionReceiver;
/// Finished-transfer record.
pub use completion::{Completion, Response};
/// Request description and builder.
pub use request::{Request, RequestBuilder, Token};
/// Submission handle for one multiplexing context.
pub use session::{Session, SessionKey};
/// Ordered byte chunks.
pub use chain::BufferChain;

// ── Re-exports: Engine capability ───────────────────────────────────────

/// Engine traits and the types they exchange with the reactor.
pub use engine::{
    EngineCallbacks, EngineFactory, Finished, Readiness, SocketInterest, SocketTarget, Timings,
    TransferEngine, TransferId, TransferInfo, TransferSizes,
};

// ── Re-exports: Configuration and errors ────────────────────────────────

/// Reactor configuration.
pub use config::{Config, ConfigBuilder};
/// Reactor and transfer errors.
pub use error::{Error, TransferError};
/// Host-runtime lock integration.
pub use host::{HostLock, NoHostLock};
/// Channel receive errors.
pub use crossbeam_channel::RecvTimeoutError;
