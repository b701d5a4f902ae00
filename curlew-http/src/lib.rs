//! HTTP/1.1 transfer engine for the curlew reactor.
//!
//! [`HttpEngineFactory`] plugs into [`curlew::ReactorBuilder::launch`] and
//! gives every session its own [`HttpEngine`]: non-blocking TCP connects
//! through `socket2`, optional TLS through rustls, and an incremental
//! response parser that hands every head line and decoded body chunk to the
//! reactor as it arrives.
//!
//! Per session the engine keeps a cookie jar, a DNS cache and a bounded
//! pool of idle keep-alive connections. Redirects are reported through
//! `redirect_url`, never followed.
//!
//! # Example
//!
//! ```rust,ignore
//! use curlew::{Config, ReactorBuilder, Request};
//! use curlew_http::{HttpConfig, HttpEngineFactory};
//!
//! let factory = HttpEngineFactory::new(HttpConfig::default());
//! let (handle, thread) = ReactorBuilder::new(Config::default()).launch(factory)?;
//!
//! let session = handle.session();
//! session.submit(
//!     Request::post("https://example.com/api")
//!         .header("Content-Type", "application/json")
//!         .body(r#"{"hello":"world"}"#),
//! )?;
//!
//! let completion = handle.completions().recv().unwrap();
//! let response = completion.response().unwrap();
//! println!("{} {}", response.response_code(), response.text());
//! ```
//!
//! # Features
//!
//! - `tls` (default): `https` URLs via rustls with the ring provider and
//!   the bundled web PKI roots. Without it, `https` transfers fail with
//!   [`HttpError::TlsUnavailable`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod conn;
pub(crate) mod dns;
pub(crate) mod metrics;
pub(crate) mod parse;
pub(crate) mod pool;
pub(crate) mod stream;
pub(crate) mod target;
pub(crate) mod wire;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod global;

/// The engine and its per-reactor factory.
pub use engine::{HttpEngine, HttpEngineFactory};

/// Engine configuration.
pub use config::{HttpConfig, HttpConfigBuilder};

/// TLS client settings.
#[cfg(feature = "tls")]
pub use config::TlsClientConfig;

/// Session cookie store.
pub use cookie::{Cookie, CookieJar};

/// Engine errors.
pub use error::HttpError;

/// Process-wide setup guard.
pub use global::GlobalGuard;
