use std::time::Duration;

/// TLS client configuration for `https` transfers.
#[cfg(feature = "tls")]
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    /// Pre-built rustls ClientConfig. User configures root certs, ALPN, etc.
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
}

/// Per-session HTTP engine configuration.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Idle keep-alive connections kept per session.
    pub max_idle_connections: usize,
    /// Idle connections older than this are closed by housekeeping.
    pub idle_timeout: Duration,
    /// How long a resolved host stays cached.
    pub dns_cache_ttl: Duration,
    /// Scratch buffer for socket reads.
    pub read_buffer_size: usize,
    pub tcp_nodelay: bool,
    /// Connect timeout for requests that set none.
    pub connect_timeout: Duration,
    /// Client TLS settings. `None` uses the bundled web PKI roots.
    #[cfg(feature = "tls")]
    pub tls_client: Option<TlsClientConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_idle_connections: 5,
            idle_timeout: Duration::from_secs(118),
            dns_cache_ttl: Duration::from_secs(60),
            read_buffer_size: 16 * 1024,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(300),
            #[cfg(feature = "tls")]
            tls_client: None,
        }
    }
}

/// Builder for [`HttpConfig`].
#[derive(Debug, Default)]
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connection reuse ───────────────────────────────────────────

    pub fn max_idle_connections(mut self, n: usize) -> Self {
        self.config.max_idle_connections = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    // ── Sockets ────────────────────────────────────────────────────

    pub fn dns_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.dns_cache_ttl = ttl;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    // ── TLS ────────────────────────────────────────────────────────

    #[cfg(feature = "tls")]
    pub fn tls_client(mut self, config: TlsClientConfig) -> Self {
        self.config.tls_client = Some(config);
        self
    }

    pub fn build(self) -> HttpConfig {
        self.config
    }
}
