//! HTTP engine metrics.

use metriken::{Counter, metric};

#[metric(
    name = "curlew_http/connections/opened",
    description = "TCP connections opened"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "curlew_http/connections/reused",
    description = "Transfers that reused an idle keep-alive connection"
)]
pub static CONNECTIONS_REUSED: Counter = Counter::new();

#[metric(
    name = "curlew_http/connections/closed",
    description = "Connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "curlew_http/connections/parked",
    description = "Connections parked in an idle cache"
)]
pub static CONNECTIONS_PARKED: Counter = Counter::new();

#[metric(
    name = "curlew_http/dns/hits",
    description = "Host lookups answered from the cache"
)]
pub static DNS_HITS: Counter = Counter::new();

#[metric(
    name = "curlew_http/dns/misses",
    description = "Host lookups sent to the system resolver"
)]
pub static DNS_MISSES: Counter = Counter::new();

#[metric(
    name = "curlew_http/tls/handshakes",
    description = "Completed TLS handshakes"
)]
pub static TLS_HANDSHAKES: Counter = Counter::new();

#[metric(
    name = "curlew_http/bytes/sent",
    description = "Request bytes written"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "curlew_http/bytes/received",
    description = "Response bytes read"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "curlew_http/transfers/timed_out",
    description = "Transfers that hit a connect or total deadline"
)]
pub static TIMEOUTS: Counter = Counter::new();
