//! curlew reactor metrics.
//!
//! Process-wide counters for submissions, completions, socket activity and
//! timers. Exposed through any metriken exporter.

use metriken::{Counter, Gauge, metric};

// ── Transfers ─────────────────────────────────────────────────────

#[metric(
    name = "curlew/transfers/submitted",
    description = "Requests accepted by Session::submit"
)]
pub static TRANSFERS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "curlew/transfers/started",
    description = "Transfers handed to an engine"
)]
pub static TRANSFERS_STARTED: Counter = Counter::new();

#[metric(
    name = "curlew/transfers/completed",
    description = "Transfers finished without a transport error"
)]
pub static TRANSFERS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "curlew/transfers/failed",
    description = "Transfers finished with a transport error"
)]
pub static TRANSFERS_FAILED: Counter = Counter::new();

#[metric(
    name = "curlew/transfers/dummy",
    description = "Dummy requests completed at admission"
)]
pub static TRANSFERS_DUMMY: Counter = Counter::new();

#[metric(
    name = "curlew/transfers/in_flight",
    description = "Transfers currently owned by an engine"
)]
pub static TRANSFERS_IN_FLIGHT: Gauge = Gauge::new();

#[metric(
    name = "curlew/transfers/released",
    description = "Engine transfer handles cleaned up after consumer release"
)]
pub static TRANSFERS_RELEASED: Counter = Counter::new();

// ── Completions ───────────────────────────────────────────────────

#[metric(
    name = "curlew/completions/batches",
    description = "Completion batches delivered to the consumer"
)]
pub static COMPLETION_BATCHES: Counter = Counter::new();

// ── Reactor loop ──────────────────────────────────────────────────

#[metric(
    name = "curlew/reactor/polls",
    description = "Readiness polls performed by the reactor"
)]
pub static POLLS: Counter = Counter::new();

#[metric(
    name = "curlew/reactor/socket_actions",
    description = "Engine socket_action invocations"
)]
pub static SOCKET_ACTIONS: Counter = Counter::new();

#[metric(
    name = "curlew/timers/armed",
    description = "Session timers armed"
)]
pub static TIMERS_ARMED: Counter = Counter::new();

#[metric(
    name = "curlew/timers/fired",
    description = "Session timers that fired"
)]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "curlew/sockets/registered",
    description = "Sockets currently known to the multiplexer"
)]
pub static SOCKETS_REGISTERED: Gauge = Gauge::new();

// ── Sessions ──────────────────────────────────────────────────────

#[metric(
    name = "curlew/sessions/active",
    description = "Sessions with a live engine on the reactor"
)]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ─────────────────────────────────────────────────────────

#[metric(
    name = "curlew/bytes/header",
    description = "Response header bytes appended to transfers"
)]
pub static HEADER_BYTES: Counter = Counter::new();

#[metric(
    name = "curlew/bytes/body",
    description = "Response body bytes appended to transfers"
)]
pub static BODY_BYTES: Counter = Counter::new();
