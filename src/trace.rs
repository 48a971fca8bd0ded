use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::util::lock_unpoisoned;

/// Durations derived from the connection-level events observed while an
/// attempt executed. Pairs whose events never fired read as zero, so a
/// transport that cannot see a phase (a reused connection skips DNS and
/// the handshakes) still produces a coherent snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
    /// Time spent resolving the host name.
    pub dns_lookup_time: Duration,
    /// Time from asking the pool for a connection to obtaining one,
    /// including any dial and handshake.
    pub conn_time: Duration,
    /// Time spent establishing the TCP connection.
    pub tcp_conn_time: Duration,
    /// Time spent in the TLS handshake.
    pub tls_handshake_time: Duration,
    /// Time from the request being fully written to the first
    /// response byte.
    pub server_time: Duration,
    /// Time from the first response byte to the attempt completing.
    pub response_time: Duration,
    /// Wall time of the whole attempt.
    pub total_time: Duration,
    /// Whether the connection came from the pool.
    pub is_conn_reused: bool,
    /// Whether the pooled connection had been sitting idle.
    pub is_conn_was_idle: bool,
    /// How long the pooled connection had been idle.
    pub conn_idle_time: Duration,
}

#[derive(Debug, Default)]
struct TraceEvents {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    conn_requested: Option<Instant>,
    conn_obtained: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    request_written: Option<Instant>,
    first_response_byte: Option<Instant>,
    conn_reused: bool,
    conn_was_idle: bool,
    conn_idle_time: Duration,
}

/// Shared event sink a transport stamps while executing one attempt.
///
/// The executor plants a recorder in the outgoing request's
/// [`http::Extensions`] when client tracing is enabled; transports that
/// support tracing clone it out and call the stamping methods for the
/// phases they can observe. Stamping is optional per phase.
#[derive(Clone, Debug, Default)]
pub struct TraceRecorder {
    events: Arc<Mutex<TraceEvents>>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dns_start(&self) {
        lock_unpoisoned(&self.events).dns_start = Some(Instant::now());
    }

    pub fn dns_done(&self) {
        lock_unpoisoned(&self.events).dns_done = Some(Instant::now());
    }

    pub fn conn_requested(&self) {
        lock_unpoisoned(&self.events).conn_requested = Some(Instant::now());
    }

    pub fn conn_obtained(&self, reused: bool, was_idle: bool, idle_time: Duration) {
        let mut events = lock_unpoisoned(&self.events);
        events.conn_obtained = Some(Instant::now());
        events.conn_reused = reused;
        events.conn_was_idle = was_idle;
        events.conn_idle_time = idle_time;
    }

    pub fn connect_start(&self) {
        lock_unpoisoned(&self.events).connect_start = Some(Instant::now());
    }

    pub fn connect_done(&self) {
        lock_unpoisoned(&self.events).connect_done = Some(Instant::now());
    }

    pub fn tls_handshake_start(&self) {
        lock_unpoisoned(&self.events).tls_start = Some(Instant::now());
    }

    pub fn tls_handshake_done(&self) {
        lock_unpoisoned(&self.events).tls_done = Some(Instant::now());
    }

    pub fn request_written(&self) {
        lock_unpoisoned(&self.events).request_written = Some(Instant::now());
    }

    pub fn first_response_byte(&self) {
        lock_unpoisoned(&self.events).first_response_byte = Some(Instant::now());
    }
}

/// Brackets one attempt: created when the attempt starts, snapshotted
/// into a [`TraceInfo`] when it ends.
#[derive(Clone, Debug)]
pub(crate) struct ClientTrace {
    started_at: Instant,
    recorder: TraceRecorder,
}

fn span(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

impl ClientTrace {
    pub(crate) fn begin() -> Self {
        Self {
            started_at: Instant::now(),
            recorder: TraceRecorder::new(),
        }
    }

    pub(crate) fn recorder(&self) -> TraceRecorder {
        self.recorder.clone()
    }

    pub(crate) fn finish(&self) -> TraceInfo {
        let ended_at = Instant::now();
        let events = lock_unpoisoned(&self.recorder.events);

        TraceInfo {
            dns_lookup_time: span(events.dns_start, events.dns_done),
            conn_time: span(events.conn_requested, events.conn_obtained),
            tcp_conn_time: span(events.connect_start, events.connect_done),
            tls_handshake_time: span(events.tls_start, events.tls_done),
            server_time: span(events.request_written, events.first_response_byte),
            response_time: span(events.first_response_byte, Some(ended_at)),
            total_time: ended_at.saturating_duration_since(self.started_at),
            is_conn_reused: events.conn_reused,
            is_conn_was_idle: events.conn_was_idle,
            conn_idle_time: events.conn_idle_time,
        }
    }
}
