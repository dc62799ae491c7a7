//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; no exporter is bundled, the
//! embedding process installs whichever recorder it wants. Without one every
//! call here is a no-op.
//!
//! Provided metrics:
//! * `kingress_requests_total` (counter; labels: method, status)
//! * `kingress_request_duration_seconds` (histogram; labels: method)
//! * `kingress_backend_requests_total` (counter; labels: backend, outcome)
//! * `kingress_backend_request_duration_seconds` (histogram; labels: backend)
//! * `kingress_reconcile_cycles_total` (counter; labels: outcome)
//! * `kingress_routing_table_entries` (gauge; labels: kind)
//! * `kingress_sni_misses_total` (counter)
//! * `kingress_websocket_upgrades_total` (counter)
//! * `kingress_active_connections` (gauge; labels: scheme)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const KINGRESS_REQUESTS_TOTAL: &str = "kingress_requests_total";
pub const KINGRESS_REQUEST_DURATION_SECONDS: &str = "kingress_request_duration_seconds";
pub const KINGRESS_BACKEND_REQUESTS_TOTAL: &str = "kingress_backend_requests_total";
pub const KINGRESS_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "kingress_backend_request_duration_seconds";
pub const KINGRESS_RECONCILE_CYCLES_TOTAL: &str = "kingress_reconcile_cycles_total";
pub const KINGRESS_ROUTING_TABLE_ENTRIES: &str = "kingress_routing_table_entries";
pub const KINGRESS_SNI_MISSES_TOTAL: &str = "kingress_sni_misses_total";
pub const KINGRESS_WEBSOCKET_UPGRADES_TOTAL: &str = "kingress_websocket_upgrades_total";
pub const KINGRESS_ACTIVE_CONNECTIONS: &str = "kingress_active_connections";

/// Last published routing table gauges, by kind
pub static ROUTING_TABLE_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        KINGRESS_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests answered by the proxy."
    );
    describe_histogram!(
        KINGRESS_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from request receipt until the response head is ready."
    );
    describe_counter!(
        KINGRESS_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to backend services."
    );
    describe_histogram!(
        KINGRESS_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to backend services."
    );
    describe_counter!(
        KINGRESS_RECONCILE_CYCLES_TOTAL,
        Unit::Count,
        "Routing table reconciliation cycles (by outcome)."
    );
    describe_gauge!(
        KINGRESS_ROUTING_TABLE_ENTRIES,
        "Entries in the currently published routing table."
    );
    describe_counter!(
        KINGRESS_SNI_MISSES_TOTAL,
        Unit::Count,
        "TLS handshakes aborted because no certificate matched the SNI hostname."
    );
    describe_counter!(
        KINGRESS_WEBSOCKET_UPGRADES_TOTAL,
        Unit::Count,
        "WebSocket connections spliced to a backend."
    );
    describe_gauge!(
        KINGRESS_ACTIVE_CONNECTIONS,
        "Client connections currently being served."
    );

    Mutex::new(HashMap::new())
});

/// Increment the total request counter for an answered request.
pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        KINGRESS_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: std::time::Duration) {
    histogram!(KINGRESS_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Count a forwarded request. `outcome` is a short label such as
/// `response`, `error` or `timeout`.
pub fn increment_backend_request_total(backend: &str, outcome: &'static str) {
    counter!(
        KINGRESS_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_backend_request_duration(backend: &str, duration: std::time::Duration) {
    histogram!(KINGRESS_BACKEND_REQUEST_DURATION_SECONDS, "backend" => backend.to_string())
        .record(duration.as_secs_f64());
}

pub fn increment_reconcile_cycles(outcome: &'static str) {
    counter!(KINGRESS_RECONCILE_CYCLES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record the size of a freshly published routing table.
pub fn set_routing_table_entries(total: usize, secure: usize) {
    if let Ok(mut gauges) = ROUTING_TABLE_GAUGES.lock() {
        gauges.insert("total".to_string(), total as f64);
        gauges.insert("secure".to_string(), secure as f64);
    } else {
        tracing::error!("Failed to acquire lock for routing table gauges");
    }

    gauge!(KINGRESS_ROUTING_TABLE_ENTRIES, "kind" => "total").set(total as f64);
    gauge!(KINGRESS_ROUTING_TABLE_ENTRIES, "kind" => "secure").set(secure as f64);
}

pub fn increment_sni_misses() {
    counter!(KINGRESS_SNI_MISSES_TOTAL).increment(1);
}

pub fn increment_websocket_upgrades() {
    counter!(KINGRESS_WEBSOCKET_UPGRADES_TOTAL).increment(1);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// RAII helper measuring backend request duration.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.backend, self.start.elapsed());
    }
}

/// RAII guard tracking one open client connection.
pub struct ConnectionGauge {
    scheme: &'static str,
}

impl ConnectionGauge {
    pub fn open(scheme: &'static str) -> Self {
        gauge!(KINGRESS_ACTIVE_CONNECTIONS, "scheme" => scheme).increment(1.0);
        Self { scheme }
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!(KINGRESS_ACTIVE_CONNECTIONS, "scheme" => self.scheme).decrement(1.0);
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing kingress metrics");

    Lazy::force(&ROUTING_TABLE_GAUGES);

    Ok(())
}

/// Snapshot of the routing table gauges for ad-hoc reporting.
pub fn get_current_metrics() -> HashMap<String, f64> {
    ROUTING_TABLE_GAUGES
        .lock()
        .map(|gauges| {
            gauges
                .iter()
                .map(|(kind, value)| (format!("routing_table_{kind}"), *value))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_table_gauges() {
        set_routing_table_entries(5, 2);
        let metrics = get_current_metrics();
        assert!(metrics.contains_key("routing_table_total"));
        assert!(metrics.contains_key("routing_table_secure"));
    }

    #[test]
    fn test_timers_record_on_drop() {
        drop(RequestTimer::new("GET"));
        drop(BackendRequestTimer::new("10.0.0.1:80"));
        drop(ConnectionGauge::open("http"));
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
    }
}
