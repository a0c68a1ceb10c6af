//! Metric names and the Prometheus recorder hookup.
//!
//! Names are defined once here so emit sites and dashboards cannot drift.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::debug;

/// Gauge: sessions currently registered.
pub const SESSIONS_ACTIVE: &str = "patchbay_sessions_active";
/// Counter: sessions accepted since startup.
pub const SESSIONS_CONNECTED_TOTAL: &str = "patchbay_sessions_connected_total";
/// Counter: sessions fully closed and evicted since startup.
pub const SESSIONS_CLOSED_TOTAL: &str = "patchbay_sessions_closed_total";
/// Counter: outbound frames dropped because a session queue was full.
pub const SEND_DROPS_TOTAL: &str = "patchbay_send_drops_total";
/// Counter: sessions closed for falling too far behind a shared fan-out.
pub const SLOW_CLIENT_CLOSES_TOTAL: &str = "patchbay_slow_client_closes_total";
/// Counter: sessions closed after missing consecutive keepalive replies.
pub const KEEPALIVE_TIMEOUTS_TOTAL: &str = "patchbay_keepalive_timeouts_total";
/// Counter: connections refused by parameter validation.
pub const BINDING_FAILURES_TOTAL: &str = "patchbay_binding_failures_total";
/// Counter: connections refused by the dispatch guard.
pub const DISPATCH_VETOES_TOTAL: &str = "patchbay_dispatch_vetoes_total";

/// Installs the process-wide Prometheus recorder and returns the render
/// handle for the `/metrics` endpoint.
///
/// Only one recorder can exist per process. When another instance got
/// there first (several servers in one test process, say), recording
/// still flows to that recorder and this instance serves no `/metrics`
/// snapshot of its own.
pub fn try_install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            debug!(error = %err, "prometheus recorder unavailable; /metrics disabled for this instance");
            None
        }
    }
}
