//! Counters and histograms for connections, pools and per-endpoint traffic,
//! with a Prometheus text rendering.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bucket bounds in seconds. +Inf is reported from `count`.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Operation labels, in render order. Anything unknown lands in "other".
const OPERATIONS: [&str; 9] = [
    "bind", "search", "add", "modify", "delete", "modify_dn", "compare", "extended", "other",
];

fn op_index(op: &str) -> usize {
    OPERATIONS
        .iter()
        .position(|&o| o == op)
        .unwrap_or(OPERATIONS.len() - 1)
}

/// Non-cumulative buckets + count + sum (microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStatistics {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    intermediate_responses_received: AtomicU64,
    unsolicited_notifications: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    response_time_micros: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConnectionStatisticsSnapshot {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub intermediate_responses_received: u64,
    pub unsolicited_notifications: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Mean time from send to final response, in microseconds.
    pub average_response_time_micros: u64,
}

impl ConnectionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_request(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_response(&self, elapsed: Duration) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
        self.response_time_micros
            .fetch_add(elapsed.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_intermediate(&self) {
        self.intermediate_responses_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unsolicited(&self) {
        self.unsolicited_notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// `timeouts` is left at zero; deadlines are counted by the pending table.
    pub fn snapshot(&self) -> ConnectionStatisticsSnapshot {
        let responses = self.responses_received.load(Ordering::Relaxed);
        let total_micros = self.response_time_micros.load(Ordering::Relaxed);
        ConnectionStatisticsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: responses,
            intermediate_responses_received: self.intermediate_responses_received.load(Ordering::Relaxed),
            unsolicited_notifications: self.unsolicited_notifications.load(Ordering::Relaxed),
            timeouts: 0,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            average_response_time_micros: if responses == 0 { 0 } else { total_micros / responses },
        }
    }
}

/// Pool counters. Gauges (available / checked out) are read from the pool itself.
#[derive(Debug, Default)]
pub struct PoolStatistics {
    connections_created: AtomicU64,
    failed_connection_attempts: AtomicU64,
    connections_closed_defunct: AtomicU64,
    connections_closed_expired: AtomicU64,
    connections_closed_unneeded: AtomicU64,
    checkouts_immediate: AtomicU64,
    checkouts_after_wait: AtomicU64,
    checkouts_new_connection: AtomicU64,
    checkouts_failed: AtomicU64,
    releases_healthy: AtomicU64,
    releases_unhealthy: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PoolStatisticsSnapshot {
    pub connections_created: u64,
    pub failed_connection_attempts: u64,
    pub connections_closed_defunct: u64,
    pub connections_closed_expired: u64,
    pub connections_closed_unneeded: u64,
    pub checkouts_immediate: u64,
    pub checkouts_after_wait: u64,
    pub checkouts_new_connection: u64,
    pub checkouts_failed: u64,
    pub releases_healthy: u64,
    pub releases_unhealthy: u64,
    pub health_checks: u64,
    pub health_check_failures: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PoolStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        inc_connection_created => connections_created,
        inc_failed_connection_attempt => failed_connection_attempts,
        inc_closed_defunct => connections_closed_defunct,
        inc_closed_expired => connections_closed_expired,
        inc_closed_unneeded => connections_closed_unneeded,
        inc_checkout_immediate => checkouts_immediate,
        inc_checkout_after_wait => checkouts_after_wait,
        inc_checkout_new_connection => checkouts_new_connection,
        inc_checkout_failed => checkouts_failed,
        inc_release_healthy => releases_healthy,
        inc_release_unhealthy => releases_unhealthy,
        inc_health_check => health_checks,
        inc_health_check_failure => health_check_failures,
    }

    pub fn snapshot(&self) -> PoolStatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStatisticsSnapshot {
            connections_created: load(&self.connections_created),
            failed_connection_attempts: load(&self.failed_connection_attempts),
            connections_closed_defunct: load(&self.connections_closed_defunct),
            connections_closed_expired: load(&self.connections_closed_expired),
            connections_closed_unneeded: load(&self.connections_closed_unneeded),
            checkouts_immediate: load(&self.checkouts_immediate),
            checkouts_after_wait: load(&self.checkouts_after_wait),
            checkouts_new_connection: load(&self.checkouts_new_connection),
            checkouts_failed: load(&self.checkouts_failed),
            releases_healthy: load(&self.releases_healthy),
            releases_unhealthy: load(&self.releases_unhealthy),
            health_checks: load(&self.health_checks),
            health_check_failures: load(&self.health_check_failures),
        }
    }

    /// Prometheus exposition for one pool.
    pub fn render(&self, pool: &str, available: usize, checked_out: usize) -> String {
        let s = self.snapshot();
        let pool = escape_label(pool);
        let mut out = String::new();
        out.push_str("# HELP ldap_client_pool_connections Connections currently held by the pool by state.\n");
        out.push_str("# TYPE ldap_client_pool_connections gauge\n");
        out.push_str(&format!(
            "ldap_client_pool_connections{{pool=\"{}\",state=\"available\"}} {}\n",
            pool, available
        ));
        out.push_str(&format!(
            "ldap_client_pool_connections{{pool=\"{}\",state=\"checked_out\"}} {}\n",
            pool, checked_out
        ));

        out.push_str("# HELP ldap_client_pool_events_total Pool lifecycle events.\n");
        out.push_str("# TYPE ldap_client_pool_events_total counter\n");
        for (event, val) in [
            ("connection_created", s.connections_created),
            ("failed_connection_attempt", s.failed_connection_attempts),
            ("closed_defunct", s.connections_closed_defunct),
            ("closed_expired", s.connections_closed_expired),
            ("closed_unneeded", s.connections_closed_unneeded),
            ("checkout_immediate", s.checkouts_immediate),
            ("checkout_after_wait", s.checkouts_after_wait),
            ("checkout_new_connection", s.checkouts_new_connection),
            ("checkout_failed", s.checkouts_failed),
            ("release_healthy", s.releases_healthy),
            ("release_unhealthy", s.releases_unhealthy),
            ("health_check", s.health_checks),
            ("health_check_failure", s.health_check_failures),
        ] {
            out.push_str(&format!(
                "ldap_client_pool_events_total{{pool=\"{}\",event=\"{}\"}} {}\n",
                pool, event, val
            ));
        }
        out
    }
}

/// Traffic shared by every connection created through one server set.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    connections_total: AtomicU64,
    connect_failures: AtomicU64,
    decode_errors: AtomicU64,
    timeouts: AtomicU64,
    /// (endpoint, op) -> request count
    endpoint_requests: dashmap::DashMap<(String, &'static str), AtomicU64>,
    errors: [AtomicU64; 9],
    durations: [DurationHistogram; 9],
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_request(&self, endpoint: &str, op: &'static str) {
        self.endpoint_requests
            .entry((endpoint.to_string(), op))
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_error(&self, op: &str) {
        self.errors[op_index(op)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        self.durations[op_index(op)].observe(duration);
    }

    pub fn requests_for(&self, endpoint: &str) -> u64 {
        self.endpoint_requests
            .iter()
            .filter(|e| e.key().0 == endpoint)
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP ldap_client_connections_total Connections established.\n");
        out.push_str("# TYPE ldap_client_connections_total counter\n");
        out.push_str(&format!(
            "ldap_client_connections_total {}\n",
            self.connections_total.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_client_connect_failures_total Failed connection attempts.\n");
        out.push_str("# TYPE ldap_client_connect_failures_total counter\n");
        out.push_str(&format!(
            "ldap_client_connect_failures_total {}\n",
            self.connect_failures.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_client_decode_errors_total Inbound messages that failed to decode.\n");
        out.push_str("# TYPE ldap_client_decode_errors_total counter\n");
        out.push_str(&format!(
            "ldap_client_decode_errors_total {}\n",
            self.decode_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_client_timeouts_total Requests that hit their deadline.\n");
        out.push_str("# TYPE ldap_client_timeouts_total counter\n");
        out.push_str(&format!(
            "ldap_client_timeouts_total {}\n",
            self.timeouts.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_client_requests_total Requests sent to each endpoint by operation.\n");
        out.push_str("# TYPE ldap_client_requests_total counter\n");
        let mut rows: Vec<(String, &'static str, u64)> = self
            .endpoint_requests
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1, e.value().load(Ordering::Relaxed)))
            .collect();
        rows.sort();
        for (endpoint, op, count) in rows {
            out.push_str(&format!(
                "ldap_client_requests_total{{endpoint=\"{}\",op=\"{}\"}} {}\n",
                escape_label(&endpoint),
                op,
                count
            ));
        }

        out.push_str("# HELP ldap_client_errors_total Failed requests by operation.\n");
        out.push_str("# TYPE ldap_client_errors_total counter\n");
        for (i, op) in OPERATIONS.iter().enumerate() {
            out.push_str(&format!(
                "ldap_client_errors_total{{op=\"{}\"}} {}\n",
                op,
                self.errors[i].load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_client_request_duration_seconds Time from send to final response by operation.\n");
        out.push_str("# TYPE ldap_client_request_duration_seconds histogram\n");
        for (i, op) in OPERATIONS.iter().enumerate() {
            let hist = &self.durations[i];
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (b, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[b].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_client_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_requests_metric() {
        let m = ClientMetrics::default();
        m.inc_request("ldap://ldap1:389", "search");
        m.inc_request("ldap://ldap1:389", "search");
        m.inc_request("ldap://ldap2:389", "bind");
        let out = m.render();
        assert!(out.contains("ldap_client_requests_total{endpoint=\"ldap://ldap1:389\",op=\"search\"} 2"));
        assert!(out.contains("ldap_client_requests_total{endpoint=\"ldap://ldap2:389\",op=\"bind\"} 1"));
        assert_eq!(m.requests_for("ldap://ldap1:389"), 2);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let m = ClientMetrics::default();
        m.observe_duration("bind", Duration::from_millis(3));
        m.observe_duration("bind", Duration::from_millis(30));
        let out = m.render();
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"bind\",le=\"0.005\"} 1"));
        assert!(out.contains("ldap_client_request_duration_seconds_bucket{op=\"bind\",le=\"0.05\"} 2"));
        assert!(out.contains("ldap_client_request_duration_seconds_count{op=\"bind\"} 2"));
    }

    #[test]
    fn test_unknown_op_counts_as_other() {
        let m = ClientMetrics::default();
        m.inc_error("frobnicate");
        assert!(m.render().contains("ldap_client_errors_total{op=\"other\"} 1"));
    }

    #[test]
    fn test_connection_statistics_average() {
        let s = ConnectionStatistics::new();
        s.inc_request(10);
        s.inc_request(20);
        s.observe_response(Duration::from_micros(100));
        s.observe_response(Duration::from_micros(300));
        let snap = s.snapshot();
        assert_eq!(snap.requests_sent, 2);
        assert_eq!(snap.bytes_sent, 30);
        assert_eq!(snap.average_response_time_micros, 200);
    }

    #[test]
    fn test_pool_render_labels() {
        let s = PoolStatistics::new();
        s.inc_connection_created();
        s.inc_release_unhealthy();
        let out = s.render("main", 3, 1);
        assert!(out.contains("ldap_client_pool_connections{pool=\"main\",state=\"available\"} 3"));
        assert!(out.contains("ldap_client_pool_events_total{pool=\"main\",event=\"release_unhealthy\"} 1"));
        assert_eq!(s.snapshot().connections_created, 1);
    }
}
