use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Why a websocket handshake did not reach the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Authentication,
    Authorization,
    Unavailable,
}

impl RejectReason {
    const ALL: [Self; 3] = [Self::Authentication, Self::Authorization, Self::Unavailable];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Why relay traffic was lost before reaching local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDropReason {
    /// In-process subscriber fell behind and skipped frames.
    Lagged,
    /// Listener connection was re-established; frames sent meanwhile are gone.
    Reconnect,
    /// Frame payload could not be decoded.
    Decode,
    /// A content reference could not be resolved from the document store.
    Resolve,
}

impl RelayDropReason {
    const ALL: [Self; 4] = [Self::Lagged, Self::Reconnect, Self::Decode, Self::Resolve];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Lagged => "lagged",
            Self::Reconnect => "reconnect",
            Self::Decode => "decode",
            Self::Resolve => "resolve",
        }
    }
}

pub struct SyncMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    active_connections: AtomicI64,
    connections_opened_total: AtomicU64,
    connections_rejected_total: Mutex<HashMap<&'static str, u64>>,
    edits_applied_total: AtomicU64,
    viewer_edits_rejected_total: AtomicU64,
    invalid_messages_total: AtomicU64,
    persistence_failures_total: AtomicU64,
    relay_published_total: AtomicU64,
    relay_publish_failures_total: AtomicU64,
    relay_received_total: AtomicU64,
    relay_dropped_total: Mutex<HashMap<&'static str, u64>>,
    presence_broadcasts_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<SyncMetrics>> = OnceLock::new();

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            connections_opened_total: AtomicU64::new(0),
            connections_rejected_total: Mutex::new(
                RejectReason::ALL.iter().map(|reason| (reason.as_str(), 0)).collect(),
            ),
            edits_applied_total: AtomicU64::new(0),
            viewer_edits_rejected_total: AtomicU64::new(0),
            invalid_messages_total: AtomicU64::new(0),
            persistence_failures_total: AtomicU64::new(0),
            relay_published_total: AtomicU64::new(0),
            relay_publish_failures_total: AtomicU64::new(0),
            relay_received_total: AtomicU64::new(0),
            relay_dropped_total: Mutex::new(
                RelayDropReason::ALL.iter().map(|reason| (reason.as_str(), 0)).collect(),
            ),
            presence_broadcasts_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<SyncMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<SyncMetrics>> {
    GLOBAL_METRICS.get()
}

fn with_global(record: impl FnOnce(&SyncMetrics)) {
    if let Some(metrics) = global_metrics() {
        record(metrics);
    }
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    with_global(|metrics| metrics.record_http_request(method, path, status_code, latency_ms));
}

pub fn connection_opened() {
    with_global(SyncMetrics::connection_opened);
}

pub fn connection_closed() {
    with_global(SyncMetrics::connection_closed);
}

pub fn connection_rejected(reason: RejectReason) {
    with_global(|metrics| metrics.connection_rejected(reason));
}

pub fn edit_applied() {
    with_global(|metrics| bump(&metrics.edits_applied_total));
}

pub fn viewer_edit_rejected() {
    with_global(|metrics| bump(&metrics.viewer_edits_rejected_total));
}

pub fn invalid_message() {
    with_global(|metrics| bump(&metrics.invalid_messages_total));
}

pub fn persistence_failure() {
    with_global(|metrics| bump(&metrics.persistence_failures_total));
}

pub fn relay_published() {
    with_global(|metrics| bump(&metrics.relay_published_total));
}

pub fn relay_publish_failure() {
    with_global(|metrics| bump(&metrics.relay_publish_failures_total));
}

pub fn relay_received() {
    with_global(|metrics| bump(&metrics.relay_received_total));
}

pub fn relay_dropped(reason: RelayDropReason, count: u64) {
    with_global(|metrics| metrics.relay_dropped(reason, count));
}

pub fn presence_broadcast() {
    with_global(|metrics| bump(&metrics.presence_broadcasts_total));
}

impl SyncMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn connection_opened(&self) {
        bump(&self.connections_opened_total);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connection_rejected(&self, reason: RejectReason) {
        let mut guard = lock(&self.connections_rejected_total);
        let value = guard.entry(reason.as_str()).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn relay_dropped(&self, reason: RelayDropReason, count: u64) {
        let mut guard = lock(&self.relay_dropped_total);
        let value = guard.entry(reason.as_str()).or_insert(0);
        *value = value.saturating_add(count);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP syncroom_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE syncroom_request_rate_total counter\n");
        append_counter_lines(&mut output, "syncroom_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP syncroom_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE syncroom_request_errors_total counter\n");
        append_counter_lines(
            &mut output,
            "syncroom_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP syncroom_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE syncroom_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "syncroom_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP syncroom_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE syncroom_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "syncroom_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP syncroom_active_connections Live room connections on this instance.\n");
        output.push_str("# TYPE syncroom_active_connections gauge\n");
        output.push_str(&format!("syncroom_active_connections {}\n", self.active_connections()));

        append_single_counter(
            &mut output,
            "syncroom_connections_opened_total",
            "Room connections admitted to the active state.",
            &self.connections_opened_total,
        );

        output.push_str("# HELP syncroom_connections_rejected_total Room handshakes refused by reason.\n");
        output.push_str("# TYPE syncroom_connections_rejected_total counter\n");
        append_reason_lines(
            &mut output,
            "syncroom_connections_rejected_total",
            &self.connections_rejected_total,
        );

        append_single_counter(
            &mut output,
            "syncroom_edits_applied_total",
            "Edits persisted and broadcast.",
            &self.edits_applied_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_viewer_edits_rejected_total",
            "Edits refused because the sender is a viewer.",
            &self.viewer_edits_rejected_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_invalid_messages_total",
            "Inbound messages that could not be read as document text.",
            &self.invalid_messages_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_persistence_failures_total",
            "Edits whose save failed.",
            &self.persistence_failures_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_relay_published_total",
            "Frames published on the inter-instance relay.",
            &self.relay_published_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_relay_publish_failures_total",
            "Relay publishes that failed.",
            &self.relay_publish_failures_total,
        );
        append_single_counter(
            &mut output,
            "syncroom_relay_received_total",
            "Relay frames delivered to local connections.",
            &self.relay_received_total,
        );

        output.push_str("# HELP syncroom_relay_dropped_total Relay frames lost before local delivery by reason.\n");
        output.push_str("# TYPE syncroom_relay_dropped_total counter\n");
        append_reason_lines(&mut output, "syncroom_relay_dropped_total", &self.relay_dropped_total);

        append_single_counter(
            &mut output,
            "syncroom_presence_broadcasts_total",
            "Presence lists sent after membership changes.",
            &self.presence_broadcasts_total,
        );

        output
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapse per-room paths so room ids do not become label values.
fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    if path.starts_with("/ws/") {
        return "/ws/{room}".to_string();
    }
    if path.starts_with("/api/rooms/") && path.ends_with("/users") {
        return "/api/rooms/{room}/users".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_reason_lines(output: &mut String, metric_name: &str, map: &Mutex<HashMap<&'static str, u64>>) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (reason, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{reason=\"{}\"}} {value}\n",
            escape_label_value(reason),
        ));
    }
}

fn append_single_counter(output: &mut String, metric_name: &str, help: &str, counter: &AtomicU64) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} counter\n"));
    output.push_str(&format!("{metric_name} {}\n", counter.load(Ordering::SeqCst)));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
