use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Request metrics
    pub total_requests: IntCounter,
    pub failed_requests: IntCounter,
    pub request_duration: Histogram,

    // Interceptor metrics
    pub interceptor_executions_total: IntCounter,
    pub interceptor_errors_total: IntCounter,
    pub interceptor_execution_duration: Histogram,
    pub async_interceptors_dispatched: IntCounter,

    // Buffering metrics
    pub buffered_bytes_total: IntCounter,

    // Change stream metrics
    pub change_stream_workers: IntGauge,
    pub change_stream_sessions: IntGauge,
    pub change_stream_events_total: IntCounter,
    pub change_stream_reconnects_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let total_requests = IntCounter::new("restpipe_requests_total", "Total number of requests")
            .expect("metric creation failed");
        let failed_requests = IntCounter::new(
            "restpipe_requests_failed",
            "Total number of requests answered with a server error",
        )
        .expect("metric creation failed");
        let request_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "restpipe_request_duration_seconds",
            "Request duration in seconds",
        ))
        .expect("metric creation failed");

        let interceptor_executions_total = IntCounter::new(
            "restpipe_interceptor_executions_total",
            "Total number of interceptor handle invocations",
        )
        .expect("metric creation failed");
        let interceptor_errors_total = IntCounter::new(
            "restpipe_interceptor_errors_total",
            "Total number of interceptor resolve or handle failures",
        )
        .expect("metric creation failed");
        let interceptor_execution_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "restpipe_interceptor_execution_duration_seconds",
            "Interceptor handle duration in seconds",
        ))
        .expect("metric creation failed");
        let async_interceptors_dispatched = IntCounter::new(
            "restpipe_async_interceptors_dispatched_total",
            "Total number of RESPONSE_ASYNC interceptor tasks submitted",
        )
        .expect("metric creation failed");

        let buffered_bytes_total = IntCounter::new(
            "restpipe_buffered_bytes_total",
            "Total number of response bytes held by the buffering conduit",
        )
        .expect("metric creation failed");

        let change_stream_workers = IntGauge::new(
            "restpipe_change_stream_workers",
            "Number of running change stream workers",
        )
        .expect("metric creation failed");
        let change_stream_sessions = IntGauge::new(
            "restpipe_change_stream_sessions",
            "Number of attached change stream sessions",
        )
        .expect("metric creation failed");
        let change_stream_events_total = IntCounter::new(
            "restpipe_change_stream_events_total",
            "Total number of change events fanned out",
        )
        .expect("metric creation failed");
        let change_stream_reconnects_total = IntCounter::new(
            "restpipe_change_stream_reconnects_total",
            "Total number of change stream reconnects after transient errors",
        )
        .expect("metric creation failed");

        // Register all metrics
        registry.register(Box::new(total_requests.clone())).unwrap();
        registry
            .register(Box::new(failed_requests.clone()))
            .unwrap();
        registry
            .register(Box::new(request_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(interceptor_executions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(interceptor_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(interceptor_execution_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(async_interceptors_dispatched.clone()))
            .unwrap();
        registry
            .register(Box::new(buffered_bytes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(change_stream_workers.clone()))
            .unwrap();
        registry
            .register(Box::new(change_stream_sessions.clone()))
            .unwrap();
        registry
            .register(Box::new(change_stream_events_total.clone()))
            .unwrap();
        registry
            .register(Box::new(change_stream_reconnects_total.clone()))
            .unwrap();

        Self {
            registry,
            total_requests,
            failed_requests,
            request_duration,
            interceptor_executions_total,
            interceptor_errors_total,
            interceptor_execution_duration,
            async_interceptors_dispatched,
            buffered_bytes_total,
            change_stream_workers,
            change_stream_sessions,
            change_stream_events_total,
            change_stream_reconnects_total,
        }
    }

    pub fn record_request(&self) {
        self.total_requests.inc();
    }

    pub fn record_failed_request(&self) {
        self.failed_requests.inc();
    }

    pub fn record_request_duration(&self, duration: std::time::Duration) {
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_interceptor_execution(&self, duration: std::time::Duration, success: bool) {
        self.interceptor_executions_total.inc();
        self.interceptor_execution_duration
            .observe(duration.as_secs_f64());
        if !success {
            self.interceptor_errors_total.inc();
        }
    }

    pub fn record_interceptor_error(&self) {
        self.interceptor_errors_total.inc();
    }

    pub fn record_async_dispatch(&self) {
        self.async_interceptors_dispatched.inc();
    }

    pub fn record_buffered_bytes(&self, bytes: usize) {
        self.buffered_bytes_total.inc_by(bytes as u64);
    }

    pub fn worker_started(&self) {
        self.change_stream_workers.inc();
    }

    pub fn worker_stopped(&self) {
        self.change_stream_workers.dec();
    }

    pub fn session_attached(&self) {
        self.change_stream_sessions.inc();
    }

    pub fn session_detached(&self) {
        self.change_stream_sessions.dec();
    }

    pub fn record_change_event(&self) {
        self.change_stream_events_total.inc();
    }

    pub fn record_reconnect(&self) {
        self.change_stream_reconnects_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.gather_metrics(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

pub struct RequestTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl RequestTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.record_request();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
    }

    pub fn fail(self) {
        let duration = self.start.elapsed();
        self.metrics.record_request_duration(duration);
        self.metrics.record_failed_request();
    }
}
