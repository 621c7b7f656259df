use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_cycles_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub offers_sent_total: IntCounter,
    pub late_acceptances_total: IntCounter,
    pub match_requests_in_queue: IntGauge,
    pub connected_drivers: IntGauge,
    pub rate_limited_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_cycles_total = IntCounterVec::new(
            Opts::new("dispatch_cycles_total", "Dispatch cycles by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_cycles_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Time from match request to cycle outcome in seconds",
            )
            .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let offers_sent_total = IntCounter::new("offers_sent_total", "Ride offers delivered to drivers")
            .expect("valid offers_sent_total metric");

        let late_acceptances_total = IntCounter::new(
            "late_acceptances_total",
            "Acceptances for rides that were no longer available",
        )
        .expect("valid late_acceptances_total metric");

        let match_requests_in_queue =
            IntGauge::new("match_requests_in_queue", "Match requests waiting for the coordinator")
                .expect("valid match_requests_in_queue metric");

        let connected_drivers = IntGauge::new("connected_drivers", "Authenticated driver sessions")
            .expect("valid connected_drivers metric");

        let rate_limited_total = IntCounterVec::new(
            Opts::new("rate_limited_total", "Driver updates denied by the rate limiter"),
            &["operation"],
        )
        .expect("valid rate_limited_total metric");

        registry
            .register(Box::new(dispatch_cycles_total.clone()))
            .expect("register dispatch_cycles_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(offers_sent_total.clone()))
            .expect("register offers_sent_total");
        registry
            .register(Box::new(late_acceptances_total.clone()))
            .expect("register late_acceptances_total");
        registry
            .register(Box::new(match_requests_in_queue.clone()))
            .expect("register match_requests_in_queue");
        registry
            .register(Box::new(connected_drivers.clone()))
            .expect("register connected_drivers");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");

        Self {
            registry,
            dispatch_cycles_total,
            dispatch_latency_seconds,
            offers_sent_total,
            late_acceptances_total,
            match_requests_in_queue,
            connected_drivers,
            rate_limited_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
