//! Prometheus counters and histograms
//!
//! Exposed on the `/metrics` endpoint of the operator's HTTP server.

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

/// Render every metric in `registry` in the Prometheus text exposition format
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {}", e)))
}

/// Operator metrics, cheap to clone and share across tasks
#[derive(Clone)]
pub struct Metrics {
    /// Certificates successfully renewed since process start
    pub renewals_total: IntCounter,
    /// Wall-clock duration of complete renewal cycles (annotation removal
    /// through restoration)
    pub renewal_cycle_seconds: Histogram,
    /// Renewal attempts skipped because another worker held the ingress lock
    pub contention_skips_total: IntCounter,
}

impl Metrics {
    /// Create the metric family and register it with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let renewals_total = IntCounter::new(
            "certgate_certificate_renewals_total",
            "Total number of certificates successfully renewed",
        )?;
        let renewal_cycle_seconds = Histogram::with_opts(HistogramOpts::new(
            "certgate_renewal_cycle_duration_seconds",
            "Duration of complete renewal cycles in seconds",
        ))?;
        let contention_skips_total = IntCounter::new(
            "certgate_renewals_skipped_contended_total",
            "Renewal attempts skipped because the ingress was locked",
        )?;

        registry.register(Box::new(renewals_total.clone()))?;
        registry.register(Box::new(renewal_cycle_seconds.clone()))?;
        registry.register(Box::new(contention_skips_total.clone()))?;

        Ok(Self {
            renewals_total,
            renewal_cycle_seconds,
            contention_skips_total,
        })
    }

    /// Unregistered metrics for unit tests
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(&Registry::new()).unwrap()
    }
}
