use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// One increment per request resolved by the cache decision engine,
    /// labelled with the decision state.
    pub static ref EDGE_CACHE_DECISIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "edge_cache_decisions_total",
                "Cache decisions by resulting state",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref EDGE_CACHE_ORIGIN_FETCHES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "edge_cache_origin_fetches_total",
                "Network fetches issued by the cache, by cache mode and result",
            ),
            &["mode", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref EDGE_CACHE_PASSTHROUGH: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "edge_cache_passthrough_total",
                "Requests handed to the network without cache involvement",
            ),
            &["reason"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref EDGE_CACHE_STORE_WRITE_FAILURES: IntCounter = {
        let metric = IntCounter::new(
            "edge_cache_store_write_failures_total",
            "Fetched responses that could not be written to the store",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref BLOOM_FILTER_REFRESHES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "bloom_filter_refreshes_total",
                "Invalidation set refresh attempts",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref BLOOM_FILTER_BITS: IntGauge = {
        let metric = IntGauge::new(
            "bloom_filter_bits",
            "Size in bits of the currently published invalidation set",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_metrics_accessible() {
        let before = EDGE_CACHE_DECISIONS.with_label_values(&["fresh_valid"]).get();
        EDGE_CACHE_DECISIONS.with_label_values(&["fresh_valid"]).inc();
        assert_eq!(
            EDGE_CACHE_DECISIONS.with_label_values(&["fresh_valid"]).get(),
            before + 1
        );
    }

    #[test]
    fn test_bloom_filter_gauge() {
        BLOOM_FILTER_BITS.set(4096);
        assert_eq!(BLOOM_FILTER_BITS.get(), 4096);
    }

    #[test]
    fn test_encode_metrics_succeeds() {
        EDGE_CACHE_PASSTHROUGH.with_label_values(&["not_configured"]).inc();
        let encoded = encode_metrics().expect("metrics should encode");
        assert!(encoded.contains("edge_cache_passthrough_total"));
    }
}
