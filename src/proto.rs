//! Generated gRPC types for `synapse.v1.MetricsService` and their mapping onto
//! [`WireMetric`].

use crate::model::WireMetric;

#[allow(clippy::all, rust_2018_idioms, missing_debug_implementations)]
pub mod v1 {
    tonic::include_proto!("synapse.v1");
}

pub use v1::metrics_service_client::MetricsServiceClient;
pub use v1::metrics_service_server::{MetricsService, MetricsServiceServer};
pub use v1::{Metric, PingRequest, PingResponse, UpdateMetricsRequest, UpdateMetricsResponse};

/// Request metadata key carrying the agent's origin address
pub const ORIGIN_METADATA: &str = "x-real-ip";

/// Largest message either side encodes or decodes
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

impl From<WireMetric> for Metric {
    fn from(wire: WireMetric) -> Self {
        Self {
            id: wire.id,
            r#type: wire.kind,
            value: wire.value,
            delta: wire.delta,
            hash: wire.hash.unwrap_or_default(),
        }
    }
}

/// An empty `hash` means the metric is neither signed nor encrypted
impl From<Metric> for WireMetric {
    fn from(metric: Metric) -> Self {
        Self {
            id: metric.id,
            kind: metric.r#type,
            delta: metric.delta,
            value: metric.value,
            hash: Some(metric.hash).filter(|h| !h.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricSample;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_metric_mapping() {
        let mut wire = WireMetric::from(&MetricSample::counter("PollCount", 7));
        wire.hash = Some("abcd".into());

        let metric = Metric::from(wire.clone());
        assert_eq!(metric.r#type, "counter");
        assert_eq!(metric.delta, Some(7));
        assert_eq!(metric.value, None);
        assert_eq!(WireMetric::from(metric), wire);
    }

    #[test]
    fn test_empty_hash_is_absent() {
        let metric = Metric {
            id: "Alloc".into(),
            r#type: "gauge".into(),
            value: Some(1.5),
            delta: None,
            hash: String::new(),
        };
        let wire = WireMetric::from(metric);
        assert_eq!(wire.hash, None);
        assert_eq!(MetricSample::try_from(wire).unwrap(), MetricSample::gauge("Alloc", 1.5));
    }
}
