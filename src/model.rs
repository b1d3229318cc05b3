// ============================================================================
// DATA MODEL
// ============================================================================
// `MetricSample` is the validated in-process form of a metric: exactly one of
// `value` / `delta` is set and it matches `kind`. `WireMetric` is the loosely
// typed shape that arrives over the network and must be converted with
// `TryFrom` before anything touches a store.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ----------------------------------------------------------------------------
// Metric kind
// ----------------------------------------------------------------------------

/// Gauges overwrite, counters accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ValidationError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Metric sample
// ----------------------------------------------------------------------------

/// One metric observation. Storage identity is `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: CompactString,

    #[serde(rename = "type")]
    pub kind: MetricKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricSample {
    pub fn gauge(id: impl Into<CompactString>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<CompactString>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// Check the id / kind / value invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        match self.kind {
            MetricKind::Counter => {
                if self.delta.is_none() {
                    return Err(ValidationError::MissingDelta {
                        id: self.id.to_string(),
                    });
                }
                if self.value.is_some() {
                    return Err(self.conflict());
                }
            }
            MetricKind::Gauge => {
                let value = self.value.ok_or_else(|| ValidationError::MissingValue {
                    id: self.id.to_string(),
                })?;
                if self.delta.is_some() {
                    return Err(self.conflict());
                }
                if !value.is_finite() {
                    return Err(ValidationError::NonFiniteValue {
                        id: self.id.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Build a sample from the plain-text `/update/{type}/{name}/{value}` form
    pub fn parse(kind: &str, id: &str, raw: &str) -> Result<Self, ValidationError> {
        let kind: MetricKind = kind.parse()?;
        let invalid = || ValidationError::InvalidValue {
            id: id.to_string(),
            kind: kind.to_string(),
            raw: raw.to_string(),
        };

        let sample = match kind {
            MetricKind::Counter => Self::counter(id, raw.parse::<i64>().map_err(|_| invalid())?),
            MetricKind::Gauge => Self::gauge(id, raw.parse::<f64>().map_err(|_| invalid())?),
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Value rendered the way the plain-text read endpoint returns it
    pub fn value_string(&self) -> String {
        match self.kind {
            MetricKind::Counter => self.delta.unwrap_or_default().to_string(),
            MetricKind::Gauge => self.value.unwrap_or_default().to_string(),
        }
    }

    fn conflict(&self) -> ValidationError {
        ValidationError::ConflictingFields {
            id: self.id.to_string(),
            kind: self.kind.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Wire metric
// ----------------------------------------------------------------------------

/// Metric exactly as decoded from a request body or an RPC frame.
///
/// `hash` is only used by the RPC transport, where it carries either a hex
/// HMAC tag or a hex chunk-envelope ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMetric {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl TryFrom<WireMetric> for MetricSample {
    type Error = ValidationError;

    /// The field the kind does not use is discarded, so RPC frames that carry
    /// both slots convert cleanly.
    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        let kind: MetricKind = wire.kind.parse()?;
        if wire.id.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let sample = match kind {
            MetricKind::Counter => MetricSample {
                delta: Some(wire.delta.ok_or_else(|| ValidationError::MissingDelta {
                    id: wire.id.clone(),
                })?),
                id: wire.id.into(),
                kind,
                value: None,
            },
            MetricKind::Gauge => MetricSample {
                value: Some(wire.value.ok_or_else(|| ValidationError::MissingValue {
                    id: wire.id.clone(),
                })?),
                id: wire.id.into(),
                kind,
                delta: None,
            },
        };
        sample.validate()?;
        Ok(sample)
    }
}

impl From<&MetricSample> for WireMetric {
    fn from(sample: &MetricSample) -> Self {
        WireMetric {
            id: sample.id.to_string(),
            kind: sample.kind.to_string(),
            delta: sample.delta,
            value: sample.value,
            hash: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Batch
// ----------------------------------------------------------------------------

/// Ordered set of samples. Serializes as `{"metrics":[...]}`; the order is kept
/// so the signature over the serialized bytes is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
}

impl Batch {
    pub fn new(metrics: Vec<MetricSample>) -> Self {
        Self { metrics }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MetricSample> {
        self.metrics.iter()
    }

    /// Validate every sample, stopping at the first failure
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.metrics.iter().try_for_each(MetricSample::validate)
    }

    /// Decode a request body. Both `{"metrics":[...]}` and a bare array are
    /// accepted; every entry must validate or the whole body is rejected.
    pub fn from_json(bytes: &[u8]) -> Result<Result<Self, ValidationError>, serde_json::Error> {
        let body: BatchBody = serde_json::from_slice(bytes)?;
        let wire = match body {
            BatchBody::Wrapped { metrics } => metrics,
            BatchBody::Bare(metrics) => metrics,
        };
        Ok(wire
            .into_iter()
            .map(MetricSample::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map(Batch::new))
    }
}

impl FromIterator<MetricSample> for Batch {
    fn from_iter<I: IntoIterator<Item = MetricSample>>(iter: I) -> Self {
        Batch::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Batch {
    type Item = MetricSample;
    type IntoIter = std::vec::IntoIter<MetricSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a MetricSample;
    type IntoIter = std::slice::Iter<'a, MetricSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.iter()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchBody {
    Wrapped {
        #[serde(default)]
        metrics: Vec<WireMetric>,
    },
    Bare(Vec<WireMetric>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_batch_serializes_wrapped_without_empty_fields() {
        let batch = Batch::new(vec![
            MetricSample::gauge("Alloc", 1.5),
            MetricSample::counter("PollCount", 3),
        ]);
        let json = serde_json::to_string(&batch).unwrap();
        assert_eq!(
            json,
            r#"{"metrics":[{"id":"Alloc","type":"gauge","value":1.5},{"id":"PollCount","type":"counter","delta":3}]}"#
        );
    }

    #[test]
    fn test_batch_from_json_accepts_bare_array() {
        let body = br#"[{"id":"c","type":"counter","delta":5}]"#;
        let batch = Batch::from_json(body).unwrap().unwrap();
        assert_eq!(batch.metrics, vec![MetricSample::counter("c", 5)]);
    }

    #[test]
    fn test_batch_from_json_rejects_unknown_kind() {
        let body = br#"{"metrics":[{"id":"a","type":"gauge","value":1},{"id":"b","type":"histogram","value":2}]}"#;
        let err = Batch::from_json(body).unwrap().unwrap_err();
        assert_eq!(err, ValidationError::UnknownKind { kind: "histogram".into() });
    }

    #[test]
    fn test_wire_conversion_requires_matching_field() {
        let wire = WireMetric {
            id: "g".into(),
            kind: "gauge".into(),
            delta: Some(4),
            ..Default::default()
        };
        assert_eq!(
            MetricSample::try_from(wire).unwrap_err(),
            ValidationError::MissingValue { id: "g".into() }
        );

        let wire = WireMetric {
            id: "c".into(),
            kind: "counter".into(),
            delta: Some(4),
            value: Some(0.0),
            hash: Some("abcd".into()),
        };
        assert_eq!(MetricSample::try_from(wire).unwrap(), MetricSample::counter("c", 4));
    }

    #[test]
    fn test_validate_rejects_bad_samples() {
        assert_eq!(MetricSample::gauge("", 1.0).validate(), Err(ValidationError::EmptyName));
        assert!(matches!(
            MetricSample::gauge("g", f64::NAN).validate(),
            Err(ValidationError::NonFiniteValue { .. })
        ));
        let mut both = MetricSample::counter("c", 1);
        both.value = Some(1.0);
        assert!(matches!(both.validate(), Err(ValidationError::ConflictingFields { .. })));
    }

    #[test]
    fn test_parse_path_form() {
        assert_eq!(MetricSample::parse("counter", "c", "12").unwrap(), MetricSample::counter("c", 12));
        assert_eq!(MetricSample::parse("gauge", "g", "-0.5").unwrap(), MetricSample::gauge("g", -0.5));
        assert!(matches!(
            MetricSample::parse("counter", "c", "1.5"),
            Err(ValidationError::InvalidValue { .. })
        ));
        assert!(matches!(
            MetricSample::parse("timer", "t", "1"),
            Err(ValidationError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_value_string() {
        assert_eq!(MetricSample::gauge("g", 2.0).value_string(), "2");
        assert_eq!(MetricSample::gauge("g", 0.25).value_string(), "0.25");
        assert_eq!(MetricSample::counter("c", -3).value_string(), "-3");
    }
}
