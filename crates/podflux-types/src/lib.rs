//! Shared types for podflux
//!
//! This crate contains data structures used across multiple podflux crates.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Workload identity
// ============================================================================

/// Identity of one container instance, captured from the pod snapshot at
/// stream-start time. Immutable afterwards, even if the pod's labels change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node: String,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadIdentity {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.namespace, &self.pod, &self.container)
    }
}

/// Deduplication key for a container log stream.
///
/// The (namespace, pod, container) triple is unique among active streams.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl StreamKey {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

// ============================================================================
// Pod phase
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Output records
// ============================================================================

/// One enriched log line in the wire shape consumed downstream.
///
/// Serializes to:
/// `{"body":{"stringValue":...},"attributes":[{"key":...,"value":{"stringValue":...}},...]}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    pub body: AttributeValue,
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttributeValue {
    #[serde(rename = "stringValue")]
    pub string_value: String,
}

impl AttributeValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            string_value: value.into(),
        }
    }
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::new(value),
        }
    }
}

impl OutputRecord {
    pub fn new(body: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            body: AttributeValue::new(body),
            attributes,
        }
    }

    /// Serialize to the wire JSON form. If serialization fails the record is
    /// rebuilt by hand rather than dropped.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.fallback_json())
    }

    fn fallback_json(&self) -> String {
        let mut out = String::from("{\"body\":{\"stringValue\":");
        out.push_str(&json_escape(&self.body.string_value));
        out.push_str("},\"attributes\":[");
        for (i, attr) in self.attributes.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str("{\"key\":");
            out.push_str(&json_escape(&attr.key));
            out.push_str(",\"value\":{\"stringValue\":");
            out.push_str(&json_escape(&attr.value.string_value));
            out.push_str("}}");
        }
        out.push_str("]}");
        out
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_display() {
        let key = StreamKey::new("prod", "nginx-1", "web");
        assert_eq!(key.to_string(), "prod/nginx-1/web");
    }

    #[test]
    fn pod_phase_from_str() {
        assert_eq!(PodPhase::from("Running"), PodPhase::Running);
        assert_eq!(PodPhase::from("Succeeded"), PodPhase::Succeeded);
        assert_eq!(PodPhase::from("Evicted"), PodPhase::Unknown);
    }

    #[test]
    fn record_wire_shape() {
        let record = OutputRecord::new(
            "hello world",
            vec![Attribute::new("k8s.namespace", "prod")],
        );
        assert_eq!(
            record.to_json(),
            r#"{"body":{"stringValue":"hello world"},"attributes":[{"key":"k8s.namespace","value":{"stringValue":"prod"}}]}"#
        );
    }

    #[test]
    fn fallback_matches_serde_output() {
        let record = OutputRecord::new(
            "quote \" backslash \\ newline \n tab \t",
            vec![Attribute::new("k8s.label.app", "a\"b")],
        );
        assert_eq!(record.fallback_json(), serde_json::to_string(&record).unwrap());
    }

    #[test]
    fn identity_stream_key() {
        let identity = WorkloadIdentity {
            namespace: "prod".into(),
            pod: "nginx-1".into(),
            container: "web".into(),
            node: "node-a".into(),
            labels: BTreeMap::new(),
        };
        assert_eq!(identity.stream_key(), StreamKey::new("prod", "nginx-1", "web"));
    }
}
