//! Log line enrichment.
//!
//! Pure transform from a raw log line plus a workload identity to the
//! structured output record handed downstream. The message body itself is
//! passed through opaque.

use podflux_types::{Attribute, OutputRecord, WorkloadIdentity};

const ATTR_NAMESPACE: &str = "k8s.namespace";
const ATTR_POD: &str = "k8s.pod";
const ATTR_CONTAINER: &str = "k8s.container";
const ATTR_NODE: &str = "k8s.node";
const ATTR_LABEL_PREFIX: &str = "k8s.label.";

/// Strip the RFC3339-nanosecond timestamp prefix the API server adds when
/// timestamps are requested, e.g. `2024-01-15T10:30:45.123456789Z message`.
///
/// Detection is positional and best-effort: `-` at offsets 4 and 7, `T` at
/// offset 10, then a `Z ` terminator inside the expected window. A message
/// that merely starts with a timestamp-shaped literal but has no `Z ` in the
/// window passes through unchanged.
pub fn strip_timestamp(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() <= 31 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return line;
    }

    let end = 35.min(bytes.len() - 1);
    for i in 20..end {
        if bytes[i] == b'Z' && bytes[i + 1] == b' ' {
            // Both matched bytes are ASCII, so i + 2 is a char boundary.
            return &line[i + 2..];
        }
    }

    line
}

/// Build the enriched record for one raw log line.
///
/// Identity attributes come first in a fixed order, followed by one
/// `k8s.label.<key>` attribute per pod label in sorted key order, so the
/// attribute sequence is deterministic for a given input.
pub fn enrich_line(line: &str, identity: &WorkloadIdentity) -> OutputRecord {
    let body = strip_timestamp(line);

    let mut attributes = Vec::with_capacity(4 + identity.labels.len());
    attributes.push(Attribute::new(ATTR_NAMESPACE, &identity.namespace));
    attributes.push(Attribute::new(ATTR_POD, &identity.pod));
    attributes.push(Attribute::new(ATTR_CONTAINER, &identity.container));
    attributes.push(Attribute::new(ATTR_NODE, &identity.node));

    for (key, value) in &identity.labels {
        attributes.push(Attribute::new(format!("{ATTR_LABEL_PREFIX}{key}"), value));
    }

    OutputRecord::new(body, attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn identity() -> WorkloadIdentity {
        WorkloadIdentity {
            namespace: "prod".into(),
            pod: "nginx-1".into(),
            container: "web".into(),
            node: "node-a".into(),
            labels: BTreeMap::from([("app".to_string(), "nginx".to_string())]),
        }
    }

    #[test]
    fn strips_nanosecond_timestamp() {
        let line = "2024-01-15T10:30:45.123456789Z hello world";
        assert_eq!(strip_timestamp(line), "hello world");
    }

    #[test]
    fn leaves_plain_lines_alone() {
        assert_eq!(strip_timestamp("hello world"), "hello world");
        assert_eq!(strip_timestamp(""), "");
    }

    #[test]
    fn timestamp_shape_without_terminator_passes_through() {
        // Looks like a timestamp but never closes with "Z " in the window.
        let line = "2024-01-15T10:30:45.123456789 no zulu terminator here";
        assert_eq!(strip_timestamp(line), line);
    }

    #[test]
    fn short_lines_pass_through() {
        let line = "2024-01-15T10:30:45Z";
        assert_eq!(strip_timestamp(line), line);
    }

    #[test]
    fn multibyte_content_after_timestamp() {
        let line = "2024-01-15T10:30:45.123456789Z ─── boxed ───";
        assert_eq!(strip_timestamp(line), "─── boxed ───");
    }

    #[test]
    fn enriched_body_is_stripped_message() {
        let record = enrich_line("2024-01-15T10:30:45.123456789Z hello world", &identity());
        assert_eq!(record.body.string_value, "hello world");

        let record = enrich_line("hello world", &identity());
        assert_eq!(record.body.string_value, "hello world");
    }

    #[test]
    fn attribute_set_is_complete_and_exact() {
        let record = enrich_line("hello", &identity());
        let attrs: Vec<(String, String)> = record
            .attributes
            .iter()
            .map(|a| (a.key.clone(), a.value.string_value.clone()))
            .collect();
        assert_eq!(
            attrs,
            vec![
                ("k8s.namespace".to_string(), "prod".to_string()),
                ("k8s.pod".to_string(), "nginx-1".to_string()),
                ("k8s.container".to_string(), "web".to_string()),
                ("k8s.node".to_string(), "node-a".to_string()),
                ("k8s.label.app".to_string(), "nginx".to_string()),
            ]
        );
    }

    #[test]
    fn wire_json_is_reproducible() {
        let line = "2024-01-15T10:30:45.123456789Z hello world";
        let expected = concat!(
            r#"{"body":{"stringValue":"hello world"},"attributes":["#,
            r#"{"key":"k8s.namespace","value":{"stringValue":"prod"}},"#,
            r#"{"key":"k8s.pod","value":{"stringValue":"nginx-1"}},"#,
            r#"{"key":"k8s.container","value":{"stringValue":"web"}},"#,
            r#"{"key":"k8s.node","value":{"stringValue":"node-a"}},"#,
            r#"{"key":"k8s.label.app","value":{"stringValue":"nginx"}}]}"#,
        );
        assert_eq!(enrich_line(line, &identity()).to_json(), expected);
        // Byte-for-byte identical on repeat.
        assert_eq!(enrich_line(line, &identity()).to_json(), expected);
    }

    #[test]
    fn oversized_lines_survive_intact() {
        let big = "x".repeat(2 * 1024 * 1024);
        let line = format!("2024-01-15T10:30:45.123456789Z {big}");
        let record = enrich_line(&line, &identity());
        assert_eq!(record.body.string_value.len(), big.len());
    }
}
