use crate::policy::Classification;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Mutex;

const RESULT_TOTAL: &str = "docker_proxy_mutating_webhook_result_total";
const FAILURES_TOTAL: &str = "docker_proxy_mutating_webhook_failures_total";
const CONTAINER_REWRITES_TOTAL: &str = "docker_proxy_mutating_webhook_container_rewrites_total";
const UNKNOWN_DOMAIN_TOTAL: &str = "docker_proxy_mutating_webhook_unknown_domain_total";
const CONTAINER_IMAGES_TOTAL: &str = "docker_proxy_mutating_webhook_container_images_total";

const COUNTER_HELP: [(&str, &str); 5] = [
    (RESULT_TOTAL, "Number of webhook invocations"),
    (FAILURES_TOTAL, "Number of webhook failures"),
    (CONTAINER_REWRITES_TOTAL, "Number of container image values rewritten"),
    (UNKNOWN_DOMAIN_TOTAL, "Number of unmapped domains"),
    (
        CONTAINER_IMAGES_TOTAL,
        "Number of container images evaluated, by classification",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    InvalidResourceType,
    DecodeError,
    RewriteFailed,
    MarshalingFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidResourceType => "invalid_resource_type",
            FailureReason::DecodeError => "decode_error",
            FailureReason::RewriteFailed => "rewrite_failed",
            FailureReason::MarshalingFailed => "marshaling_failed",
        }
    }
}

/// Receives webhook observability events. Injected into the admission handler.
pub trait MetricsSink: Send + Sync {
    fn webhook_result(&self, mutated: bool, namespace: &str);
    fn webhook_failure(&self, reason: FailureReason, namespace: &str);
    fn container_image(&self, classification: Classification, domain: &str, namespace: &str);
}

type Labels = Vec<(&'static str, String)>;

/// In-process labeled counters, exposed in the Prometheus text format.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    counters: Mutex<BTreeMap<(&'static str, Labels), u64>>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, name: &'static str, labels: Labels) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry((name, labels)).or_insert(0) += 1;
    }

    #[cfg(test)]
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .iter()
            .find(|((counter, counter_labels), _)| {
                *counter == name
                    && counter_labels.len() == labels.len()
                    && counter_labels
                        .iter()
                        .zip(labels)
                        .all(|((key, value), (k, v))| key == k && value.as_str() == *v)
            })
            .map_or(0, |(_, value)| *value)
    }

    pub fn render(&self) -> String {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for (name, help) in COUNTER_HELP {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            for ((counter, labels), value) in counters.iter().filter(|((c, _), _)| *c == name) {
                let labels = labels
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = writeln!(out, "{counter}{{{labels}}} {value}");
            }
        }
        out
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

impl MetricsSink for CounterRegistry {
    fn webhook_result(&self, mutated: bool, namespace: &str) {
        self.increment(
            RESULT_TOTAL,
            vec![
                ("mutated", mutated.to_string()),
                ("request_namespace", namespace.to_string()),
            ],
        );
    }

    fn webhook_failure(&self, reason: FailureReason, namespace: &str) {
        self.increment(
            FAILURES_TOTAL,
            vec![
                ("failure_reason", reason.as_str().to_string()),
                ("request_namespace", namespace.to_string()),
            ],
        );
    }

    fn container_image(&self, classification: Classification, domain: &str, namespace: &str) {
        let domain_labels = || {
            vec![
                ("domain", domain.to_string()),
                ("request_namespace", namespace.to_string()),
            ]
        };
        match classification {
            Classification::Mapped => self.increment(CONTAINER_REWRITES_TOTAL, domain_labels()),
            Classification::Unknown => self.increment(UNKNOWN_DOMAIN_TOTAL, domain_labels()),
            _ => {}
        }
        self.increment(
            CONTAINER_IMAGES_TOTAL,
            vec![
                ("classification", classification.as_str().to_string()),
                ("domain", domain.to_string()),
                ("request_namespace", namespace.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment_per_label_set() {
        let registry = CounterRegistry::new();
        registry.webhook_result(true, "default");
        registry.webhook_result(true, "default");
        registry.webhook_result(false, "default");

        assert_eq!(
            registry.get(RESULT_TOTAL, &[("mutated", "true"), ("request_namespace", "default")]),
            2
        );
        assert_eq!(
            registry.get(RESULT_TOTAL, &[("mutated", "false"), ("request_namespace", "default")]),
            1
        );
        assert_eq!(
            registry.get(RESULT_TOTAL, &[("mutated", "true"), ("request_namespace", "other")]),
            0
        );
    }

    #[test]
    fn test_container_image_counts_mapped_and_unknown_separately() {
        let registry = CounterRegistry::new();
        registry.container_image(Classification::Mapped, "docker.io", "ns");
        registry.container_image(Classification::Unknown, "registry.k8s.io", "ns");
        registry.container_image(Classification::Ignored, "quay.io", "ns");

        let labels = |domain| [("domain", domain), ("request_namespace", "ns")];
        assert_eq!(registry.get(CONTAINER_REWRITES_TOTAL, &labels("docker.io")), 1);
        assert_eq!(registry.get(CONTAINER_REWRITES_TOTAL, &labels("quay.io")), 0);
        assert_eq!(registry.get(UNKNOWN_DOMAIN_TOTAL, &labels("registry.k8s.io")), 1);
        assert_eq!(
            registry.get(
                CONTAINER_IMAGES_TOTAL,
                &[
                    ("classification", "ignored"),
                    ("domain", "quay.io"),
                    ("request_namespace", "ns")
                ]
            ),
            1
        );
    }

    #[test]
    fn test_render_prometheus_text() {
        let registry = CounterRegistry::new();
        registry.webhook_failure(FailureReason::DecodeError, "default");
        registry.webhook_failure(FailureReason::DecodeError, "default");

        let rendered = registry.render();
        assert!(rendered.contains("# TYPE docker_proxy_mutating_webhook_failures_total counter"));
        assert!(rendered.contains(
            "docker_proxy_mutating_webhook_failures_total{failure_reason=\"decode_error\",request_namespace=\"default\"} 2"
        ));
        assert!(rendered.contains("# HELP docker_proxy_mutating_webhook_result_total"));
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
