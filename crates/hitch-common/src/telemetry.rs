//! Fire-and-forget telemetry sinks.
//!
//! Sinks are constructed once at process start and handed to whoever needs
//! them. Reporting never fails the caller: sink errors are logged and dropped.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome report of one plugin invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Reporting component, e.g. `hitch-cni`.
    pub context: String,
    /// Plugin version.
    pub version: String,
    /// Operation name (`ADD`, `DEL`, ...).
    pub operation: String,
    /// Container the operation was for.
    pub container_id: String,
    /// Whether the operation succeeded.
    pub succeeded: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Time the report was created.
    pub timestamp: DateTime<Utc>,
}

impl Report {
    /// Start a report for an operation.
    #[must_use]
    pub fn new(context: &str, version: &str, operation: &str, container_id: &str) -> Self {
        Self {
            context: context.to_string(),
            version: version.to_string(),
            operation: operation.to_string(),
            container_id: container_id.to_string(),
            succeeded: false,
            error_message: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// Mark the report as finished with the given outcome.
    pub fn finish(&mut self, error: Option<String>, duration: Duration) {
        self.succeeded = error.is_none();
        self.error_message = error;
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    }
}

/// A named numeric measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Measured value.
    pub value: f64,
    /// Extra dimensions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

impl Metric {
    /// Create a metric without dimensions.
    #[must_use]
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            dimensions: BTreeMap::new(),
        }
    }

    /// Attach a dimension.
    #[must_use]
    pub fn with_dimension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for telemetry.
pub trait TelemetrySink: Send + Sync {
    /// Record an invocation report.
    fn track_log(&self, report: &Report);

    /// Record a metric.
    fn track_metric(&self, metric: &Metric);

    /// Flush buffered data, waiting at most `timeout`.
    fn flush(&self, _timeout: Duration) {}
}

/// Sink that emits telemetry as tracing events on the `telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn track_log(&self, report: &Report) {
        tracing::info!(
            target: "telemetry",
            operation = %report.operation,
            container_id = %report.container_id,
            succeeded = report.succeeded,
            duration_ms = report.duration_ms,
            error = report.error_message.as_deref().unwrap_or(""),
            "Plugin report"
        );
    }

    fn track_metric(&self, metric: &Metric) {
        tracing::info!(
            target: "telemetry",
            name = %metric.name,
            value = metric.value,
            dimensions = ?metric.dimensions,
            "Metric"
        );
    }
}

/// Sink that appends JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Create a sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append<T: Serialize>(&self, kind: &str, value: &T) {
        let line = match serde_json::to_string(&serde_json::json!({ "kind": kind, "data": value })) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode telemetry");
                return;
            }
        };

        let result = self
            .path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
            })
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write telemetry");
        }
    }
}

impl TelemetrySink for FileSink {
    fn track_log(&self, report: &Report) {
        self.append("report", report);
    }

    fn track_metric(&self, metric: &Metric) {
        self.append("metric", metric);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn track_log(&self, _report: &Report) {}

    fn track_metric(&self, _metric: &Metric) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_finish_sets_outcome() {
        let mut report = Report::new("hitch-cni", "0.1.0", "ADD", "c1");
        report.finish(None, Duration::from_millis(42));
        assert!(report.succeeded);
        assert_eq!(report.duration_ms, 42);

        report.finish(Some("boom".to_string()), Duration::from_millis(1));
        assert!(!report.succeeded);
        assert_eq!(report.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn file_sink_appends_lines() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("log/telemetry.jsonl");
        let sink = FileSink::new(&path);

        sink.track_log(&Report::new("hitch-cni", "0.1.0", "DEL", "c1"));
        sink.track_metric(&Metric::new("endpoints", 2.0).with_dimension("network", "n1"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"report\""));
        assert!(lines[1].contains("\"network\":\"n1\""));
    }
}
