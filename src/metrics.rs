//! Pipeline metrics
//!
//! Every stage records through the `metrics` facade. Nothing is exported until
//! [`init_metrics`] installs a Prometheus recorder, so library callers and tests
//! pay nothing for the instrumentation.

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Builds metric names following the convention:
/// replicator_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("replicator_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("replicator_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("replicator_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

/// Install the Prometheus recorder. Idempotent.
///
/// With an address the exporter also serves `/metrics` over HTTP (requires a
/// running tokio runtime); without one nothing is installed and the facade
/// calls stay no-ops.
pub fn init_metrics(addr: Option<SocketAddr>) {
    INIT.call_once(|| {
        let Some(addr) = addr else {
            return;
        };
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
            Err(e) => {
                warn!("Failed to install Prometheus exporter on {}: {}", addr, e);
                return;
            }
        }
        describe_all();
    });
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
}

pub struct ExtractMetrics;

impl ExtractMetrics {
    pub fn record_documents(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "extract", "documents")).increment(count as u64);
    }
}

pub struct TransformMetrics;

impl TransformMetrics {
    pub fn record_transformed(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "transform", "records")).increment(count as u64);
    }

    pub fn record_rejected(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "transform", "rejected")).increment(count as u64);
    }
}

pub struct LoadMetrics;

impl LoadMetrics {
    pub fn record_rows_upserted(count: usize) {
        ::metrics::counter!(phase_metric!(counter, "load", "rows_upserted")).increment(count as u64);
    }

    pub fn record_batch_rolled_back() {
        ::metrics::counter!(phase_metric!(counter, "load", "batches_rolled_back")).increment(1);
    }
}

pub struct RunMetrics;

impl RunMetrics {
    pub fn record_stage_attempt(stage: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "run", "stage_attempts"), "stage" => stage)
            .increment(1);
    }

    pub fn record_stage_retry(stage: &'static str, error_kind: &'static str) {
        ::metrics::counter!(
            phase_metric!(counter, "run", "stage_retries"),
            "stage" => stage,
            "error" => error_kind
        )
        .increment(1);
    }

    pub fn record_stage_duration(stage: &'static str, secs: f64) {
        ::metrics::histogram!(phase_metric!(histogram, "run", "stage_duration_seconds"), "stage" => stage)
            .record(secs);
    }

    pub fn record_run_finished(success: bool) {
        if success {
            ::metrics::counter!(phase_metric!(counter, "run", "succeeded")).increment(1);
        } else {
            ::metrics::counter!(phase_metric!(counter, "run", "failed")).increment(1);
        }
    }
}

pub fn metrics_documentation() -> Vec<MetricDoc> {
    vec![
        MetricDoc {
            name: phase_metric!(counter, "extract", "documents"),
            metric_type: MetricType::Counter,
            help: "Documents read from the source collection",
        },
        MetricDoc {
            name: phase_metric!(counter, "transform", "records"),
            metric_type: MetricType::Counter,
            help: "Canonical records produced by the transformer",
        },
        MetricDoc {
            name: phase_metric!(counter, "transform", "rejected"),
            metric_type: MetricType::Counter,
            help: "Documents skipped because of data-quality faults",
        },
        MetricDoc {
            name: phase_metric!(counter, "load", "rows_upserted"),
            metric_type: MetricType::Counter,
            help: "Rows inserted or updated in the warehouse",
        },
        MetricDoc {
            name: phase_metric!(counter, "load", "batches_rolled_back"),
            metric_type: MetricType::Counter,
            help: "Load batches rolled back after a failing record",
        },
        MetricDoc {
            name: phase_metric!(counter, "run", "stage_attempts"),
            metric_type: MetricType::Counter,
            help: "Stage executions, including retries",
        },
        MetricDoc {
            name: phase_metric!(counter, "run", "stage_retries"),
            metric_type: MetricType::Counter,
            help: "Stage re-attempts after a retryable failure",
        },
        MetricDoc {
            name: phase_metric!(histogram, "run", "stage_duration_seconds"),
            metric_type: MetricType::Histogram,
            help: "Wall time of a single stage attempt",
        },
        MetricDoc {
            name: phase_metric!(counter, "run", "succeeded"),
            metric_type: MetricType::Counter,
            help: "Pipeline runs that loaded their batch",
        },
        MetricDoc {
            name: phase_metric!(counter, "run", "failed"),
            metric_type: MetricType::Counter,
            help: "Pipeline runs that surfaced a fatal stage failure",
        },
    ]
}

fn describe_all() {
    for doc in metrics_documentation() {
        match doc.metric_type {
            MetricType::Counter => ::metrics::describe_counter!(doc.name, doc.help),
            MetricType::Histogram => ::metrics::describe_histogram!(doc.name, doc.help),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_naming_convention() {
        assert_eq!(
            phase_metric!(counter, "load", "rows_upserted"),
            "replicator_load_rows_upserted_total"
        );
        assert_eq!(
            phase_metric!(histogram, "run", "stage_duration_seconds"),
            "replicator_run_stage_duration_seconds"
        );
    }

    #[test]
    fn test_metric_names_are_unique() {
        let docs = metrics_documentation();
        let names: HashSet<_> = docs.iter().map(|d| d.name).collect();
        assert_eq!(names.len(), docs.len());
    }

    #[test]
    fn test_recording_without_recorder_is_a_no_op() {
        ExtractMetrics::record_documents(3);
        RunMetrics::record_stage_retry("extract", "source_unavailable");
        LoadMetrics::record_batch_rolled_back();
    }
}
