//! Prometheus metrics registry and metric definitions.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global registry under crate namespace
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("tabular_ingest".into()), None)
        .expect("failed to create Prometheus registry")
});

/// Total source fetch attempts
pub static SOURCE_FETCH_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("sources_fetched_total", "Total number of dataset source fetches");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Histogram of fetch+parse durations
pub static SOURCE_FETCH_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "source_fetch_duration_seconds",
        "Duration of source fetch+parse in seconds",
    );
    let h = Histogram::with_opts(opts).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Rows written through bulk imports
pub static ROWS_IMPORTED: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("rows_imported_total", "Rows written by bulk imports");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Export files the importer had no table for
pub static FILES_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    let opts = Opts::new("files_skipped_total", "Export files with no mapped table");
    let c = IntCounter::with_opts(opts).expect("counter opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Task attempts by workflow and outcome (`success`, `retry`, `failed`, `upstream_failed`)
pub static TASK_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("task_runs_total", "Task attempts by workflow and outcome");
    let c = IntCounterVec::new(opts, &["workflow", "outcome"]).expect("counter vec opts");
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

/// Histogram of whole-task durations, retries included
pub static TASK_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("task_duration_seconds", "Duration of a task in seconds");
    let h = Histogram::with_opts(opts).expect("histogram opts");
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

/// Encode all metrics as text
pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let mf = REGISTRY.gather();
    encoder.encode(&mf, &mut buffer).expect("failed to encode");
    String::from_utf8(buffer).expect("invalid utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        ROWS_IMPORTED.inc_by(3);
        TASK_RUNS.with_label_values(&["fx_rates", "success"]).inc();
        let text = gather_metrics();
        assert!(text.contains("tabular_ingest_rows_imported_total"));
        assert!(text.contains("tabular_ingest_task_runs_total"));
    }
}
