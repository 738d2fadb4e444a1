pub mod metrics_defs;

pub use metrics_defs::{MetricDef, MetricType};

/// Registers metric descriptions with the installed recorder.
///
/// Each crate exposes its metric definitions through an `ALL_METRICS` slice;
/// the binary calls this once per crate after installing the recorder.
pub fn register_metrics(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}
