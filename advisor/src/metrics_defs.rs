//! Metrics definitions for the advisor.

use shared::metrics_defs::{MetricDef, MetricType};

pub const ANALYSIS_REQUESTED: MetricDef = MetricDef {
    name: "analysis.requested",
    metric_type: MetricType::Counter,
    description: "Captured errors submitted for analysis",
};

pub const ANALYSIS_COMPLETED: MetricDef = MetricDef {
    name: "analysis.completed",
    metric_type: MetricType::Counter,
    description: "Analyses that produced advice",
};

pub const ANALYSIS_FAILED: MetricDef = MetricDef {
    name: "analysis.failed",
    metric_type: MetricType::Counter,
    description: "Analyses that failed and returned no advice",
};

pub const ADVICE_CACHE_HIT: MetricDef = MetricDef {
    name: "advice_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the advice cache",
};

pub const ADVICE_CACHE_MISS: MetricDef = MetricDef {
    name: "advice_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the advice cache",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    ANALYSIS_REQUESTED,
    ANALYSIS_COMPLETED,
    ANALYSIS_FAILED,
    ADVICE_CACHE_HIT,
    ADVICE_CACHE_MISS,
];
