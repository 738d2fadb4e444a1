//! Metrics definitions for the dispatch subsystem.

use shared::metrics_defs::{MetricDef, MetricType};

pub const QUEUE_SUBMITTED: MetricDef = MetricDef {
    name: "queue.submitted",
    metric_type: MetricType::Counter,
    description: "Number of tasks admitted to the queue",
};

pub const QUEUE_REJECTED: MetricDef = MetricDef {
    name: "queue.rejected",
    metric_type: MetricType::Counter,
    description: "Number of submissions rejected by admission control or timeout",
};

pub const QUEUE_PENDING: MetricDef = MetricDef {
    name: "queue.pending",
    metric_type: MetricType::Gauge,
    description: "Tasks waiting in the queue",
};

pub const QUEUE_ACTIVE: MetricDef = MetricDef {
    name: "queue.active",
    metric_type: MetricType::Gauge,
    description: "Tasks currently executing",
};

pub const QUEUE_TASK_DURATION: MetricDef = MetricDef {
    name: "queue.task.duration",
    metric_type: MetricType::Histogram,
    description: "Task execution time in seconds",
};

pub const BREAKER_OPENED: MetricDef = MetricDef {
    name: "breaker.opened",
    metric_type: MetricType::Counter,
    description: "Transitions into the open state",
};

pub const BREAKER_HALF_OPENED: MetricDef = MetricDef {
    name: "breaker.half_opened",
    metric_type: MetricType::Counter,
    description: "Transitions into the half-open state",
};

pub const BREAKER_CLOSED: MetricDef = MetricDef {
    name: "breaker.closed",
    metric_type: MetricType::Counter,
    description: "Transitions back into the closed state",
};

pub const BREAKER_REJECTED: MetricDef = MetricDef {
    name: "breaker.rejected",
    metric_type: MetricType::Counter,
    description: "Calls failed fast because the circuit was open",
};

pub const BUCKET_THROTTLED: MetricDef = MetricDef {
    name: "bucket.throttled",
    metric_type: MetricType::Counter,
    description: "Dispatches rejected or delayed by the token bucket",
};

pub const RESPONSE_CACHE_HIT: MetricDef = MetricDef {
    name: "response_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the response cache",
};

pub const RESPONSE_CACHE_MISS: MetricDef = MetricDef {
    name: "response_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the response cache",
};

pub const DISPATCH_DEDUPED: MetricDef = MetricDef {
    name: "dispatch.deduped",
    metric_type: MetricType::Counter,
    description: "Dispatches that joined an identical in-flight request",
};

pub const DISPATCH_RETRIES: MetricDef = MetricDef {
    name: "dispatch.retries",
    metric_type: MetricType::Counter,
    description: "Individual retry attempts against the provider",
};

pub const POOL_IN_FLIGHT: MetricDef = MetricDef {
    name: "pool.in_flight",
    metric_type: MetricType::Gauge,
    description: "Concurrent outbound requests on the connection pool",
};

pub const POOL_RESIZED: MetricDef = MetricDef {
    name: "pool.resized",
    metric_type: MetricType::Counter,
    description: "Adaptive resizes of the outbound connection pool",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    QUEUE_SUBMITTED,
    QUEUE_REJECTED,
    QUEUE_PENDING,
    QUEUE_ACTIVE,
    QUEUE_TASK_DURATION,
    BREAKER_OPENED,
    BREAKER_HALF_OPENED,
    BREAKER_CLOSED,
    BREAKER_REJECTED,
    BUCKET_THROTTLED,
    RESPONSE_CACHE_HIT,
    RESPONSE_CACHE_MISS,
    DISPATCH_DEDUPED,
    DISPATCH_RETRIES,
    POOL_IN_FLIGHT,
    POOL_RESIZED,
];
