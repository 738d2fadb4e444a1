//! Best-effort error analysis orchestrator.
//!
//! [`Advisor::dispatch_for_analysis`] is the single entry point used by the
//! error-capture layer. It memoizes advice per error fingerprint, bounds
//! the work with an admission-controlled queue, and runs provider calls
//! through the resilient dispatcher. Advice is never required: every
//! failure below this boundary is converted into a missing-advice result
//! and a log record, so the primary error-logging path is unaffected.

pub mod config;
pub mod metrics_defs;
pub mod telemetry;

use crate::config::AdvisorConfig;
use crate::metrics_defs::{
    ADVICE_CACHE_HIT, ADVICE_CACHE_MISS, ANALYSIS_COMPLETED, ANALYSIS_FAILED, ANALYSIS_REQUESTED,
};
use dispatch::cache::{BoundedCache, CacheStats};
use dispatch::dispatcher::{Dispatcher, DispatcherSnapshot};
use dispatch::fingerprint;
use dispatch::provider::{AnalysisProvider, HttpAnalysisProvider, ProviderError};
use dispatch::queue::{AdmissionQueue, QueueSnapshot};
use shared::counter;
use std::sync::Arc;

/// An error captured by the host application's logging layer.
#[derive(Clone, Debug)]
pub struct CapturedError {
    pub message: String,
    pub stack: String,
    /// Optional precomputed signature from the capture layer; used as the
    /// cache key when present
    pub signature: Option<String>,
}

/// Debugging advice produced for one error fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advice {
    pub fingerprint: String,
    pub text: String,
}

/// Point-in-time view across the queue, dispatcher and advice cache.
#[derive(Clone, Debug)]
pub struct AdvisorSnapshot {
    pub queue: QueueSnapshot,
    pub dispatcher: DispatcherSnapshot,
    pub advice_cache: CacheStats,
}

struct AdvisorInner {
    queue: AdmissionQueue,
    dispatcher: Dispatcher,
    advice_cache: BoundedCache<Arc<Advice>>,
    destination: String,
}

#[derive(Clone)]
pub struct Advisor {
    inner: Arc<AdvisorInner>,
}

impl Advisor {
    pub fn new(mut config: AdvisorConfig, provider: Arc<dyn AnalysisProvider>) -> Self {
        config.clamp();
        let destination = config.provider.endpoint.clone();
        Advisor {
            inner: Arc::new(AdvisorInner {
                queue: AdmissionQueue::new(config.queue),
                dispatcher: Dispatcher::new(config.dispatcher, provider),
                advice_cache: BoundedCache::new(
                    &config.advice_cache,
                    ADVICE_CACHE_HIT,
                    ADVICE_CACHE_MISS,
                ),
                destination,
            }),
        }
    }

    /// Builds an advisor backed by the HTTP provider from the configured
    /// endpoint.
    pub fn from_config(config: AdvisorConfig) -> Result<Self, ProviderError> {
        let provider = Arc::new(HttpAnalysisProvider::new(config.provider.clone())?);
        Ok(Advisor::new(config, provider))
    }

    /// Requests debugging advice for a captured error.
    ///
    /// Returns cached advice when the error fingerprint is known; otherwise
    /// queues a provider call. Never fails: any error in admission,
    /// dispatch or analysis is logged and reported as `None`.
    pub async fn dispatch_for_analysis(
        &self,
        error: &CapturedError,
        context: &str,
    ) -> Option<Arc<Advice>> {
        counter!(ANALYSIS_REQUESTED).increment(1);

        let fingerprint = fingerprint::error_fingerprint(
            &error.message,
            &error.stack,
            error.signature.as_deref(),
        );
        if let Some(advice) = self.inner.advice_cache.get(&fingerprint) {
            counter!(ANALYSIS_COMPLETED).increment(1);
            return Some(advice);
        }

        let prompt = build_prompt(error, context);
        let inner = Arc::clone(&self.inner);
        let task_fingerprint = fingerprint.clone();
        let submitted = self
            .inner
            .queue
            .submit(0, move || async move {
                // Another task may have produced this advice while we were
                // queued
                if let Some(advice) = inner.advice_cache.get(&task_fingerprint) {
                    return Ok(advice);
                }
                let text = inner
                    .dispatcher
                    .dispatch(&inner.destination, &prompt)
                    .await?;
                let advice = Arc::new(Advice {
                    fingerprint: task_fingerprint.clone(),
                    text: text.to_string(),
                });
                inner
                    .advice_cache
                    .insert(&task_fingerprint, Arc::clone(&advice));
                Ok(advice)
            })
            .await;

        match submitted {
            Ok(advice) => {
                counter!(ANALYSIS_COMPLETED).increment(1);
                Some(advice)
            }
            Err(err) => {
                counter!(ANALYSIS_FAILED).increment(1);
                tracing::warn!(
                    error = %err,
                    fingerprint = %fingerprint,
                    "error analysis unavailable"
                );
                None
            }
        }
    }

    pub fn snapshot(&self) -> AdvisorSnapshot {
        AdvisorSnapshot {
            queue: self.inner.queue.snapshot(),
            dispatcher: self.inner.dispatcher.snapshot(),
            advice_cache: self.inner.advice_cache.stats(),
        }
    }

    /// Stops accepting analysis work. Pending tasks are rejected; in-flight
    /// provider calls run to completion.
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
    }
}

fn build_prompt(error: &CapturedError, context: &str) -> String {
    format!(
        "An application error was captured.\n\n\
         Message: {}\n\n\
         Stack trace:\n{}\n\n\
         Context: {}\n\n\
         Identify the most likely root cause and suggest a concrete fix.",
        error.message, error.stack, context
    )
}
