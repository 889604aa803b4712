use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::protocol::{now_rfc3339, AgentMetrics};

#[derive(Debug, Default)]
struct MetricsInner {
    requests: u64,
    errors: u64,
    latency_sum_ms: f64,
    avg_latency_ms: f64,
    min_latency_ms: f64,
    max_latency_ms: f64,
    status_codes: BTreeMap<u16, u64>,
}

/// Per-agent request counters. One lock, touched only by this agent's
/// workers and its telemetry reporter. Latency is measured from request
/// start to response-body drain completion.
#[derive(Debug)]
pub struct MetricsRecorder {
    agent_id: String,
    inner: Mutex<MetricsInner>,
}

impl MetricsRecorder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    pub fn record_response(&self, status_code: u16, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut inner = self.lock();

        inner.requests += 1;
        inner.latency_sum_ms += latency_ms;
        inner.avg_latency_ms = inner.latency_sum_ms / inner.requests as f64;

        if inner.requests == 1 {
            inner.min_latency_ms = latency_ms;
            inner.max_latency_ms = latency_ms;
        } else {
            if latency_ms < inner.min_latency_ms {
                inner.min_latency_ms = latency_ms;
            }
            if latency_ms > inner.max_latency_ms {
                inner.max_latency_ms = latency_ms;
            }
        }

        *inner.status_codes.entry(status_code).or_default() += 1;
    }

    /// Transport-level failures: counted, no status bucket, no latency.
    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn reset(&self) {
        *self.lock() = MetricsInner::default();
    }

    pub fn totals(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.requests, inner.errors)
    }

    pub fn snapshot(&self) -> AgentMetrics {
        let inner = self.lock();
        AgentMetrics {
            agent_id: self.agent_id.clone(),
            timestamp: now_rfc3339(),
            requests: inner.requests,
            errors: inner.errors,
            avg_latency_ms: inner.avg_latency_ms,
            min_latency_ms: inner.min_latency_ms,
            max_latency_ms: inner.max_latency_ms,
            status_codes: inner.status_codes.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
