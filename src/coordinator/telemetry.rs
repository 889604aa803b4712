use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use crate::persist::Store;
use crate::protocol::AgentMetrics;
use crate::run::AgentResult;

/// Snapshots from one agent closer together than this are dropped.
const MIN_SNAPSHOT_GAP: Duration = Duration::from_secs(1);

struct AggregatorState {
    /// Admission clock per agent, shared across runs.
    last_accepted: HashMap<String, Instant>,
    /// Latest rollup per agent, keyed by run id.
    results: HashMap<String, Vec<AgentResult>>,
}

/// Single source of truth for the latest per-agent metrics of each run.
/// Accepted snapshots are mirrored to the store asynchronously.
pub struct TelemetryAggregator {
    store: Arc<Store>,
    state: Mutex<AggregatorState>,
}

impl TelemetryAggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state: Mutex::new(AggregatorState {
                last_accepted: HashMap::new(),
                results: HashMap::new(),
            }),
        }
    }

    /// Folds a telemetry snapshot into the run's rollup. Returns `false`
    /// when the snapshot was rate-limited.
    pub fn record(&self, run_id: &str, region: &str, metrics: AgentMetrics) -> bool {
        let now = Instant::now();
        let updated = {
            let mut state = self.lock();
            if let Some(last) = state.last_accepted.get(&metrics.agent_id) {
                if now.duration_since(*last) < MIN_SNAPSHOT_GAP {
                    return false;
                }
            }
            state.last_accepted.insert(metrics.agent_id.clone(), now);

            debug!(
                "Processing telemetry from agent {}: requests={}, errors={}, avg_latency={:.2}ms",
                metrics.agent_id, metrics.requests, metrics.errors, metrics.avg_latency_ms
            );

            let result = AgentResult {
                agent_id: metrics.agent_id,
                region: region.to_owned(),
                requests: metrics.requests,
                errors: metrics.errors,
                avg_latency_ms: metrics.avg_latency_ms,
                min_latency_ms: metrics.min_latency_ms,
                max_latency_ms: metrics.max_latency_ms,
                status_codes: metrics.status_codes,
            };

            let results = state.results.entry(run_id.to_owned()).or_default();
            match results
                .iter_mut()
                .find(|existing| existing.agent_id == result.agent_id)
            {
                Some(existing) => *existing = result,
                None => results.push(result),
            }
            results.clone()
        };

        // Persist outside the lock; the store batches internally.
        let store = self.store.clone();
        let run_id = run_id.to_owned();
        tokio::spawn(async move {
            if let Err(err) = store.save_agent_results(&run_id, &updated).await {
                error!("Failed to save agent results: {}", err);
            }
        });
        true
    }

    /// Latest rollups for a run.
    pub fn results_for(&self, run_id: &str) -> Vec<AgentResult> {
        self.lock().results.get(run_id).cloned().unwrap_or_default()
    }

    /// Fresh slate when a run starts: old admission clocks would otherwise
    /// drop the first snapshots of a back-to-back rerun.
    pub fn reset_run(&self, run_id: &str) {
        let mut state = self.lock();
        state.results.insert(run_id.to_owned(), Vec::new());
    }

    pub fn remove_run(&self, run_id: &str) {
        self.lock().results.remove(run_id);
    }

    pub fn seed_run(&self, run_id: &str, results: Vec<AgentResult>) {
        self.lock().results.insert(run_id.to_owned(), results);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::now_rfc3339;

    fn metrics(agent_id: &str, requests: u64) -> AgentMetrics {
        AgentMetrics {
            agent_id: agent_id.to_owned(),
            timestamp: now_rfc3339(),
            requests,
            errors: 0,
            avg_latency_ms: 2.0,
            min_latency_ms: 1.0,
            max_latency_ms: 4.0,
            status_codes: BTreeMap::from([(200, requests)]),
        }
    }

    async fn aggregator() -> TelemetryAggregator {
        TelemetryAggregator::new(Arc::new(Store::open(":memory:").await.unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_upsert_by_agent() {
        let aggregator = aggregator().await;
        assert!(aggregator.record("run-1", "eu", metrics("a", 5)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(aggregator.record("run-1", "eu", metrics("a", 9)));

        let results = aggregator.results_for("run-1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].requests, 9);
        assert_eq!(results[0].region, "eu");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_snapshots_are_rate_limited() {
        let aggregator = aggregator().await;
        assert!(aggregator.record("run-1", "", metrics("a", 5)));
        assert!(!aggregator.record("run-1", "", metrics("a", 6)));

        let results = aggregator.results_for("run-1");
        assert_eq!(results[0].requests, 5);
    }

    #[tokio::test]
    async fn different_agents_are_not_limited_together() {
        let aggregator = aggregator().await;
        assert!(aggregator.record("run-1", "", metrics("a", 5)));
        assert!(aggregator.record("run-1", "", metrics("b", 7)));
        assert_eq!(aggregator.results_for("run-1").len(), 2);
    }

    #[tokio::test]
    async fn reset_clears_previous_results() {
        let aggregator = aggregator().await;
        aggregator.record("run-1", "", metrics("a", 5));
        aggregator.reset_run("run-1");
        assert!(aggregator.results_for("run-1").is_empty());
    }
}
