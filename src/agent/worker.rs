use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::plan::{Endpoint, RampUpExecution};

use super::httpexec::execute_endpoint;
use super::metrics::MetricsRecorder;
use super::rate::RateLimiter;

/// Work queue depth per unit of concurrency.
const QUEUE_DEPTH_FACTOR: usize = 10;
/// Idle nap for workers parked above the current ramp-up target.
const THROTTLE_NAP: Duration = Duration::from_millis(100);

pub struct LoadSession {
    pub client: Client,
    pub endpoints: Vec<Endpoint>,
    pub concurrency: u32,
    pub duration: Duration,
    pub ramp_up: Option<RampUpExecution>,
    pub rate_limiter: RateLimiter,
    pub default_think_time: Duration,
    pub recorder: Arc<MetricsRecorder>,
}

/// Drives one bounded load session: a round-robin generator feeding a
/// bounded queue, `concurrency` workers consuming it, and an optional 1s
/// ramp-up controller steering how many workers are active. Returns when
/// the duration elapses or `stop_rx` fires; requests already in flight
/// finish under the client's own timeout.
pub async fn run_load(session: LoadSession, mut stop_rx: watch::Receiver<bool>) {
    let LoadSession {
        client,
        endpoints,
        concurrency,
        duration,
        ramp_up,
        rate_limiter,
        default_think_time,
        recorder,
    } = session;

    let concurrency = concurrency.max(1);
    let (done_tx, done_rx) = watch::channel(false);

    // Deadline and external stop collapse into one session-done signal.
    {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => {}
                result = stop_rx.changed() => {
                    if result.is_ok() && !*stop_rx.borrow() {
                        // Spurious wake; wait out the deadline.
                        tokio::time::sleep(duration).await;
                    }
                }
            }
            drop(done_tx.send(true));
        });
    }

    let queue_depth = QUEUE_DEPTH_FACTOR * concurrency as usize;
    let (queue_tx, queue_rx) = mpsc::channel::<Endpoint>(queue_depth);
    let queue_rx = Arc::new(Mutex::new(queue_rx));

    if !endpoints.is_empty() {
        tokio::spawn(generate_requests(endpoints, queue_tx, done_rx.clone()));
    } else {
        drop(queue_tx);
    }

    let initial_target = ramp_up
        .as_ref()
        .map_or(concurrency, RampUpExecution::current_target);
    let target = Arc::new(AtomicU32::new(initial_target.min(concurrency)));

    if let Some(ramp_up) = ramp_up {
        tokio::spawn(ramp_controller(
            ramp_up,
            concurrency,
            target.clone(),
            done_rx.clone(),
        ));
    }

    let mut workers = Vec::with_capacity(concurrency as usize);
    for worker_index in 0..concurrency {
        let queue_rx = queue_rx.clone();
        let client = client.clone();
        let rate_limiter = rate_limiter.clone();
        let recorder = recorder.clone();
        let target = target.clone();
        let done_rx = done_rx.clone();
        workers.push(tokio::spawn(worker_loop(
            worker_index,
            queue_rx,
            client,
            rate_limiter,
            recorder,
            target,
            default_think_time,
            done_rx,
        )));
    }

    for worker in workers {
        if worker.await.is_err() {
            // A worker panicked; the others keep the session honest.
        }
    }
}

/// Round-robins the plan's endpoints into the bounded queue until the
/// session ends.
async fn generate_requests(
    endpoints: Vec<Endpoint>,
    queue_tx: mpsc::Sender<Endpoint>,
    mut done_rx: watch::Receiver<bool>,
) {
    'outer: loop {
        for endpoint in &endpoints {
            tokio::select! {
                result = queue_tx.send(endpoint.clone()) => {
                    if result.is_err() {
                        break 'outer;
                    }
                }
                _ = done_rx.changed() => {
                    if *done_rx.borrow() {
                        break 'outer;
                    }
                }
            }
        }
    }
}

/// Publishes the calculator's target once a second so workers can throttle
/// themselves while the ramp is in progress.
async fn ramp_controller(
    ramp_up: RampUpExecution,
    concurrency: u32,
    target: Arc<AtomicU32>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut announced_complete = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let next = ramp_up.current_target().min(concurrency);
                let previous = target.swap(next, Ordering::Relaxed);
                if previous != next {
                    debug!("Ramp-up adjustment: {} -> {} workers", previous, next);
                }
                if ramp_up.is_complete() && !announced_complete {
                    announced_complete = true;
                    info!(
                        "Ramp-up phase completed, running at full concurrency: {}",
                        concurrency
                    );
                }
            }
            _ = done_rx.changed() => {
                if *done_rx.borrow() {
                    return;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_index: u32,
    queue_rx: Arc<Mutex<mpsc::Receiver<Endpoint>>>,
    client: Client,
    rate_limiter: RateLimiter,
    recorder: Arc<MetricsRecorder>,
    target: Arc<AtomicU32>,
    default_think_time: Duration,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        if *done_rx.borrow() {
            return;
        }

        // Workers above the current target idle instead of consuming work.
        if worker_index >= target.load(Ordering::Relaxed) {
            tokio::time::sleep(THROTTLE_NAP).await;
            continue;
        }

        let endpoint = {
            let mut queue = queue_rx.lock().await;
            tokio::select! {
                endpoint = queue.recv() => endpoint,
                _ = done_rx.changed() => {
                    if *done_rx.borrow() {
                        return;
                    }
                    continue;
                }
            }
        };
        let Some(endpoint) = endpoint else {
            return;
        };

        rate_limiter.acquire().await;

        let think_time = endpoint.effective_think_time(default_think_time);

        // Each request runs detached so slow responses never stall the
        // worker's think-time cadence.
        let request_client = client.clone();
        let request_recorder = recorder.clone();
        tokio::spawn(async move {
            execute_endpoint(&request_client, &endpoint, &request_recorder).await;
        });

        if !think_time.is_zero() {
            tokio::time::sleep(think_time).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;

    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::agent::httpexec::build_client;
    use crate::plan::HttpMethod;

    async fn spawn_target() -> (String, Arc<AtomicU64>) {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, hits)
    }

    fn endpoint(url: &str) -> Endpoint {
        Endpoint {
            method: HttpMethod::Get,
            url: url.to_owned(),
            headers: BTreeMap::new(),
            body: None,
            think_time: None,
        }
    }

    #[tokio::test]
    async fn session_generates_load_for_the_duration() {
        let (url, hits) = spawn_target().await;
        let recorder = Arc::new(MetricsRecorder::new("worker-test"));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let session = LoadSession {
            client: build_client(2, true).unwrap(),
            endpoints: vec![endpoint(&url)],
            concurrency: 2,
            duration: Duration::from_millis(600),
            ramp_up: None,
            rate_limiter: RateLimiter::disabled(),
            default_think_time: Duration::from_millis(20),
            recorder: recorder.clone(),
        };
        run_load(session, stop_rx).await;
        // Detached requests get a beat to finish recording.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snapshot = recorder.snapshot();
        assert!(snapshot.requests > 0, "expected traffic, got none");
        assert!(hits.load(Ordering::Relaxed) > 0);
        assert_eq!(
            snapshot.status_codes.get(&200).copied().unwrap_or(0),
            snapshot.requests
        );
        assert!(snapshot.errors <= snapshot.requests);
    }

    #[tokio::test]
    async fn stop_signal_ends_the_session_early() {
        let (url, _hits) = spawn_target().await;
        let recorder = Arc::new(MetricsRecorder::new("worker-test"));
        let (stop_tx, stop_rx) = watch::channel(false);

        let session = LoadSession {
            client: build_client(1, true).unwrap(),
            endpoints: vec![endpoint(&url)],
            concurrency: 1,
            duration: Duration::from_secs(30),
            ramp_up: None,
            rate_limiter: RateLimiter::disabled(),
            default_think_time: Duration::from_millis(10),
            recorder,
        };

        let started = tokio::time::Instant::now();
        let run = tokio::spawn(run_load(session, stop_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        run.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_target_counts_errors_not_requests() {
        let recorder = Arc::new(MetricsRecorder::new("worker-test"));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let session = LoadSession {
            client: build_client(1, true).unwrap(),
            // Nothing listens here; connects are refused.
            endpoints: vec![endpoint("http://127.0.0.1:9/")],
            concurrency: 1,
            duration: Duration::from_millis(400),
            ramp_up: None,
            rate_limiter: RateLimiter::disabled(),
            default_think_time: Duration::from_millis(50),
            recorder: recorder.clone(),
        };
        run_load(session, stop_rx).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.requests, 0);
        assert!(snapshot.errors > 0);
        assert!(snapshot.status_codes.is_empty());
    }
}
