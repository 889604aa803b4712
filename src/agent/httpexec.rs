use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;

use crate::error::AgentError;
use crate::plan::{Endpoint, HttpMethod};

use super::metrics::MetricsRecorder;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// One shared client per agent; idle pool sized to the agent's declared
/// concurrency so every worker can keep a connection warm.
pub fn build_client(concurrency: u32, keep_alive: bool) -> Result<Client, AgentError> {
    let max_idle = if keep_alive { concurrency as usize } else { 0 };
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .pool_max_idle_per_host(max_idle)
        .build()
        .map_err(|source| AgentError::HttpClient { source })
}

/// Fires one request and records the outcome. The response body is always
/// fully drained so the connection can be reused; latency runs from send
/// to drain completion. Transport failures count as errors with no status
/// bucket.
pub async fn execute_endpoint(client: &Client, endpoint: &Endpoint, recorder: &MetricsRecorder) {
    let started = tokio::time::Instant::now();

    let mut builder = client.request(endpoint.method.as_reqwest(), &endpoint.url);
    for (name, value) in &endpoint.headers {
        builder = builder.header(name, value);
    }
    if endpoint.method != HttpMethod::Get {
        if let Some(body) = &endpoint.body {
            builder = builder.json(body);
        }
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            match drain_body(response).await {
                Ok(_) => recorder.record_response(status, started.elapsed()),
                Err(_) => recorder.record_error(),
            }
        }
        Err(_) => recorder.record_error(),
    }
}

async fn drain_body(response: reqwest::Response) -> Result<u64, reqwest::Error> {
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        total = total.saturating_add(bytes.len() as u64);
    }
    Ok(total)
}
