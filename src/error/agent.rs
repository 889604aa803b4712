use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Coordinator not available at {addr}.")]
    CoordinatorUnreachable { addr: String },
    #[error("Failed to build HTTP client: {source}")]
    HttpClient {
        #[source]
        source: reqwest::Error,
    },
}
