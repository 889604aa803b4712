use thiserror::Error;

use super::{AgentError, BusError, PersistError, PlanError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
    #[error("HTTP client error: {source}")]
    Reqwest {
        #[from]
        source: reqwest::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bus<E>(error: E) -> Self
    where
        E: Into<BusError>,
    {
        error.into().into()
    }

    pub fn plan<E>(error: E) -> Self
    where
        E: Into<PlanError>,
    {
        error.into().into()
    }

    pub fn persist<E>(error: E) -> Self
    where
        E: Into<PersistError>,
    {
        error.into().into()
    }

    pub fn agent<E>(error: E) -> Self
    where
        E: Into<AgentError>,
    {
        error.into().into()
    }
}
