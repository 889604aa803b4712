use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Test run name is required.")]
    MissingName,
    #[error("Test plan must have at least one endpoint.")]
    EmptyEndpoints,
    #[error("Concurrency must be at least 1.")]
    ZeroConcurrency,
    #[error("min_agents must be at least 1.")]
    ZeroMinAgents,
    #[error("Invalid duration '{value}': {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("Invalid ramp-up duration '{value}': {source}")]
    InvalidRampUpDuration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("Phase-based ramp-up strategy must have at least one phase.")]
    EmptyPhases,
    #[error("Invalid duration for phase {index}: {source}")]
    InvalidPhaseDuration {
        index: usize,
        #[source]
        source: humantime::DurationError,
    },
    #[error("Phase {index} concurrency {concurrency} exceeds plan concurrency {max}.")]
    PhaseConcurrencyTooHigh {
        index: usize,
        concurrency: u32,
        max: u32,
    },
    #[error("Invalid URL for endpoint {index}: '{url}'")]
    InvalidEndpointUrl { index: usize, url: String },
}
