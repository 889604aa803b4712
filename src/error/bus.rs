use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out connecting to {addr} after {attempts} attempts.")]
    ConnectTimeout { addr: String, attempts: u32 },
    #[error("Bus server not ready within {timeout_secs}s.")]
    NotReady { timeout_secs: u64 },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Frame exceeded max size ({max_bytes} bytes).")]
    FrameTooLarge { max_bytes: usize },
    #[error("Frame was not valid UTF-8: {source}")]
    FrameInvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Client task is gone.")]
    ClientGone,
    #[error("Subscription to {subject} closed.")]
    SubscriptionClosed { subject: String },
}

pub type BusResult<T> = Result<T, BusError>;
