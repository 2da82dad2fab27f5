//! 错误类型 (Error taxonomy)
//!
//! Backends and factories speak `anyhow`; everything the pipeline has to
//! branch on is a variant here.

/// Result type alias
pub type Result<T> = std::result::Result<T, AnalyzerError>;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// Configured backend name is not registered
    #[error("Unsupported {role} backend '{name}'. Known backends: {known}.")]
    UnknownBackend {
        role: &'static str,
        name: String,
        known: String,
    },

    /// Registering a factory under an empty name
    #[error("{role} backend name cannot be empty")]
    InvalidBackendName { role: &'static str },

    /// Backend factory failed to build an engine
    #[error("Failed to initialise {role} backend '{name}': {source:#}")]
    BackendInit {
        role: &'static str,
        name: String,
        source: anyhow::Error,
    },

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),

    /// Frame receive timed out (transient)
    #[error("Frame receive timed out")]
    FrameTimeout,

    /// Upstream track ended or broke
    #[error("Upstream source closed: {0}")]
    SourceClosed(String),

    /// Full reconnect failed, the stream is over
    #[error("Reconnect failed: {0:#}")]
    Reconnect(anyhow::Error),

    /// Frame could not be converted to the working format
    #[error("Frame error: {0}")]
    Frame(String),

    /// A single subscriber could not be reached
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// Detection / depth / tracking failed for one frame
    #[error("Inference error: {0:#}")]
    Inference(anyhow::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyzerError {
    pub(crate) fn unknown_backend<'a>(
        role: &'static str,
        name: &str,
        known: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let known: Vec<&str> = known.into_iter().map(String::as_str).collect();
        AnalyzerError::UnknownBackend {
            role,
            name: name.to_string(),
            known: if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            },
        }
    }
}
