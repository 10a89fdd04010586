use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeeFlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Screen capture error: {0}")]
    Capture(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Run cancelled")]
    Cancelled,
}

impl serde::Serialize for SeeFlowError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type SeeFlowResult<T> = Result<T, SeeFlowError>;
