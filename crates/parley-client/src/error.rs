/// Errors surfaced by the client SDK.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a failure envelope.
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    /// A send is already in flight for this conversation.
    #[error("a send is already in progress")]
    Busy,
    #[error("no conversation selected")]
    NoPeerSelected,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Busy | Self::NoPeerSelected | Self::Serialization(_) => false,
        }
    }
}
