/// Errors raised while interpreting frames from a push-channel peer.
///
/// None of these terminate the session: the frame is dropped and the
/// session keeps whatever bootstrap state it already had.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("identity is empty")]
    EmptyIdentity,
    #[error("identity must be a string, got {0}")]
    IdentityNotString(&'static str),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

impl ProtocolError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyIdentity => "empty_identity",
            Self::IdentityNotString(_) => "identity_not_string",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::NotUtf8 => "not_utf8",
        }
    }
}
