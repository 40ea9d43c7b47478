use thiserror::Error;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_TRANSPORT: u8 = 3;
pub const EXIT_TIMESTAMP: u8 = 4;
pub const EXIT_CONFIG: u8 = 5;
pub const EXIT_PARTIAL: u8 = 6;

/// Failure kinds that callers need to tell apart. They travel inside
/// `anyhow::Error` and are recovered with `downcast_ref`.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Non-success response or connection failure from the remote service.
    #[error("transport failure: {0}")]
    Transport(String),

    /// XML-RPC `<fault>` response.
    #[error("remote fault [{code}]: {message}")]
    RemoteFault { code: i64, message: String },

    /// Response body that is not the XML-RPC shape we expect.
    #[error("malformed remote response: {0}")]
    Protocol(String),

    /// A non-null timestamp without the `+00:00` suffix or with an unparseable body.
    #[error("could not decode timestamp '{value}'")]
    TimestampDecode { value: String },

    #[error("invalid credential: {0}")]
    Credential(String),
}

impl MirrorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Transport(_) | Self::RemoteFault { .. } | Self::Protocol(_) => EXIT_TRANSPORT,
            Self::TimestampDecode { .. } => EXIT_TIMESTAMP,
            Self::Credential(_) => EXIT_CONFIG,
        }
    }
}

/// Map an error chain to a process exit code. The first typed
/// `MirrorError` in the chain decides; anything else is a generic failure.
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<MirrorError>())
        .map(MirrorError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}
