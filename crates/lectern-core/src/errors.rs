/// Errors raised at the relay boundary.
///
/// None of these ever reach the controller of another connection: handshake
/// errors refuse the upgrade, frame errors are answered to the sender only.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Authentication error: API Key missing")]
    MissingSessionKey,
    #[error("unknown client type: {0}")]
    UnknownRole(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid display style: {0}")]
    InvalidStyle(String),
}

impl RelayError {
    /// HTTP status used when this error refuses a WebSocket handshake.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingSessionKey => 401,
            Self::UnknownRole(_) | Self::MalformedFrame(_) | Self::InvalidStyle(_) => 400,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingSessionKey => "missing_session_key",
            Self::UnknownRole(_) => "unknown_role",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::InvalidStyle(_) => "invalid_style",
        }
    }
}
