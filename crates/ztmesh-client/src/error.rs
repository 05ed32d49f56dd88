//! Error classification shared by the session and the orchestrators

use std::fmt;

/// How an error should be treated by whoever receives it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Expired or invalid credential. Terminal, never retried silently.
    Authentication,
    /// Relay connection failed. Reconnecting is the caller's decision.
    Transport,
    /// Malformed or unexpected frame. Logged and dropped.
    Protocol,
    /// Local dial or bind failure. Fatal to one route only.
    LocalResource,
    /// Bad input or missing tunnel record, reported before any relay traffic.
    Application,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::LocalResource => "local-resource",
            ErrorKind::Application => "application",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
