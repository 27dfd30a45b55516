//! Error taxonomy for the broker core
//!
//! Every failure that can reach a client boundary maps to one of the kinds
//! listed below. The mapping from a command-handling failure to a wire
//! error response is one-to-one: the variant carries whatever text the
//! client is allowed to see, and nothing else leaks into the message.
//!
//! # Permission hiding
//!
//! `PermissionDenied` carries a single fixed message, independent of the
//! node or user involved. That uniformity is what makes an unknown-node
//! probe and a denied-subscribe probe byte-identical on the wire.

/// Result alias used throughout the broker core and server crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Broker-facing error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed JSON, a missing/invalid field, or an unrecognized command type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Covers both "right not granted" and "node exists but you cannot see it".
    /// The message is intentionally uniform across both cases.
    #[error("permission denied")]
    PermissionDenied,

    /// The node does not exist and the user otherwise has rights to see it.
    #[error("unknown node")]
    NotFound,

    /// The command is well-formed but inapplicable to the connection's
    /// current state (`login` twice, `session` while attached, `ack` on a
    /// subscription with no session, ...).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unrecoverable at startup: duplicate node name, corrupt rights
    /// configuration, a storage backend that cannot be opened.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Storage I/O failure outside of the save/load contract itself
    /// (e.g. directory creation, rename failure).
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// The text sent to the client in an `error` response.
    ///
    /// Kept separate from `Display` so that internal variants (e.g.
    /// `Storage`) can carry richer detail in logs while the wire message
    /// stays terse. `NotFound` and `PermissionDenied` already coincide with
    /// their wire text; everything else surfaces its `Display` form.
    pub fn wire_message(&self) -> String {
        match self {
            Error::PermissionDenied => "permission denied".to_string(),
            Error::NotFound => "unknown node".to_string(),
            other => other.to_string(),
        }
    }
}

/// Raised while compiling a pattern spec (§4.1 Match); converted to
/// `Error::Protocol` at the command-parsing boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatternError {
    #[error("invalid pattern spec: {0}")]
    InvalidSpec(String),
}

impl From<PatternError> for Error {
    fn from(e: PatternError) -> Self {
        Error::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_message_is_fixed() {
        let unknown_node = Error::NotFound;
        let denied = Error::PermissionDenied;
        assert_ne!(unknown_node.wire_message(), denied.wire_message());
        assert_eq!(denied.wire_message(), "permission denied");
    }

    #[test]
    fn invalid_state_carries_detail() {
        let e = Error::invalid_state("already logged in");
        assert_eq!(e.wire_message(), "invalid state: already logged in");
    }

    #[test]
    fn pattern_error_converts_to_protocol() {
        let e: Error = PatternError::InvalidSpec("type error".into()).into();
        assert!(matches!(e, Error::Protocol(_)));
    }
}
