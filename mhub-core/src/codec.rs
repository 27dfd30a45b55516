//! Wire framing: decode a single JSON document into a `Command`, encode a
//! `Response` back into one.
//!
//! Transports (websocket frames, newline-delimited TCP lines) each hand a
//! single JSON text unit to [`decode`]; parse failures become
//! `Error::Protocol` so the caller can turn them into an `error` response
//! without a `seq` (none could be recovered from unparseable input).

use crate::error::{Error, Result};
use crate::types::{Command, Response};

pub fn decode(data: &str) -> Result<Command> {
    serde_json::from_str(data).map_err(|e| Error::protocol(format!("invalid command: {e}")))
}

pub fn encode(response: &Response) -> Result<String> {
    serde_json::to_string(response)
        .map_err(|e| Error::protocol(format!("failed to encode response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Response;

    #[test]
    fn decode_rejects_garbage() {
        let err = decode("not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_accepts_ping() {
        let cmd = decode(r#"{"type":"ping","seq":7}"#).unwrap();
        assert_eq!(cmd.seq(), Some(7));
    }

    #[test]
    fn encode_roundtrips_pingack() {
        let resp = Response::Pingack { seq: Some(3) };
        let json = encode(&resp).unwrap();
        assert!(json.contains("\"type\":\"pingack\""));
        assert!(json.contains("\"seq\":3"));
    }
}
