//! Core wire types and codec for the mhub broker
//!
//! This crate provides the pieces shared between the broker binary and any
//! future client: the `Message`/`Command`/`Response` wire model, a JSON codec
//! over it, the broker's error taxonomy, and the OpenTelemetry bootstrap.
//!
//! - **types**: `Message`, `Command`, `Response`, `PatternSpec` — the wire model
//! - **codec**: decode a command / encode a response
//! - **error**: the `Error` enum every fallible operation resolves to
//! - **observability**: OpenTelemetry/tracing bootstrap
//!
//! # Example
//!
//! ```rust
//! use mhub_core::{codec, types::Response};
//!
//! let cmd = codec::decode(r#"{"type":"ping","seq":1}"#).unwrap();
//! assert_eq!(cmd.seq(), Some(1));
//!
//! let json = codec::encode(&Response::Pingack { seq: Some(1) }).unwrap();
//! assert!(json.contains("\"type\":\"pingack\""));
//! ```

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use error::{Error, PatternError, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{Command, HeaderValue, Headers, Message, PatternSpec, Response, Seq};
