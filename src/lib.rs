//! MHub — a lightweight publish/subscribe message broker over WebSocket and
//! TCP.
//!
//! This crate wires together [`mhub_core`] (wire types, error taxonomy,
//! observability bootstrap) and [`mhub_server`] (the node graph, hub,
//! subscription engine and transports) behind a single `mhub` binary. Most
//! applications embedding the broker as a library should depend on
//! `mhub-core`/`mhub-server` directly; this crate exists to produce the
//! `mhub` executable.

pub use mhub_core as core;
pub use mhub_server as server;
