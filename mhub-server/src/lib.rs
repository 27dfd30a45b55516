//! The MHub broker: node graph, hub, subscription engine, and transports.
//!
//! Connections arrive over [`websocket`] or [`tcp`], each framing decoded
//! [`mhub_core::types::Command`]s into a per-connection [`hub_client::HubClient`],
//! which executes them against a shared [`hub::Hub`].

mod auth;
mod base_source;
mod config;
mod hub;
mod hub_client;
mod node;
mod pattern;
mod session;
mod storage;
mod subscription;
mod tcp;
mod websocket;

pub use auth::{AccessSpec, Authenticator, Authorizer, NodeAccess, RightsEntry, RightsTable, UserRights};
pub use config::{Config, ConfigError, ListenSpec};
pub use hub::{Hub, Node};
pub use hub_client::HubClient;
pub use node::{ConsoleDestination, Destination, Exchange, HeaderStore, Queue, TopicStore};
pub use pattern::{CompiledPattern, Matcher};
pub use session::{ResponseSink, Session, SessionKind};
pub use storage::{FileStorage, Storage, ThrottledStorage};
pub use subscription::{Delivery, Subscription, Window};
pub use tcp::serve_tcp;
pub use websocket::serve_websocket;
