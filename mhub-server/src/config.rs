//! JSON configuration loading and `Hub` assembly (§6).
//!
//! Grounded on the teacher's `builder.rs` for the "fallible, fluent
//! construction that ends in a ready-to-run server" shape, generalized from
//! a chain of `.method()` calls configured in code to a single JSON document
//! parsed at startup, since §6 specifies a config *file* rather than a
//! builder API.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use mhub_core::types::PatternSpec;

use crate::auth::{Authenticator, RightsEntry, RightsTable};
use crate::hub::{Hub, Node as HubNode};
use crate::node::{ConsoleDestination, Exchange, HeaderStore, Queue, TopicStore};
use crate::storage::{FileStorage, Storage, ThrottledStorage};

const DEFAULT_WEBSOCKET_PORT: u16 = 13900;
const DEFAULT_TCP_PORT: u16 = 13902;
const DEFAULT_STORAGE_ROOT: &str = "./storage";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    ReadUsersFile { path: String, source: std::io::Error },
    #[error("a tls listener requires both `key` and `cert`")]
    MissingTlsMaterial,
    #[error("unrecognized node type: {0}")]
    UnknownNodeType(String),
    #[error(transparent)]
    Hub(#[from] mhub_core::error::Error),
}

/// A single entry of the `listen` config key (§6): either a WebSocket or a
/// plain TCP listener. TLS fields are accepted and validated for presence
/// but the handshake itself is out of scope (§1); a `tls` listener is
/// expected to sit behind a reverse proxy or a future `tokio-rustls` layer.
#[derive(Debug, Clone)]
pub enum ListenSpec {
    WebSocket {
        host: IpAddr,
        port: u16,
        backlog: Option<u32>,
        tls: bool,
    },
    Tcp {
        host: IpAddr,
        port: u16,
        backlog: Option<u32>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawListenType {
    Websocket,
    Tcp,
}

#[derive(Debug, Deserialize)]
struct RawListenSpec {
    #[serde(rename = "type")]
    kind: RawListenType,
    #[serde(default)]
    host: Option<IpAddr>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    backlog: Option<u32>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    ca: Option<String>,
    #[serde(default)]
    pfx: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUsersField {
    Path(String),
    Inline(HashMap<String, String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawListenField {
    One(RawListenSpec),
    Many(Vec<RawListenSpec>),
}

#[derive(Debug, Deserialize, Default)]
struct NodeOptions {
    #[serde(default)]
    capacity: Option<usize>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    persistent: bool,
}

#[derive(Debug, Deserialize)]
struct TypedNodeSpec {
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    options: NodeOptions,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNodesField {
    Named(Vec<String>),
    Typed(HashMap<String, TypedNodeSpec>),
}

#[derive(Debug, Deserialize)]
struct RawBinding {
    from: String,
    to: String,
    #[serde(default)]
    pattern: Option<PatternSpec>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    listen: Option<RawListenField>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    nodes: Option<RawNodesField>,
    #[serde(default)]
    bindings: Vec<RawBinding>,
    #[serde(default)]
    users: Option<RawUsersField>,
    #[serde(default)]
    rights: HashMap<String, RightsEntry>,
    #[serde(default)]
    storage: Option<String>,
    #[serde(default)]
    logging: Option<String>,
}

/// A fully parsed configuration, ready to build listeners and a [`Hub`] from.
pub struct Config {
    pub listen: Vec<ListenSpec>,
    pub storage_root: PathBuf,
    pub log_level: Option<String>,
    users: HashMap<String, String>,
    rights: HashMap<String, RightsEntry>,
    nodes: RawNodesField,
    bindings: Vec<RawBinding>,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;

        let mut listen = Vec::new();
        match raw.listen {
            Some(RawListenField::One(spec)) => listen.push(resolve_listen(spec)?),
            Some(RawListenField::Many(specs)) => {
                for spec in specs {
                    listen.push(resolve_listen(spec)?);
                }
            }
            None => {}
        }
        if let Some(port) = raw.port {
            listen.push(ListenSpec::WebSocket {
                host: IpAddr::from([0, 0, 0, 0]),
                port,
                backlog: None,
                tls: false,
            });
        }
        if listen.is_empty() {
            listen.push(ListenSpec::WebSocket {
                host: IpAddr::from([0, 0, 0, 0]),
                port: DEFAULT_WEBSOCKET_PORT,
                backlog: None,
                tls: false,
            });
        }

        let users = match raw.users {
            None => HashMap::new(),
            Some(RawUsersField::Inline(map)) => map,
            Some(RawUsersField::Path(path)) => {
                let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadUsersFile {
                    path: path.clone(),
                    source: e,
                })?;
                serde_json::from_str(&text)?
            }
        };

        Ok(Self {
            listen,
            storage_root: PathBuf::from(raw.storage.unwrap_or_else(|| DEFAULT_STORAGE_ROOT.to_string())),
            log_level: raw.logging,
            users,
            rights: raw.rights,
            nodes: raw.nodes.unwrap_or(RawNodesField::Named(vec!["default".to_string()])),
            bindings: raw.bindings,
        })
    }

    /// Assembles and initializes a [`Hub`] from this configuration: wires up
    /// the authenticator, the rights table (with the default-allow rule from
    /// §9 applied when neither `users` nor `rights` was configured), every
    /// node, and the startup bindings.
    pub async fn build_hub(self) -> Result<Arc<Hub>, ConfigError> {
        let unconfigured = self.users.is_empty() && self.rights.is_empty();
        let authenticator = Authenticator::new(self.users);
        let rights = RightsTable::new(self.rights, unconfigured);

        let storage: Arc<dyn Storage> = Arc::new(ThrottledStorage::new(
            FileStorage::new(self.storage_root.clone()),
            std::time::Duration::from_millis(100),
        ));

        let hub = Hub::new(authenticator, rights, storage);

        match self.nodes {
            RawNodesField::Named(names) => {
                for name in names {
                    hub.add_node(HubNode::Exchange(Arc::new(Exchange::new(name))))
                        .await?;
                }
            }
            RawNodesField::Typed(map) => {
                for (name, spec) in map {
                    hub.add_node(build_node(name, spec)?).await?;
                }
            }
        }

        hub.initialize().await?;

        for binding in self.bindings {
            let Some(source) = hub.source(&binding.from).await else {
                return Err(ConfigError::Hub(mhub_core::error::Error::fatal(format!(
                    "binding references unknown source node: {}",
                    binding.from
                ))));
            };
            let Some(target) = hub.node(&binding.to).await else {
                return Err(ConfigError::Hub(mhub_core::error::Error::fatal(format!(
                    "binding references unknown destination node: {}",
                    binding.to
                ))));
            };
            let patterns = binding
                .pattern
                .as_ref()
                .map(PatternSpec::patterns)
                .unwrap_or_else(|| vec![String::new()]);
            for pattern in patterns {
                source.bind(target.as_destination(), &pattern).await?;
            }
        }

        Ok(Arc::new(hub))
    }
}

fn build_node(name: String, spec: TypedNodeSpec) -> Result<HubNode, ConfigError> {
    let node_type = normalize_node_type(&spec.node_type);
    let node = match node_type.as_str() {
        "exchange" => HubNode::Exchange(Arc::new(Exchange::new(name))),
        "queue" => HubNode::Queue(Arc::new(
            Queue::new(name, spec.options.capacity.unwrap_or(10), spec.options.pattern.as_deref())
                .persistent(spec.options.persistent),
        )),
        "headerstore" => HubNode::HeaderStore(Arc::new(HeaderStore::new(name).persistent(spec.options.persistent))),
        "topicstore" => HubNode::TopicStore(Arc::new(TopicStore::new(name).persistent(spec.options.persistent))),
        "consoledestination" => HubNode::Console(Arc::new(ConsoleDestination::new(name))),
        other => return Err(ConfigError::UnknownNodeType(other.to_string())),
    };
    Ok(node)
}

/// Normalizes a configured node type string, folding the backward-compatible
/// `TopicQueue`/`TopicState` aliases (§6) onto `TopicStore`.
fn normalize_node_type(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "topicqueue" | "topicstate" => "topicstore".to_string(),
        other => other.to_string(),
    }
}

fn resolve_listen(spec: RawListenSpec) -> Result<ListenSpec, ConfigError> {
    let host = spec.host.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
    match spec.kind {
        RawListenType::Tcp => Ok(ListenSpec::Tcp {
            host,
            port: spec.port.unwrap_or(DEFAULT_TCP_PORT),
            backlog: spec.backlog,
        }),
        RawListenType::Websocket => {
            let tls = spec.key.is_some() || spec.cert.is_some() || spec.ca.is_some() || spec.pfx.is_some();
            if tls && (spec.key.is_none() || spec.cert.is_none()) {
                return Err(ConfigError::MissingTlsMaterial);
            }
            Ok(ListenSpec::WebSocket {
                host,
                port: spec.port.unwrap_or(DEFAULT_WEBSOCKET_PORT),
                backlog: spec.backlog,
                tls,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_users_and_rights_default_to_allow_all() {
        let config = Config::from_json(r#"{"nodes": ["default"]}"#).unwrap();
        let hub = config.build_hub().await.unwrap();
        let authorizer = hub.authorizer_for("").unwrap();
        assert!(authorizer.can_publish("default", "anything"));
    }

    #[tokio::test]
    async fn typed_nodes_and_bindings_wire_up() {
        let json = r#"{
            "nodes": {
                "input": {"type": "Exchange"},
                "archive": {"type": "TopicQueue"}
            },
            "bindings": [{"from": "input", "to": "archive"}]
        }"#;
        let config = Config::from_json(json).unwrap();
        let hub = config.build_hub().await.unwrap();
        assert!(hub.node("input").await.is_some());
        assert!(matches!(hub.node("archive").await, Some(HubNode::TopicStore(_))));
    }

    #[test]
    fn tls_listener_without_key_or_cert_is_rejected() {
        let json = r#"{"listen": {"type": "websocket", "cert": "c.pem"}}"#;
        let err = Config::from_json(json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTlsMaterial));
    }

    #[test]
    fn default_listener_is_websocket_on_the_standard_port() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.listen.len(), 1);
        match config.listen[0] {
            ListenSpec::WebSocket { port, .. } => assert_eq!(port, DEFAULT_WEBSOCKET_PORT),
            _ => panic!("expected a websocket listener"),
        }
    }
}
