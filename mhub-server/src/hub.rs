//! The Hub (§4.6): owns the node registry, the authenticator and rights
//! table, the storage handle, and the session table. Nothing else in this
//! crate reaches into another component's state directly — every cross-node
//! or cross-session operation goes through here.
//!
//! Grounded on the teacher's `JrowServer` (`lib.rs`) for the "one struct
//! owns every shared table, `run()` drives the accept loop" shape, and on
//! `builder.rs`'s fallible, fluent construction pattern for `HubBuilder`.

use std::collections::HashMap;
use std::sync::Arc;

use mhub_core::error::{Error, Result};
use mhub_core::types::Message;
use tokio::sync::{Mutex, RwLock};

use crate::auth::{Authenticator, Authorizer, RightsTable};
use crate::node::{ConsoleDestination, Destination, Exchange, HeaderStore, Queue, TopicStore};
use crate::session::{Session, SessionKind};
use crate::storage::Storage;

/// A uniform handle over the node types in [`crate::node`], letting the Hub
/// store them in one registry despite their differing `send` signatures
/// (only persistent node types need the storage handle on publish).
#[derive(Clone)]
pub enum Node {
    Exchange(Arc<Exchange>),
    Queue(Arc<Queue>),
    HeaderStore(Arc<HeaderStore>),
    TopicStore(Arc<TopicStore>),
    Console(Arc<ConsoleDestination>),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Exchange(n) => n.name(),
            Node::Queue(n) => n.name(),
            Node::HeaderStore(n) => n.name(),
            Node::TopicStore(n) => n.name(),
            Node::Console(n) => n.name(),
        }
    }

    /// `ConsoleDestination` is the only destination-only node type; every
    /// other node type can also act as a Source.
    pub fn is_source(&self) -> bool {
        !matches!(self, Node::Console(_))
    }

    pub fn as_destination(&self) -> Arc<dyn Destination> {
        match self {
            Node::Exchange(n) => n.clone(),
            Node::Queue(n) => n.clone(),
            Node::HeaderStore(n) => n.clone(),
            Node::TopicStore(n) => n.clone(),
            Node::Console(n) => n.clone(),
        }
    }

    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) -> Result<()> {
        match self {
            Node::Exchange(n) => {
                n.bind(destination, pattern).await;
                Ok(())
            }
            Node::Queue(n) => {
                n.bind(destination, pattern).await;
                Ok(())
            }
            Node::HeaderStore(n) => {
                n.bind(destination, pattern).await;
                Ok(())
            }
            Node::TopicStore(n) => {
                n.bind(destination, pattern).await;
                Ok(())
            }
            Node::Console(_) => Err(Error::NotFound),
        }
    }

    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        match self {
            Node::Exchange(n) => n.unbind(destination_name, pattern).await,
            Node::Queue(n) => n.unbind(destination_name, pattern).await,
            Node::HeaderStore(n) => n.unbind(destination_name, pattern).await,
            Node::TopicStore(n) => n.unbind(destination_name, pattern).await,
            Node::Console(_) => {}
        }
    }

    /// Publishes a message directly into this node (the `publish` command's
    /// entry point, not a downstream `Destination::send`). Persistent node
    /// types take the storage handle here so their snapshot gets written;
    /// routing a message through a plain `Destination::send` binding never
    /// persists, since that path has no storage handle to write through.
    pub async fn publish(&self, msg: Arc<Message>, storage: &dyn Storage) -> Result<()> {
        match self {
            Node::Exchange(n) => {
                n.send(msg).await;
                Ok(())
            }
            Node::Queue(n) => n.send(msg, Some(storage)).await,
            Node::HeaderStore(n) => n.send(msg, Some(storage)).await,
            Node::TopicStore(n) => n.send(msg, Some(storage)).await,
            Node::Console(n) => {
                n.send(msg).await;
                Ok(())
            }
        }
    }

    async fn init(&self, storage: &dyn Storage) -> Result<()> {
        match self {
            Node::Queue(n) => n.init(storage).await,
            Node::HeaderStore(n) => n.init(storage).await,
            Node::TopicStore(n) => n.init(storage).await,
            Node::Exchange(_) | Node::Console(_) => Ok(()),
        }
    }
}

pub struct Hub {
    nodes: RwLock<HashMap<String, Node>>,
    authenticator: Authenticator,
    rights: RightsTable,
    storage: Arc<dyn Storage>,
    sessions: Mutex<HashMap<(String, String), Arc<Session>>>,
}

impl Hub {
    pub fn new(authenticator: Authenticator, rights: RightsTable, storage: Arc<dyn Storage>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            authenticator,
            rights,
            storage,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a node at startup. A duplicate name is an abort-worthy
    /// misconfiguration, not a runtime error (§7 Fatal).
    pub async fn add_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(node.name()) {
            return Err(Error::fatal(format!("duplicate node name: {}", node.name())));
        }
        nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn source(&self, name: &str) -> Option<Node> {
        self.node(name).await.filter(Node::is_source)
    }

    pub async fn node_names(&self) -> Vec<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// Calls `init` on every node that persists state, loading its snapshot
    /// from storage if one exists.
    pub async fn initialize(&self) -> Result<()> {
        let nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        for node in nodes {
            node.init(self.storage.as_ref()).await?;
        }
        Ok(())
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.authenticator.authenticate(username, password)
    }

    pub fn authorizer_for(&self, username: &str) -> Result<Authorizer> {
        self.rights.resolve(username)
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Returns the session identified by `(username, name)`, creating a new
    /// `Memory` session if none exists yet. `username` is the empty string
    /// for anonymous clients.
    pub async fn get_or_create_session(&self, username: &str, name: &str) -> Arc<Session> {
        let key = (username.to_string(), name.to_string());
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(key)
            .or_insert_with(|| Arc::new(Session::new(username, name, SessionKind::Memory)))
            .clone()
    }

    pub fn new_volatile_session(&self, username: &str) -> Arc<Session> {
        Arc::new(Session::new(username, "", SessionKind::Volatile))
    }
}
