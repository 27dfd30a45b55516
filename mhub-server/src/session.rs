//! Sessions: the `(username, name)`-identified holder of a client's
//! subscriptions that outlives any single connection (§4.8, §3).
//!
//! A session owns its `Subscription`s; a connection only ever borrows one
//! session at a time via `attach`/`detach`. Grounded on the teacher's
//! `persistent_subscription.rs` exclusivity model (a named, reconnectable
//! holder that a new connection can forcibly take over from a stale one),
//! generalized to a full reconnect handshake across every open subscription
//! rather than a single watermark.

use std::collections::HashMap;
use std::sync::Arc;

use mhub_core::types::Response;
use tokio::sync::{mpsc, Mutex};

use crate::subscription::{Delivery, Subscription, Window};

pub type ResponseSink = mpsc::UnboundedSender<Response>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Dies the moment its connection detaches; subscriptions auto-ack with
    /// an unbounded window.
    Volatile,
    /// Survives disconnect under its `name`; subscriptions start with a
    /// manual-ack, zero-width window until the client acks.
    Memory,
}

/// A subscription plus the names of the source nodes it is currently bound
/// to, returned when a subscription is torn down so the caller can unbind it
/// from those nodes too (Session has no visibility into the node registry).
pub struct Teardown {
    pub subscription: Arc<Subscription>,
    pub bound_nodes: Vec<String>,
}

pub struct Session {
    username: String,
    name: String,
    kind: SessionKind,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    connection: Mutex<Option<ResponseSink>>,
}

impl Session {
    pub fn new(username: impl Into<String>, name: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            username: username.into(),
            name: name.into(),
            kind,
            subscriptions: Mutex::new(HashMap::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_volatile(&self) -> bool {
        self.kind == SessionKind::Volatile
    }

    fn default_window(&self) -> Window {
        match self.kind {
            SessionKind::Volatile => Window::Infinite,
            SessionKind::Memory => Window::Finite(0),
        }
    }

    /// Returns the subscription named `id`, creating it (with no bindings
    /// yet) if it doesn't exist. If a connection is currently attached, the
    /// new subscription is wired to deliver through it immediately.
    pub async fn get_or_create_subscription(&self, id: &str) -> Arc<Subscription> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(existing) = subs.get(id) {
            return existing.clone();
        }
        let sub = Arc::new(Subscription::new(id, self.default_window()));
        subs.insert(id.to_string(), sub.clone());
        drop(subs);

        if let Some(sink) = self.connection.lock().await.clone() {
            wire_subscription(&sub, sink);
        }
        sub
    }

    pub async fn subscription(&self, id: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.lock().await.get(id).cloned()
    }

    /// Reconciles the live subscription set against `ids`: subscriptions not
    /// in `ids` are removed (and returned for the caller to unbind from
    /// their source nodes); subscriptions in `ids` that don't exist yet are
    /// created empty.
    pub async fn set_subscriptions(&self, ids: &[String]) -> Vec<Teardown> {
        let wanted: std::collections::HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        let mut subs = self.subscriptions.lock().await;

        let remove: Vec<String> = subs
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();

        let mut teardowns = Vec::with_capacity(remove.len());
        for id in remove {
            if let Some(sub) = subs.remove(&id) {
                let bound_nodes = sub.bound_node_names().await;
                teardowns.push(Teardown {
                    subscription: sub,
                    bound_nodes,
                });
            }
        }

        let sink = self.connection.lock().await.clone();
        for id in ids {
            if !subs.contains_key(id) {
                let sub = Arc::new(Subscription::new(id.clone(), self.default_window()));
                if let Some(sink) = &sink {
                    wire_subscription(&sub, sink.clone());
                }
                subs.insert(id.clone(), sub);
            }
        }

        teardowns
    }

    /// Attaches `sink` as this session's live connection. If another
    /// connection already held this session, it is forcibly detached first
    /// and told why. Every existing subscription is then reconnected: for a
    /// `Memory` session this resets `inflight`/`window` per §4.7's
    /// `connect()`; for a `Volatile` session (which never truly
    /// reattaches) it simply starts delivering.
    pub async fn attach(&self, sink: ResponseSink) {
        let mut connection = self.connection.lock().await;
        if let Some(previous) = connection.take() {
            let _ = previous.send(Response::error(None, "session taken over by a new connection"));
        }
        *connection = Some(sink.clone());
        drop(connection);

        let subs: Vec<Arc<Subscription>> = self.subscriptions.lock().await.values().cloned().collect();
        for sub in subs {
            if self.kind == SessionKind::Memory {
                let (tx, rx) = mpsc::unbounded_channel();
                spawn_forwarder(sub.id().to_string(), rx, sink.clone());
                sub.connect(tx).await;
            } else {
                wire_subscription(&sub, sink.clone());
            }
        }
    }

    /// Detaches the current connection, if any. A `Volatile` session has no
    /// life beyond its connection, so the caller should follow this with
    /// `destroy()`; a `Memory` session simply goes quiet until `attach` is
    /// called again.
    pub async fn detach(&self) {
        let mut connection = self.connection.lock().await;
        if connection.take().is_some() {
            drop(connection);
            let subs: Vec<Arc<Subscription>> = self.subscriptions.lock().await.values().cloned().collect();
            for sub in subs {
                sub.clear_deliver().await;
            }
        }
    }

    pub async fn has_connection(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Detaches (if needed) and clears every subscription, returning their
    /// bound node names so the caller can unbind them from the node
    /// registry this session has no visibility into.
    pub async fn destroy(&self) -> Vec<Teardown> {
        self.detach().await;
        let mut subs = self.subscriptions.lock().await;
        let mut teardowns = Vec::with_capacity(subs.len());
        for (_, sub) in subs.drain() {
            let bound_nodes = sub.bound_node_names().await;
            teardowns.push(Teardown {
                subscription: sub,
                bound_nodes,
            });
        }
        teardowns
    }
}

fn wire_subscription(sub: &Arc<Subscription>, sink: ResponseSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_forwarder(sub.id().to_string(), rx, sink);
    let sub = sub.clone();
    tokio::spawn(async move {
        sub.set_deliver(tx).await;
    });
}

fn spawn_forwarder(subscription_id: String, mut rx: mpsc::UnboundedReceiver<Delivery>, sink: ResponseSink) {
    tokio::spawn(async move {
        while let Some(delivery) = rx.recv().await {
            let response = Response::Message {
                topic: delivery.message.topic.clone(),
                data: delivery.message.data.clone(),
                headers: delivery.message.headers.clone(),
                subscription: subscription_id.clone(),
                seq: delivery.seq,
            };
            if sink.send(response).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mhub_core::types::Message;
    use std::sync::Arc as StdArc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Response>) -> Vec<Response> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn volatile_subscription_auto_acks_through_attached_connection() {
        let session = Session::new("", "", SessionKind::Volatile);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach(tx).await;

        let sub = session.get_or_create_subscription("default").await;
        sub.add(StdArc::new(Message::new("hello"))).await;

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Message { topic, seq, .. } => {
                assert_eq!(topic, "hello");
                assert_eq!(*seq, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attaching_a_new_connection_notifies_the_previous_one() {
        let session = Session::new("alice", "laptop", SessionKind::Memory);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        session.attach(tx1).await;

        let (tx2, _rx2) = mpsc::unbounded_channel();
        session.attach(tx2).await;

        let responses = drain(&mut rx1);
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], Response::Error { .. }));
    }

    #[tokio::test]
    async fn set_subscriptions_removes_and_creates() {
        let session = Session::new("alice", "laptop", SessionKind::Memory);
        session.get_or_create_subscription("a").await;
        session.get_or_create_subscription("b").await;

        let teardowns = session.set_subscriptions(&["b".to_string(), "c".to_string()]).await;
        assert_eq!(teardowns.len(), 1);
        assert_eq!(teardowns[0].subscription.id(), "a");

        assert!(session.subscription("b").await.is_some());
        assert!(session.subscription("c").await.is_some());
        assert!(session.subscription("a").await.is_none());
    }

    #[tokio::test]
    async fn destroy_detaches_and_returns_all_subscriptions() {
        let session = Session::new("alice", "laptop", SessionKind::Memory);
        let (tx, _rx) = mpsc::unbounded_channel();
        session.attach(tx).await;
        session.get_or_create_subscription("a").await;

        let teardowns = session.destroy().await;
        assert_eq!(teardowns.len(), 1);
        assert!(!session.has_connection().await);
    }
}
