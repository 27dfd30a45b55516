//! The subscription engine (§4.7): a per-subscription inbound buffer with
//! sliding-window, ack-gated delivery.
//!
//! Grounded on the teacher's `persistent_subscription.rs` for the
//! "destination id -> tracked delivery progress" shape and its
//! exclusivity-on-one-connection model, generalized here from a bare
//! watermark (`last_ack_seq`, replayed from a storage log on reconnect) to an
//! actual bounded in-memory FIFO buffer that is replayed from memory on
//! reconnect, per this broker's simpler at-least-once contract (§9).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use mhub_core::error::{Error, Result};
use mhub_core::types::Message;
use tokio::sync::{mpsc, Mutex};

use crate::node::Destination;
use crate::pattern::Matcher;

/// A subscription's delivery window: a finite cap on inflight messages, or
/// unbounded (auto-ack: every message is immediately considered delivered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Finite(u64),
    Infinite,
}

impl Window {
    fn as_finite(self) -> Option<u64> {
        match self {
            Window::Finite(w) => Some(w),
            Window::Infinite => None,
        }
    }
}

/// One outbound message event: the message plus the per-subscription
/// sequence number it was assigned at emission time.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub seq: u64,
}

struct State {
    first: u64,
    inflight: u64,
    window: Window,
    announced_window: Window,
    buffer: VecDeque<Arc<Message>>,
    deliver: Option<mpsc::UnboundedSender<Delivery>>,
}

/// A delivery channel from zero-or-more sources into one client, under a
/// client-chosen id. Owned by exactly one Session (§3).
pub struct Subscription {
    id: String,
    state: Mutex<State>,
    sources: Mutex<HashMap<String, Vec<String>>>,
    nodes: Mutex<HashMap<String, Arc<SubscriptionNode>>>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, window: Window) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(State {
                first: 0,
                inflight: 0,
                window,
                announced_window: window,
                buffer: VecDeque::new(),
                deliver: None,
            }),
            sources: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current acked watermark, reported back to the client as `lastAck`.
    pub async fn last_ack(&self) -> u64 {
        self.state.lock().await.first
    }

    /// Attaches (or reattaches) an outgoing delivery channel and attempts to
    /// flush any buffered messages through it.
    pub async fn set_deliver(&self, tx: mpsc::UnboundedSender<Delivery>) {
        let mut state = self.state.lock().await;
        state.deliver = Some(tx);
        flush_locked(&mut state);
    }

    pub async fn clear_deliver(&self) {
        self.state.lock().await.deliver = None;
    }

    /// Called when a Memory session's client reattaches: resets `inflight`
    /// and `window` to zero but preserves `first` and the buffer, so every
    /// unacked message is resent once the client raises its window again.
    pub async fn connect(&self, tx: mpsc::UnboundedSender<Delivery>) {
        let mut state = self.state.lock().await;
        state.inflight = 0;
        state.window = Window::Finite(0);
        state.deliver = Some(tx);
        flush_locked(&mut state);
    }

    /// Appends `message` to the buffer and attempts to flush.
    pub async fn add(&self, message: Arc<Message>) {
        let mut state = self.state.lock().await;
        state.buffer.push_back(message);
        flush_locked(&mut state);
    }

    /// Enforces `first <= up_to <= first + buffer.len()`, releases acked
    /// buffer entries, optionally adjusts the window, then flushes.
    pub async fn ack(&self, up_to: u64, new_window: Option<Window>) -> Result<()> {
        let mut state = self.state.lock().await;
        if up_to < state.first || up_to > state.first + state.buffer.len() as u64 {
            return Err(Error::protocol(format!(
                "ack {up_to} out of range [{}, {}]",
                state.first,
                state.first + state.buffer.len() as u64
            )));
        }
        let k = up_to - state.first;
        for _ in 0..k {
            state.buffer.pop_front();
        }
        state.first += k;
        state.inflight = state.inflight.saturating_sub(k);
        if let Some(w) = new_window {
            state.window = w;
        }
        flush_locked(&mut state);
        Ok(())
    }

    /// The window value last announced to the client, for diffing in
    /// `subscriptionack`-style responses that only report it when it changed.
    pub async fn announced_window(&self) -> Window {
        let state = self.state.lock().await;
        state.announced_window
    }

    pub async fn mark_window_announced(&self) {
        let mut state = self.state.lock().await;
        state.announced_window = state.window;
    }

    /// Records that this subscription is now bound to `pattern` on `node`,
    /// for `subscriptionack`'s readback of current bindings.
    pub async fn record_bind(&self, node: &str, pattern: &str) {
        let mut sources = self.sources.lock().await;
        let patterns = sources.entry(node.to_string()).or_default();
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_string());
        }
    }

    pub async fn record_unbind(&self, node: &str, pattern: Option<&str>) {
        let mut sources = self.sources.lock().await;
        match pattern {
            None => {
                sources.remove(node);
            }
            Some(pattern) => {
                if let Some(patterns) = sources.get_mut(node) {
                    patterns.retain(|p| p != pattern);
                    if patterns.is_empty() {
                        sources.remove(node);
                    }
                }
            }
        }
    }

    pub async fn bindings(&self) -> HashMap<String, Vec<String>> {
        self.sources.lock().await.clone()
    }

    pub async fn bound_node_names(&self) -> Vec<String> {
        self.sources.lock().await.keys().cloned().collect()
    }

    /// Returns the [`SubscriptionNode`] destination this subscription uses to
    /// receive from `source_node`, creating it on first use. The same
    /// destination identity is reused across repeated `bind`/`unbind` calls
    /// on the same (subscription, source) pair so that `BaseSource`'s
    /// dedup-by-name bookkeeping keeps routing to it.
    pub async fn node_destination(self: &Arc<Self>, source_node: &str) -> Arc<SubscriptionNode> {
        let mut nodes = self.nodes.lock().await;
        nodes
            .entry(source_node.to_string())
            .or_insert_with(|| Arc::new(SubscriptionNode::new(self.clone(), source_node, Matcher::never())))
            .clone()
    }
}

fn flush_locked(state: &mut State) {
    loop {
        if state.buffer.len() as u64 <= state.inflight {
            break;
        }
        if let Some(window) = state.window.as_finite() {
            if state.inflight >= window {
                break;
            }
        }
        let message = state.buffer[state.inflight as usize].clone();
        state.inflight += 1;
        let seq = state.first + state.inflight;

        if let Some(tx) = &state.deliver {
            let _ = tx.send(Delivery {
                message: message.clone(),
                seq,
            });
        }

        if state.window == Window::Infinite {
            state.first += state.inflight;
            state.inflight = 0;
            state.buffer.clear();
        }
    }
}

/// Per-(subscription, source) binding target: forwards matching messages
/// into the subscription's buffer after re-checking the authorization
/// predicate resolved at login (§4.5, §4.7).
///
/// The auth predicate is re-derived every time the client adds or removes a
/// pattern on this (subscription, source) pair — it is the AND of the rights
/// table's subscribe matcher for the node and the union of every
/// client-supplied pattern currently bound here — so it is stored behind a
/// `Mutex` rather than fixed at construction.
pub struct SubscriptionNode {
    name: String,
    subscription: Arc<Subscription>,
    auth: Mutex<Matcher>,
}

impl SubscriptionNode {
    pub fn new(subscription: Arc<Subscription>, source_node: &str, auth: Matcher) -> Self {
        Self {
            name: subscription_node_name(subscription.id(), source_node),
            subscription,
            auth: Mutex::new(auth),
        }
    }

    pub async fn set_auth(&self, auth: Matcher) {
        *self.auth.lock().await = auth;
    }
}

/// The `Destination` name a `SubscriptionNode` registers under at `node`, so
/// callers can `unbind` it later without keeping the original handle around.
pub fn subscription_node_name(subscription_id: &str, source_node: &str) -> String {
    format!("__sub::{subscription_id}::{source_node}")
}

#[async_trait]
impl Destination for SubscriptionNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        if self.auth.lock().await.matches(&msg.topic) {
            self.subscription.add(msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn window_gates_delivery() {
        let sub = Subscription::new("s", Window::Finite(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;

        sub.add(Arc::new(Message::new("a"))).await;
        sub.add(Arc::new(Message::new("b"))).await;
        sub.add(Arc::new(Message::new("c"))).await;

        let delivered = drain(&mut rx).await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].seq, 1);
        assert_eq!(delivered[1].seq, 2);

        sub.ack(2, Some(Window::Finite(2))).await.unwrap();
        let delivered = drain(&mut rx).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].seq, 3);
    }

    #[tokio::test]
    async fn ack_out_of_range_fails() {
        let sub = Subscription::new("s", Window::Finite(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;
        sub.add(Arc::new(Message::new("a"))).await;

        assert!(sub.ack(5, None).await.is_err());
        assert!(sub.ack(0, None).await.is_ok());
    }

    #[tokio::test]
    async fn ack_equal_to_first_is_a_window_only_no_op() {
        let sub = Subscription::new("s", Window::Finite(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;
        sub.add(Arc::new(Message::new("a"))).await;
        drain(&mut rx).await;

        sub.ack(0, Some(Window::Finite(3))).await.unwrap();
        assert_eq!(sub.last_ack().await, 0);
    }

    #[tokio::test]
    async fn infinite_window_auto_acks_each_message() {
        let sub = Subscription::new("s", Window::Infinite);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;

        sub.add(Arc::new(Message::new("a"))).await;
        sub.add(Arc::new(Message::new("b"))).await;

        let delivered = drain(&mut rx).await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].seq, 1);
        assert_eq!(delivered[1].seq, 2);
        assert_eq!(sub.last_ack().await, 2);
    }

    #[tokio::test]
    async fn connect_resets_inflight_and_window_but_keeps_buffer_and_first() {
        let sub = Subscription::new("s", Window::Finite(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;

        sub.add(Arc::new(Message::new("a"))).await;
        sub.add(Arc::new(Message::new("b"))).await;
        sub.add(Arc::new(Message::new("c"))).await;
        drain(&mut rx).await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        sub.connect(tx2).await;
        assert_eq!(sub.last_ack().await, 0);
        assert!(drain(&mut rx2).await.is_empty());

        sub.ack(0, Some(Window::Finite(2))).await.unwrap();
        let delivered = drain(&mut rx2).await;
        assert_eq!(delivered.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn subscription_node_drops_messages_the_auth_matcher_rejects() {
        let sub = Arc::new(Subscription::new("s", Window::Infinite));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.set_deliver(tx).await;

        let node = SubscriptionNode::new(sub.clone(), "src", Matcher::single("foo/*").unwrap());
        node.send(Arc::new(Message::new("foo/bar"))).await;
        node.send(Arc::new(Message::new("baz"))).await;

        let delivered = drain(&mut rx).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message.topic, "foo/bar");
    }
}
