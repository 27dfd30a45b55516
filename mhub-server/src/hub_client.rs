//! The protocol state machine (§4.9): validates, authorizes and executes a
//! decoded [`Command`] against a [`Hub`], producing at most one [`Response`].
//!
//! Grounded on the teacher's `connection.rs::process_request`/`handle_message`
//! dispatch-by-`type` shape and `router.rs`'s "resolve a handler, invoke,
//! convert errors to a uniform response" pattern, generalized from the
//! teacher's open method registry (arbitrary JSON-RPC method names via
//! `Router::register`) to MHub's fixed, closed command table — every command
//! in §4.9 is a dispatch arm here, not a looked-up handler.

use std::sync::Arc;

use mhub_core::error::{Error, Result};
use mhub_core::types::{Command, Message, PatternSpec, Response};

use crate::auth::Authorizer;
use crate::hub::Hub;
use crate::pattern::Matcher;
use crate::session::{ResponseSink, Session};
use crate::subscription::{Subscription, Window};

/// One connection's view of the hub: at most one logged-in username, at most
/// one resolved [`Authorizer`] (cached for the connection's lifetime per
/// §4.5), and at most one attached [`Session`].
///
/// `responses` is the same outbound channel the owning transport drains to
/// the wire; it is also handed to [`Session::attach`] so that subscription
/// deliveries and direct command responses interleave on one ordered stream.
pub struct HubClient {
    hub: Arc<Hub>,
    responses: ResponseSink,
    username: tokio::sync::Mutex<Option<String>>,
    authorizer: tokio::sync::Mutex<Option<Authorizer>>,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl HubClient {
    pub fn new(hub: Arc<Hub>, responses: ResponseSink) -> Self {
        Self {
            hub,
            responses,
            username: tokio::sync::Mutex::new(None),
            authorizer: tokio::sync::Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Validates, authorizes and executes `cmd`, converting any failure into
    /// an `error` response carrying the command's original `seq` (§7). A
    /// command that the protocol defines as producing no reply (`ack`) yields
    /// `None` on success.
    #[tracing::instrument(skip(self, cmd), fields(command = command_name(&cmd)))]
    pub async fn process_command(&self, cmd: Command) -> Option<Response> {
        let seq = cmd.seq();
        match self.dispatch(cmd).await {
            Ok(response) => response,
            Err(e) => Some(Response::error(seq, e.wire_message())),
        }
    }

    /// Called when the underlying transport's socket closes. Detaches the
    /// attached session, if any; a `Volatile` session is torn down entirely
    /// (its subscriptions unbound from every source node), while a `Memory`
    /// session simply goes quiet until a future connection reattaches it.
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.detach().await;
            if session.is_volatile() {
                let teardowns = session.destroy().await;
                for teardown in &teardowns {
                    self.unbind_teardown(teardown).await;
                }
            }
        }
    }

    async fn dispatch(&self, cmd: Command) -> Result<Option<Response>> {
        match cmd {
            Command::Login { seq, username, password } => self.handle_login(seq, username, password).await,
            Command::Session { seq, name, subscriptions } => self.handle_session(seq, name, subscriptions).await,
            Command::Subscription { seq, id, bindings } => self.handle_subscription(seq, id, bindings).await,
            Command::Subscribe { seq, node, pattern, id } => self.handle_subscribe(seq, node, pattern, id).await,
            Command::Unsubscribe { seq, node, pattern, id } => self.handle_unsubscribe(seq, node, pattern, id).await,
            Command::Publish { seq, node, topic, data, headers } => {
                self.handle_publish(seq, node, topic, data, headers).await
            }
            Command::Ack { seq, id, ack, window } => self.handle_ack(seq, id, ack, window).await,
            Command::Ping { seq } => Ok(Some(Response::Pingack { seq })),
        }
    }

    async fn handle_login(&self, seq: Option<u32>, username: String, password: String) -> Result<Option<Response>> {
        if self.username.lock().await.is_some() {
            return Err(Error::invalid_state("already logged in"));
        }
        if !self.hub.authenticate(&username, &password) {
            return Err(Error::PermissionDenied);
        }
        let authorizer = self.hub.authorizer_for(&username)?;
        *self.username.lock().await = Some(username);
        *self.authorizer.lock().await = Some(authorizer);
        Ok(Some(Response::Loginack { seq }))
    }

    async fn handle_session(
        &self,
        seq: Option<u32>,
        name: String,
        subscriptions: Option<Vec<String>>,
    ) -> Result<Option<Response>> {
        let username = self
            .username
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("not logged in"))?;
        {
            let current = self.session.lock().await;
            if current.is_some() {
                return Err(Error::invalid_state("session already attached"));
            }
        }

        let session = self.hub.get_or_create_session(&username, &name).await;
        if let Some(ids) = subscriptions {
            let teardowns = session.set_subscriptions(&ids).await;
            for teardown in &teardowns {
                self.unbind_teardown(teardown).await;
            }
        }
        session.attach(self.responses.clone()).await;
        *self.session.lock().await = Some(session);
        Ok(Some(Response::Sessionack { seq }))
    }

    async fn handle_subscription(
        &self,
        seq: Option<u32>,
        id: String,
        bindings: Option<std::collections::HashMap<String, PatternSpec>>,
    ) -> Result<Option<Response>> {
        let session = self.require_session().await?;
        let subscription = session.get_or_create_subscription(&id).await;
        let had_bindings = bindings.is_some();
        if let Some(spec) = bindings {
            self.apply_bindings(&subscription, spec).await?;
        }

        let last_ack = subscription.last_ack().await;
        let response_bindings = if had_bindings {
            None
        } else {
            Some(subscription.bindings().await)
        };
        Ok(Some(Response::Subscriptionack {
            seq,
            last_ack,
            bindings: response_bindings,
        }))
    }

    async fn handle_subscribe(
        &self,
        seq: Option<u32>,
        node: String,
        pattern: Option<String>,
        id: Option<String>,
    ) -> Result<Option<Response>> {
        let authorizer = self.authorizer().await?;
        let subscribe_matcher = authorizer.subscribe_matcher(&node).ok_or(Error::PermissionDenied)?;
        let source = self.hub.source(&node).await.ok_or(Error::NotFound)?;

        let session = self.ensure_session().await;
        let sub_id = id.unwrap_or_else(|| "default".to_string());
        let subscription = session.get_or_create_subscription(&sub_id).await;

        let pattern = pattern.unwrap_or_default();
        let mut patterns = subscription
            .bindings()
            .await
            .get(&node)
            .cloned()
            .unwrap_or_default();
        if !patterns.iter().any(|p| p == &pattern) {
            patterns.push(pattern.clone());
        }

        let dest = subscription.node_destination(&node).await;
        dest.set_auth(rebuild_auth(&subscribe_matcher, &patterns)?).await;
        source.bind(dest, &pattern).await?;
        subscription.record_bind(&node, &pattern).await;

        Ok(Some(Response::Suback { seq }))
    }

    async fn handle_unsubscribe(
        &self,
        seq: Option<u32>,
        node: String,
        pattern: Option<String>,
        id: Option<String>,
    ) -> Result<Option<Response>> {
        let authorizer = self.authorizer().await?;
        authorizer.subscribe_matcher(&node).ok_or(Error::PermissionDenied)?;
        let source = self.hub.source(&node).await.ok_or(Error::NotFound)?;

        let session = self.ensure_session().await;
        let sub_id = id.unwrap_or_else(|| "default".to_string());
        let subscription = session.get_or_create_subscription(&sub_id).await;

        let dest_name = crate::subscription::subscription_node_name(subscription.id(), &node);
        source.unbind(&dest_name, pattern.as_deref()).await;
        subscription.record_unbind(&node, pattern.as_deref()).await;

        Ok(Some(Response::Unsuback { seq }))
    }

    async fn handle_publish(
        &self,
        seq: Option<u32>,
        node: String,
        topic: String,
        data: Option<serde_json::Value>,
        headers: Option<mhub_core::types::Headers>,
    ) -> Result<Option<Response>> {
        let authorizer = self.authorizer().await?;
        if !authorizer.can_publish(&node, &topic) {
            return Err(Error::PermissionDenied);
        }
        let target = self.hub.node(&node).await.ok_or(Error::NotFound)?;

        let message = Message {
            topic,
            data,
            headers: headers.unwrap_or_default(),
        };
        message.validate()?;

        target.publish(Arc::new(message), self.hub.storage().as_ref()).await?;
        Ok(Some(Response::Puback { seq }))
    }

    async fn handle_ack(
        &self,
        _seq: Option<u32>,
        id: String,
        ack: u64,
        window: Option<u64>,
    ) -> Result<Option<Response>> {
        let session = self.require_session().await?;
        let subscription = session
            .subscription(&id)
            .await
            .ok_or_else(|| Error::invalid_state(format!("no such subscription: {id}")))?;
        subscription.ack(ack, window.map(Window::Finite)).await?;
        Ok(None)
    }

    /// Resolves (and caches) this connection's [`Authorizer`]: either the one
    /// bound at `login`, or — for a client that never logged in — the
    /// anonymous user's, resolved lazily on first subscribe/publish and
    /// cached from then on, per §4.5's "resolved once ... at
    /// login/anonymous-attach".
    async fn authorizer(&self) -> Result<Authorizer> {
        let mut guard = self.authorizer.lock().await;
        if let Some(authorizer) = guard.as_ref() {
            return Ok(authorizer.clone());
        }
        let username = self.username.lock().await.clone().unwrap_or_default();
        let authorizer = self.hub.authorizer_for(&username)?;
        *guard = Some(authorizer.clone());
        Ok(authorizer)
    }

    async fn require_session(&self) -> Result<Arc<Session>> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("no session"))
    }

    /// Returns the attached session, auto-creating a `Volatile` one (under
    /// the connection's current username, or anonymous) if the client has
    /// none — the auto-session behavior `subscribe`/`unsubscribe` get without
    /// a prior `session` command.
    async fn ensure_session(&self) -> Arc<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return session.clone();
        }
        let username = self.username.lock().await.clone().unwrap_or_default();
        let session = self.hub.new_volatile_session(&username);
        session.attach(self.responses.clone()).await;
        *guard = Some(session.clone());
        session
    }

    /// Reconciles a `subscription` command's full `bindings` map against the
    /// subscription's current per-node pattern sets: sources dropped from the
    /// map are unbound entirely; sources kept have their pattern sets diffed
    /// and the additions/removals applied individually, matching §4.7's
    /// `setBindings`.
    async fn apply_bindings(
        &self,
        subscription: &Arc<Subscription>,
        spec: std::collections::HashMap<String, PatternSpec>,
    ) -> Result<()> {
        let authorizer = self.authorizer().await?;
        let current = subscription.bindings().await;

        for node_name in current.keys() {
            if !spec.contains_key(node_name) {
                if let Some(node) = self.hub.node(node_name).await {
                    let dest_name = crate::subscription::subscription_node_name(subscription.id(), node_name);
                    node.unbind(&dest_name, None).await;
                }
                subscription.record_unbind(node_name, None).await;
            }
        }

        for (node_name, pattern_spec) in spec {
            let subscribe_matcher = authorizer.subscribe_matcher(&node_name).ok_or(Error::PermissionDenied)?;
            let node = self.hub.source(&node_name).await.ok_or(Error::NotFound)?;

            let existing = current.get(&node_name).cloned().unwrap_or_default();
            let wanted = pattern_spec.patterns();

            for pattern in &existing {
                if !wanted.contains(pattern) {
                    node.unbind(
                        &crate::subscription::subscription_node_name(subscription.id(), &node_name),
                        Some(pattern),
                    )
                    .await;
                    subscription.record_unbind(&node_name, Some(pattern)).await;
                }
            }

            let dest = subscription.node_destination(&node_name).await;
            dest.set_auth(rebuild_auth(&subscribe_matcher, &wanted)?).await;
            for pattern in &wanted {
                if !existing.contains(pattern) {
                    node.bind(dest.clone(), pattern).await?;
                    subscription.record_bind(&node_name, pattern).await;
                }
            }
        }

        Ok(())
    }

    async fn unbind_teardown(&self, teardown: &crate::session::Teardown) {
        for node_name in &teardown.bound_nodes {
            if let Some(node) = self.hub.node(node_name).await {
                let dest_name =
                    crate::subscription::subscription_node_name(teardown.subscription.id(), node_name);
                node.unbind(&dest_name, None).await;
            }
        }
    }
}

/// Builds the AND of a rights-table subscribe matcher with the union of
/// every client-supplied pattern currently bound for one (subscription,
/// source) pair, per §4.5's "ANDs the user's subscribe pattern ... with the
/// client-supplied subscription pattern".
fn rebuild_auth(subscribe_matcher: &Matcher, patterns: &[String]) -> Result<Matcher> {
    let spec = PatternSpec::Many(patterns.to_vec());
    let client_matcher = Matcher::compile(Some(&spec))?;
    Ok(subscribe_matcher.clone().and(client_matcher))
}

fn command_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Login { .. } => "login",
        Command::Session { .. } => "session",
        Command::Subscription { .. } => "subscription",
        Command::Subscribe { .. } => "subscribe",
        Command::Unsubscribe { .. } => "unsubscribe",
        Command::Publish { .. } => "publish",
        Command::Ack { .. } => "ack",
        Command::Ping { .. } => "ping",
    }
}
