//! Binding fabric shared by every Source node type (§4.2).
//!
//! Grounded on the teacher's `filter.rs::FilteredSubscriptionManager` (a map
//! from subscriber to their pattern filters, broadcast by linear scan), but
//! reshaped around a `Vec` of bindings instead of a `HashMap` so that
//! broadcast order matches binding-insertion order as §5 requires, and
//! generalized from a single built-in wildcard syntax to the crate's own
//! `pattern::Matcher`.

use std::sync::Arc;

use mhub_core::types::Message;
use tokio::sync::Mutex;

use crate::pattern::CompiledPattern;
use crate::node::Destination;

struct Binding {
    destination: Arc<dyn Destination>,
    patterns: Vec<CompiledPattern>,
}

/// Maintains the set of (destination, patterns) bindings for one Source and
/// broadcasts messages to the destinations whose patterns match.
pub struct BaseSource {
    bindings: Mutex<Vec<Binding>>,
}

impl BaseSource {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Adds `pattern` (or the always-match pattern, if none given) to the
    /// binding for `destination`, creating the binding on first call. Adding
    /// a pattern already present on this binding is a no-op.
    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) {
        let compiled = CompiledPattern::compile(pattern)
            .unwrap_or_else(|_| CompiledPattern::compile("").expect("empty pattern always compiles"));
        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings
            .iter_mut()
            .find(|b| b.destination.name() == destination.name())
        {
            if !binding.patterns.iter().any(|p| p.as_str() == compiled.as_str()) {
                binding.patterns.push(compiled);
            }
        } else {
            bindings.push(Binding {
                destination,
                patterns: vec![compiled],
            });
        }
    }

    /// Removes `pattern` from the binding for `destination_name`; with no
    /// pattern, removes the whole binding. Drops the binding record entirely
    /// once its pattern set is empty.
    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        let mut bindings = self.bindings.lock().await;
        match pattern {
            None => bindings.retain(|b| b.destination.name() != destination_name),
            Some(pattern) => {
                if let Some(idx) = bindings
                    .iter()
                    .position(|b| b.destination.name() == destination_name)
                {
                    bindings[idx].patterns.retain(|p| p.as_str() != pattern);
                    if bindings[idx].patterns.is_empty() {
                        bindings.remove(idx);
                    }
                }
            }
        }
    }

    /// Delivers `message` to every destination with at least one matching
    /// pattern, exactly once per destination, in binding-insertion order. A
    /// destination's `send` is fire-and-forget: nothing here can make one
    /// destination's failure affect another's delivery, since `send` itself
    /// does not return a `Result`.
    pub async fn broadcast(&self, message: &Arc<Message>) {
        let targets: Vec<Arc<dyn Destination>> = {
            let bindings = self.bindings.lock().await;
            bindings
                .iter()
                .filter(|b| b.patterns.iter().any(|p| p.matches(&message.topic)))
                .map(|b| b.destination.clone())
                .collect()
        };
        for destination in targets {
            destination.send(message.clone()).await;
        }
    }

    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.len()
    }
}

impl Default for BaseSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct Recorder {
        name: String,
        received: TokioMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Destination for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send(&self, msg: Arc<Message>) {
            self.received.lock().await.push(msg.topic.clone());
        }
    }

    fn recorder(name: &str) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            received: TokioMutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn bind_is_idempotent_for_same_pattern() {
        let base = BaseSource::new();
        let dest = recorder("a");
        base.bind(dest.clone(), "foo").await;
        base.bind(dest.clone(), "foo").await;
        assert_eq!(base.binding_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_delivers_only_to_matching_destinations() {
        let base = BaseSource::new();
        let a = recorder("a");
        let b = recorder("b");
        base.bind(a.clone(), "foo").await;
        base.bind(b.clone(), "bar").await;

        base.broadcast(&Arc::new(Message::new("foo"))).await;

        assert_eq!(*a.received.lock().await, vec!["foo".to_string()]);
        assert!(b.received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unbind_without_pattern_removes_whole_binding() {
        let base = BaseSource::new();
        let a = recorder("a");
        base.bind(a.clone(), "foo").await;
        base.bind(a.clone(), "bar").await;
        base.unbind("a", None).await;
        assert_eq!(base.binding_count().await, 0);
    }

    #[tokio::test]
    async fn unbind_with_pattern_removes_only_that_pattern() {
        let base = BaseSource::new();
        let a = recorder("a");
        base.bind(a.clone(), "foo").await;
        base.bind(a.clone(), "bar").await;
        base.unbind("a", Some("foo")).await;

        base.broadcast(&Arc::new(Message::new("foo"))).await;
        base.broadcast(&Arc::new(Message::new("bar"))).await;

        assert_eq!(*a.received.lock().await, vec!["bar".to_string()]);
    }

    #[tokio::test]
    async fn each_destination_is_delivered_to_exactly_once() {
        let base = BaseSource::new();
        let a = recorder("a");
        base.bind(a.clone(), "foo").await;
        base.bind(a.clone(), "*").await;

        base.broadcast(&Arc::new(Message::new("foo"))).await;

        assert_eq!(*a.received.lock().await, vec!["foo".to_string()]);
    }
}
