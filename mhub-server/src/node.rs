//! Node types (§4.3): Exchange, Queue, HeaderStore, TopicStore and
//! ConsoleDestination, all built on the shared `BaseSource` binding fabric.
//!
//! Grounded on the teacher's `filter.rs`/`persistent_subscription.rs` for the
//! general "keep per-topic last message, replay on (re)subscribe" shape, and
//! on `persistent_storage.rs` for the init/load-at-startup pattern — adapted
//! here to the plain `Storage` sink from [`crate::storage`] instead of sled.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use mhub_core::error::{Error, Result};
use mhub_core::types::Message;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::base_source::BaseSource;
use crate::pattern::Matcher;
use crate::storage::Storage;

/// Anything a Source can broadcast a message to.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, msg: Arc<Message>);
}

const QUEUE_TYPE_ID: &str = "queue";
const HEADER_STORE_TYPE_ID: &str = "header-store";
const TOPIC_STORE_TYPE_ID: &str = "topic-store";
const SNAPSHOT_VERSION: u32 = 1;

/// Pure forwarder: `send` is exactly `broadcast`.
pub struct Exchange {
    name: String,
    base: BaseSource,
}

impl Exchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: BaseSource::new(),
        }
    }

    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) {
        self.base.bind(destination, pattern).await;
    }

    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        self.base.unbind(destination_name, pattern).await;
    }
}

#[async_trait]
impl Destination for Exchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        self.base.broadcast(&msg).await;
    }
}

/// Capacity-bounded ring buffer with optional topic filter and replay.
pub struct Queue {
    name: String,
    base: BaseSource,
    capacity: usize,
    filter: Matcher,
    buffer: Mutex<VecDeque<Arc<Message>>>,
    persistent: bool,
}

impl Queue {
    pub fn new(name: impl Into<String>, capacity: usize, pattern: Option<&str>) -> Self {
        let filter = pattern
            .map(|p| Matcher::single(p).unwrap_or_else(|_| Matcher::always()))
            .unwrap_or_else(Matcher::always);
        Self {
            name: name.into(),
            base: BaseSource::new(),
            capacity: capacity.max(1),
            filter,
            buffer: Mutex::new(VecDeque::new()),
            persistent: false,
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub async fn init(&self, storage: &dyn Storage) -> Result<()> {
        if !self.persistent {
            return Ok(());
        }
        let Some(snapshot) = storage.load(&self.name).await? else {
            return Ok(());
        };
        let (type_id, version, messages) = decode_snapshot(&snapshot)?;
        if type_id != QUEUE_TYPE_ID || version != SNAPSHOT_VERSION {
            tracing::warn!(node = %self.name, %type_id, version, "ignoring snapshot with mismatched type/version");
            return Ok(());
        }
        let mut buffer = self.buffer.lock().await;
        for m in messages {
            buffer.push_back(Arc::new(m));
        }
        Ok(())
    }

    pub async fn send(&self, msg: Arc<Message>, storage: Option<&dyn Storage>) -> Result<()> {
        self.base.broadcast(&msg).await;
        if self.filter.matches(&msg.topic) {
            let mut buffer = self.buffer.lock().await;
            buffer.push_back(msg);
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
            if self.persistent {
                if let Some(storage) = storage {
                    let snapshot = encode_snapshot(QUEUE_TYPE_ID, buffer.iter().map(|m| (**m).clone()));
                    storage
                        .save(&self.name, snapshot)
                        .await
                        .map_err(|e| Error::storage(format!("queue {} snapshot failed: {e}", self.name)))?;
                }
            }
        }
        Ok(())
    }

    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) {
        self.base.bind(destination.clone(), pattern).await;
        let replay_pattern = Matcher::single(pattern).unwrap_or_else(|_| Matcher::always());
        let buffered: Vec<Arc<Message>> = {
            let buffer = self.buffer.lock().await;
            buffer
                .iter()
                .filter(|m| replay_pattern.matches(&m.topic))
                .cloned()
                .collect()
        };
        for msg in buffered {
            destination.send(msg).await;
        }
    }

    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        self.base.unbind(destination_name, pattern).await;
    }
}

#[async_trait]
impl Destination for Queue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        let _ = Queue::send(self, msg, None).await;
    }
}

/// Last-message-per-topic store keyed on the boolean `keep` header.
pub struct HeaderStore {
    name: String,
    base: BaseSource,
    entries: Mutex<Vec<(String, Arc<Message>)>>,
    persistent: bool,
}

impl HeaderStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: BaseSource::new(),
            entries: Mutex::new(Vec::new()),
            persistent: false,
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub async fn init(&self, storage: &dyn Storage) -> Result<()> {
        if !self.persistent {
            return Ok(());
        }
        let Some(snapshot) = storage.load(&self.name).await? else {
            return Ok(());
        };
        let (type_id, version, messages) = decode_snapshot(&snapshot)?;
        if type_id != HEADER_STORE_TYPE_ID || version != SNAPSHOT_VERSION {
            tracing::warn!(node = %self.name, %type_id, version, "ignoring snapshot with mismatched type/version");
            return Ok(());
        }
        let mut entries = self.entries.lock().await;
        for m in messages {
            entries.push((m.topic.clone(), Arc::new(m)));
        }
        Ok(())
    }

    pub async fn send(&self, msg: Arc<Message>, storage: Option<&dyn Storage>) -> Result<()> {
        self.base.broadcast(&msg).await;
        match msg.header_bool("keep") {
            Some(true) => {
                let mut entries = self.entries.lock().await;
                entries.retain(|(topic, _)| topic != &msg.topic);
                entries.push((msg.topic.clone(), msg));
                if self.persistent {
                    self.persist(&entries, storage).await?;
                }
            }
            Some(false) => {
                let mut entries = self.entries.lock().await;
                entries.retain(|(topic, _)| topic != &msg.topic);
                if self.persistent {
                    self.persist(&entries, storage).await?;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn persist(
        &self,
        entries: &[(String, Arc<Message>)],
        storage: Option<&dyn Storage>,
    ) -> Result<()> {
        if let Some(storage) = storage {
            let snapshot =
                encode_snapshot(HEADER_STORE_TYPE_ID, entries.iter().map(|(_, m)| (**m).clone()));
            storage
                .save(&self.name, snapshot)
                .await
                .map_err(|e| Error::storage(format!("header store {} snapshot failed: {e}", self.name)))?;
        }
        Ok(())
    }

    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) {
        self.base.bind(destination.clone(), pattern).await;
        replay_matching(&self.entries, pattern, destination).await;
    }

    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        self.base.unbind(destination_name, pattern).await;
    }
}

#[async_trait]
impl Destination for HeaderStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        let _ = HeaderStore::send(self, msg, None).await;
    }
}

/// Last-message-per-topic store keyed on data presence.
pub struct TopicStore {
    name: String,
    base: BaseSource,
    entries: Mutex<Vec<(String, Arc<Message>)>>,
    persistent: bool,
}

impl TopicStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: BaseSource::new(),
            entries: Mutex::new(Vec::new()),
            persistent: false,
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub async fn init(&self, storage: &dyn Storage) -> Result<()> {
        if !self.persistent {
            return Ok(());
        }
        let Some(snapshot) = storage.load(&self.name).await? else {
            return Ok(());
        };
        let (type_id, version, messages) = decode_snapshot(&snapshot)?;
        if type_id != TOPIC_STORE_TYPE_ID || version != SNAPSHOT_VERSION {
            tracing::warn!(node = %self.name, %type_id, version, "ignoring snapshot with mismatched type/version");
            return Ok(());
        }
        let mut entries = self.entries.lock().await;
        for m in messages {
            entries.push((m.topic.clone(), Arc::new(m)));
        }
        Ok(())
    }

    pub async fn send(&self, msg: Arc<Message>, storage: Option<&dyn Storage>) -> Result<()> {
        self.base.broadcast(&msg).await;
        let mut entries = self.entries.lock().await;
        entries.retain(|(topic, _)| topic != &msg.topic);
        if msg.data.is_some() {
            entries.push((msg.topic.clone(), msg));
        }
        if self.persistent {
            if let Some(storage) = storage {
                let snapshot =
                    encode_snapshot(TOPIC_STORE_TYPE_ID, entries.iter().map(|(_, m)| (**m).clone()));
                storage
                    .save(&self.name, snapshot)
                    .await
                    .map_err(|e| Error::storage(format!("topic store {} snapshot failed: {e}", self.name)))?;
            }
        }
        Ok(())
    }

    pub async fn bind(&self, destination: Arc<dyn Destination>, pattern: &str) {
        self.base.bind(destination.clone(), pattern).await;
        replay_matching(&self.entries, pattern, destination).await;
    }

    pub async fn unbind(&self, destination_name: &str, pattern: Option<&str>) {
        self.base.unbind(destination_name, pattern).await;
    }
}

#[async_trait]
impl Destination for TopicStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        let _ = TopicStore::send(self, msg, None).await;
    }
}

/// Destination-only sink that logs a rendering of each message it receives.
pub struct ConsoleDestination {
    name: String,
}

impl ConsoleDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Destination for ConsoleDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, msg: Arc<Message>) {
        tracing::info!(
            node = %self.name,
            topic = %msg.topic,
            data = ?msg.data,
            "console destination received message"
        );
    }
}

async fn replay_matching(
    entries: &Mutex<Vec<(String, Arc<Message>)>>,
    pattern: &str,
    destination: Arc<dyn Destination>,
) {
    let replay_pattern = Matcher::single(pattern).unwrap_or_else(|_| Matcher::always());
    let matching: Vec<Arc<Message>> = {
        let entries = entries.lock().await;
        entries
            .iter()
            .filter(|(topic, _)| replay_pattern.matches(topic))
            .map(|(_, m)| m.clone())
            .collect()
    };
    for msg in matching {
        destination.send(msg).await;
    }
}

fn encode_snapshot(type_id: &str, messages: impl Iterator<Item = Message>) -> Value {
    json!({
        "type": type_id,
        "version": SNAPSHOT_VERSION,
        "messages": messages.collect::<Vec<_>>(),
    })
}

fn decode_snapshot(snapshot: &Value) -> Result<(String, u32, Vec<Message>)> {
    let type_id = snapshot
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let version = snapshot
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let messages = snapshot
        .get("messages")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::storage(format!("corrupt snapshot: {e}")))?
        .unwrap_or_default();
    Ok((type_id, version, messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        name: String,
        received: StdMutex<Vec<Message>>,
    }

    #[async_trait]
    impl Destination for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send(&self, msg: Arc<Message>) {
            self.received.lock().unwrap().push((*msg).clone());
        }
    }

    fn recorder(name: &str) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            received: StdMutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn queue_buffers_matching_messages_and_trims_to_capacity() {
        let queue = Queue::new("q", 2, None);
        for i in 0..3 {
            queue
                .send(Arc::new(Message::new(format!("t{i}"))), None)
                .await
                .unwrap();
        }
        let dest = recorder("d");
        queue.bind(dest.clone(), "").await;
        let received = dest.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].topic, "t1");
        assert_eq!(received[1].topic, "t2");
    }

    #[tokio::test]
    async fn queue_replay_filters_by_new_binding_pattern() {
        let queue = Queue::new("q", 10, None);
        queue.send(Arc::new(Message::new("/foo/bar")), None).await.unwrap();
        queue.send(Arc::new(Message::new("/baz")), None).await.unwrap();

        let dest = recorder("d");
        queue.bind(dest.clone(), "/foo/**").await;

        let received = dest.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, "/foo/bar");
    }

    #[tokio::test]
    async fn header_store_keep_true_moves_topic_to_tail() {
        let store = HeaderStore::new("h");
        let mut headers = mhub_core::types::Headers::new();
        headers.insert("keep".into(), mhub_core::types::HeaderValue::Bool(true));

        store
            .send(Arc::new(Message::new("a").with_headers(headers.clone())), None)
            .await
            .unwrap();
        store
            .send(Arc::new(Message::new("b").with_headers(headers.clone())), None)
            .await
            .unwrap();
        store
            .send(Arc::new(Message::new("a").with_headers(headers)), None)
            .await
            .unwrap();

        let dest = recorder("d");
        store.bind(dest.clone(), "").await;
        let received = dest.received.lock().unwrap();
        assert_eq!(
            received.iter().map(|m| m.topic.clone()).collect::<Vec<_>>(),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[tokio::test]
    async fn header_store_keep_false_removes_entry() {
        let store = HeaderStore::new("h");
        let mut keep = mhub_core::types::Headers::new();
        keep.insert("keep".into(), mhub_core::types::HeaderValue::Bool(true));
        let mut drop_hdr = mhub_core::types::Headers::new();
        drop_hdr.insert("keep".into(), mhub_core::types::HeaderValue::Bool(false));

        store.send(Arc::new(Message::new("a").with_headers(keep)), None).await.unwrap();
        store
            .send(Arc::new(Message::new("a").with_headers(drop_hdr)), None)
            .await
            .unwrap();

        let dest = recorder("d");
        store.bind(dest.clone(), "").await;
        assert!(dest.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn topic_store_replaces_last_message_and_deletes_on_absent_data() {
        let store = TopicStore::new("t");
        store
            .send(Arc::new(Message::new("a").with_data(json!(1))), None)
            .await
            .unwrap();
        store
            .send(Arc::new(Message::new("a").with_data(json!(2))), None)
            .await
            .unwrap();

        let dest = recorder("d");
        store.bind(dest.clone(), "").await;
        assert_eq!(dest.received.lock().unwrap().len(), 1);
        assert_eq!(dest.received.lock().unwrap()[0].data, Some(json!(2)));

        store.send(Arc::new(Message::new("a")), None).await.unwrap();
        let dest2 = recorder("d2");
        store.bind(dest2.clone(), "").await;
        assert!(dest2.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistent_queue_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let queue = Queue::new("q", 10, None).persistent(true);
        queue
            .send(Arc::new(Message::new("a")), Some(&storage))
            .await
            .unwrap();

        let reloaded = Queue::new("q", 10, None).persistent(true);
        reloaded.init(&storage).await.unwrap();

        let dest = recorder("d");
        reloaded.bind(dest.clone(), "").await;
        assert_eq!(dest.received.lock().unwrap().len(), 1);
    }
}
