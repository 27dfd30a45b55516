//! Hub-level API tests: node registration, lookup and initialization.

use std::collections::HashMap;
use std::sync::Arc;

use mhub_core::error::Error;
use mhub_server::{Authenticator, Exchange, FileStorage, Hub, Node, Queue, RightsTable};

async fn test_hub() -> Hub {
    let dir = tempfile::tempdir().unwrap();
    Hub::new(
        Authenticator::default(),
        RightsTable::new(HashMap::new(), true),
        Arc::new(FileStorage::new(dir.path())),
    )
}

#[tokio::test]
async fn duplicate_node_name_is_rejected_as_fatal() {
    let hub = test_hub().await;
    hub.add_node(Node::Exchange(Arc::new(Exchange::new("a"))))
        .await
        .unwrap();

    let err = hub
        .add_node(Node::Queue(Arc::new(Queue::new("a", 10, None))))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)));
}

#[tokio::test]
async fn node_and_source_lookup_reflect_the_registry() {
    let hub = test_hub().await;
    assert!(hub.node("missing").await.is_none());
    assert!(hub.source("missing").await.is_none());

    hub.add_node(Node::Exchange(Arc::new(Exchange::new("x"))))
        .await
        .unwrap();
    assert!(hub.node("x").await.is_some());
    assert!(hub.source("x").await.is_some());

    let names = hub.node_names().await;
    assert_eq!(names, vec!["x".to_string()]);
}

#[tokio::test]
async fn console_destination_is_not_a_source() {
    let hub = test_hub().await;
    hub.add_node(Node::Console(Arc::new(mhub_server::ConsoleDestination::new("log"))))
        .await
        .unwrap();
    assert!(hub.node("log").await.is_some());
    assert!(hub.source("log").await.is_none());
}

#[tokio::test]
async fn initialize_is_idempotent_and_succeeds_with_no_persistent_nodes() {
    let hub = test_hub().await;
    hub.add_node(Node::Exchange(Arc::new(Exchange::new("x"))))
        .await
        .unwrap();
    hub.initialize().await.unwrap();
    hub.initialize().await.unwrap();
}
