//! Pattern filtering and window-gated delivery (§8 scenarios 2 and 3).

use std::collections::HashMap;
use std::sync::Arc;

use mhub_core::types::{Command, Response};
use mhub_server::{Authenticator, Exchange, FileStorage, Hub, HubClient, Node, RightsTable};
use tokio::sync::mpsc;

fn client(hub: Arc<Hub>) -> (HubClient, mpsc::UnboundedReceiver<Response>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HubClient::new(hub, tx), rx)
}

async fn test_hub() -> Arc<Hub> {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new(
        Authenticator::default(),
        RightsTable::new(HashMap::new(), true),
        Arc::new(FileStorage::new(dir.path())),
    );
    hub.add_node(Node::Exchange(Arc::new(Exchange::new("default"))))
        .await
        .unwrap();
    hub.initialize().await.unwrap();
    Arc::new(hub)
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Response>) -> Vec<Response> {
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    let mut out = Vec::new();
    while let Ok(r) = rx.try_recv() {
        out.push(r);
    }
    out
}

#[tokio::test]
async fn subscribe_pattern_filters_topics_to_matching_ones_only() {
    let hub = test_hub().await;
    let (subscriber, mut rx) = client(hub.clone());
    let (publisher, _) = client(hub);

    subscriber
        .process_command(Command::Subscribe {
            seq: Some(1),
            node: "default".into(),
            pattern: Some("/foo/**".into()),
            id: None,
        })
        .await;

    for topic in ["/foo/bar", "/baz", "/foo/x/y"] {
        publisher
            .process_command(Command::Publish {
                seq: None,
                node: "default".into(),
                topic: topic.into(),
                data: None,
                headers: None,
            })
            .await;
    }

    let delivered = drain(&mut rx).await;
    let topics: Vec<String> = delivered
        .into_iter()
        .map(|r| match r {
            Response::Message { topic, .. } => topic,
            other => panic!("unexpected response: {other:?}"),
        })
        .collect();
    assert_eq!(topics, vec!["/foo/bar".to_string(), "/foo/x/y".to_string()]);
}

#[tokio::test]
async fn window_of_two_gates_a_third_message_until_it_is_acked() {
    let hub = test_hub().await;
    let (subscriber, mut rx) = client(hub.clone());
    let (publisher, _) = client(hub);

    subscriber
        .process_command(Command::Subscribe {
            seq: Some(1),
            node: "default".into(),
            pattern: None,
            id: Some("w".into()),
        })
        .await;
    // Volatile sessions auto-ack with an infinite window by default; narrow
    // it to 2 to exercise the gate.
    subscriber
        .process_command(Command::Ack {
            seq: Some(2),
            id: "w".into(),
            ack: 0,
            window: Some(2),
        })
        .await;

    for i in 0..3 {
        publisher
            .process_command(Command::Publish {
                seq: None,
                node: "default".into(),
                topic: format!("t{i}"),
                data: None,
                headers: None,
            })
            .await;
    }

    let delivered = drain(&mut rx).await;
    assert_eq!(delivered.len(), 2);

    subscriber
        .process_command(Command::Ack {
            seq: Some(3),
            id: "w".into(),
            ack: 2,
            window: Some(2),
        })
        .await;

    let released = drain(&mut rx).await;
    assert_eq!(released.len(), 1);
    match &released[0] {
        Response::Message { topic, seq, .. } => {
            assert_eq!(topic, "t2");
            assert_eq!(*seq, 3);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}
