//! Authorization integration tests: the rights table gates publish/subscribe
//! per user and node (§4.5), and a denied node is indistinguishable from an
//! unknown one from the client's point of view (§8 scenario 5).

use std::collections::HashMap;
use std::sync::Arc;

use mhub_core::types::{Command, Response};
use mhub_server::{
    AccessSpec, Authenticator, Exchange, FileStorage, Hub, HubClient, Node, NodeAccess,
    RightsEntry, RightsTable, UserRights,
};
use tokio::sync::mpsc;

fn client(hub: Arc<Hub>) -> (HubClient, mpsc::UnboundedReceiver<Response>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HubClient::new(hub, tx), rx)
}

async fn hub_with_rights(rights: HashMap<String, RightsEntry>) -> Arc<Hub> {
    let dir = tempfile::tempdir().unwrap();
    let mut users = HashMap::new();
    users.insert("carol".to_string(), "secret".to_string());
    let hub = Hub::new(
        Authenticator::new(users),
        RightsTable::new(rights, false),
        Arc::new(FileStorage::new(dir.path())),
    );
    hub.add_node(Node::Exchange(Arc::new(Exchange::new("nodeA"))))
        .await
        .unwrap();
    hub.initialize().await.unwrap();
    Arc::new(hub)
}

async fn login(client: &HubClient) {
    let ack = client
        .process_command(Command::Login {
            seq: Some(1),
            username: "carol".into(),
            password: "secret".into(),
        })
        .await;
    assert!(matches!(ack, Some(Response::Loginack { .. })));
}

#[tokio::test]
async fn publish_denied_by_pattern_is_rejected_but_matching_topic_is_accepted() {
    let mut per_node = HashMap::new();
    per_node.insert(
        "nodeA".to_string(),
        NodeAccess::Pattern(mhub_core::types::PatternSpec::Single("foo/*".to_string())),
    );
    let mut rights = HashMap::new();
    rights.insert(
        "carol".to_string(),
        RightsEntry::PerKind(UserRights {
            publish: Some(AccessSpec::PerNode(per_node)),
            subscribe: Some(AccessSpec::Allow(true)),
        }),
    );
    let hub = hub_with_rights(rights).await;
    let (carol, _rx) = client(hub);
    login(&carol).await;

    let denied = carol
        .process_command(Command::Publish {
            seq: Some(2),
            node: "nodeA".into(),
            topic: "bar".into(),
            data: None,
            headers: None,
        })
        .await;
    match denied {
        Some(Response::Error { message, .. }) => assert_eq!(message, "permission denied"),
        other => panic!("unexpected response: {other:?}"),
    }

    let allowed = carol
        .process_command(Command::Publish {
            seq: Some(3),
            node: "nodeA".into(),
            topic: "foo/bar".into(),
            data: None,
            headers: None,
        })
        .await;
    assert!(matches!(allowed, Some(Response::Puback { seq: Some(3) })));
}

#[tokio::test]
async fn subscribing_to_a_denied_node_and_an_unknown_node_produce_identical_errors() {
    let mut per_node = HashMap::new();
    per_node.insert("nodeA".to_string(), NodeAccess::Allow(false));
    let mut rights = HashMap::new();
    rights.insert(
        "carol".to_string(),
        RightsEntry::PerKind(UserRights {
            publish: Some(AccessSpec::Allow(true)),
            subscribe: Some(AccessSpec::PerNode(per_node)),
        }),
    );
    let hub = hub_with_rights(rights).await;
    let (carol, _rx) = client(hub);
    login(&carol).await;

    let denied = carol
        .process_command(Command::Subscribe {
            seq: Some(2),
            node: "nodeA".into(),
            pattern: None,
            id: None,
        })
        .await;
    let unknown = carol
        .process_command(Command::Subscribe {
            seq: Some(3),
            node: "nodeZ".into(),
            pattern: None,
            id: None,
        })
        .await;

    match (denied, unknown) {
        (
            Some(Response::Error { message: m1, .. }),
            Some(Response::Error { message: m2, .. }),
        ) => assert_eq!(m1, m2),
        other => panic!("unexpected responses: {other:?}"),
    }
}

#[tokio::test]
async fn anonymous_connection_is_denied_when_rights_are_configured_but_empty() {
    let hub = hub_with_rights(HashMap::new()).await;
    let (anon, _rx) = client(hub);

    let resp = anon
        .process_command(Command::Publish {
            seq: Some(1),
            node: "nodeA".into(),
            topic: "anything".into(),
            data: None,
            headers: None,
        })
        .await;
    match resp {
        Some(Response::Error { message, .. }) => assert_eq!(message, "permission denied"),
        other => panic!("unexpected response: {other:?}"),
    }
}
