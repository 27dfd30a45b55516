//! Authentication and authorization (§4.5).
//!
//! `Authenticator` is a plain in-memory username/password table. `RightsTable`
//! holds the per-user publish/subscribe configuration parsed from config; an
//! `Authorizer` is resolved from it once per login and then cached for the
//! lifetime of that connection, per §4.5 ("permission changes to the rights
//! table do not affect already-authorized sessions").
//!
//! Grounded on the teacher's `filter.rs` for the "compile patterns once,
//! match repeatedly" shape; the rights-resolution rules themselves have no
//! teacher analogue and are built directly from the table in §4.5, resolving
//! the default-allow/default-deny disagreement per §9's open question.

use std::collections::HashMap;

use mhub_core::error::{Error, PatternError, Result};
use mhub_core::types::PatternSpec;
use serde::{Deserialize, Serialize};

use crate::pattern::Matcher;

/// Verifies username/password pairs against an in-memory table. Usernames
/// that are empty or begin with `@` are rejected outright (`@` is reserved
/// for future group naming).
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || username.starts_with('@') {
            return false;
        }
        self.users.get(username).map(|p| p == password).unwrap_or(false)
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }
}

/// A `true`/`false`/per-node-pattern spec, as it appears under `rights.<user>.publish`
/// or `rights.<user>.subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessSpec {
    Allow(bool),
    PerNode(HashMap<String, NodeAccess>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeAccess {
    Allow(bool),
    Pattern(PatternSpec),
}

/// The rights entry for one user: `true` (allow everything), `false`/absent
/// (deny everything), or independent publish/subscribe specs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserRights {
    #[serde(default)]
    pub publish: Option<AccessSpec>,
    #[serde(default)]
    pub subscribe: Option<AccessSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RightsEntry {
    Allow(bool),
    PerKind(UserRights),
}

/// Rights keyed by username (empty string is the anonymous user).
#[derive(Debug, Clone, Default)]
pub struct RightsTable {
    entries: HashMap<String, RightsEntry>,
    /// True when the table was never configured at all (neither `users` nor
    /// `rights` present in config): default-allow-everything applies.
    unconfigured: bool,
}

impl RightsTable {
    pub fn new(entries: HashMap<String, RightsEntry>, unconfigured: bool) -> Self {
        Self { entries, unconfigured }
    }

    pub fn resolve(&self, username: &str) -> Result<Authorizer> {
        if self.unconfigured {
            return Ok(Authorizer::allow_all());
        }
        let entry = self.entries.get(username);
        Authorizer::from_entry(entry)
    }
}

/// Per-user resolved permissions, cached for the lifetime of a connection.
#[derive(Clone)]
pub struct Authorizer {
    publish: AccessResolution,
    subscribe: AccessResolution,
}

#[derive(Clone)]
enum AccessResolution {
    AllowAll,
    DenyAll,
    PerNode(HashMap<String, NodeResolution>),
}

#[derive(Clone)]
enum NodeResolution {
    Allow,
    Deny,
    Pattern(Matcher),
}

impl Authorizer {
    pub fn allow_all() -> Self {
        Self {
            publish: AccessResolution::AllowAll,
            subscribe: AccessResolution::AllowAll,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            publish: AccessResolution::DenyAll,
            subscribe: AccessResolution::DenyAll,
        }
    }

    fn from_entry(entry: Option<&RightsEntry>) -> Result<Self> {
        match entry {
            None => Ok(Self::deny_all()),
            Some(RightsEntry::Allow(true)) => Ok(Self::allow_all()),
            Some(RightsEntry::Allow(false)) => Ok(Self::deny_all()),
            Some(RightsEntry::PerKind(rights)) => Ok(Self {
                publish: resolve_access(rights.publish.as_ref())?,
                subscribe: resolve_access(rights.subscribe.as_ref())?,
            }),
        }
    }

    pub fn can_publish(&self, node: &str, topic: &str) -> bool {
        match &self.publish {
            AccessResolution::AllowAll => true,
            AccessResolution::DenyAll => false,
            AccessResolution::PerNode(map) => match map.get(node) {
                None => false,
                Some(NodeResolution::Allow) => true,
                Some(NodeResolution::Deny) => false,
                Some(NodeResolution::Pattern(m)) => m.matches(topic),
            },
        }
    }

    /// Returns `None` if subscribing to `node` is wholly denied, otherwise a
    /// matcher the caller ANDs with the client-supplied subscribe pattern.
    pub fn subscribe_matcher(&self, node: &str) -> Option<Matcher> {
        match &self.subscribe {
            AccessResolution::AllowAll => Some(Matcher::always()),
            AccessResolution::DenyAll => None,
            AccessResolution::PerNode(map) => match map.get(node) {
                None => None,
                Some(NodeResolution::Allow) => Some(Matcher::always()),
                Some(NodeResolution::Deny) => None,
                Some(NodeResolution::Pattern(m)) => Some(m.clone()),
            },
        }
    }
}

fn resolve_access(spec: Option<&AccessSpec>) -> Result<AccessResolution> {
    match spec {
        None => Ok(AccessResolution::DenyAll),
        Some(AccessSpec::Allow(true)) => Ok(AccessResolution::AllowAll),
        Some(AccessSpec::Allow(false)) => Ok(AccessResolution::DenyAll),
        Some(AccessSpec::PerNode(map)) => {
            let mut resolved = HashMap::with_capacity(map.len());
            for (node, access) in map {
                let node_resolution = match access {
                    NodeAccess::Allow(true) => NodeResolution::Allow,
                    NodeAccess::Allow(false) => NodeResolution::Deny,
                    NodeAccess::Pattern(spec) => NodeResolution::Pattern(
                        Matcher::compile(Some(spec)).map_err(pattern_err)?,
                    ),
                };
                resolved.insert(node.clone(), node_resolution);
            }
            Ok(AccessResolution::PerNode(resolved))
        }
    }
}

fn pattern_err(e: PatternError) -> Error {
    e.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticator_rejects_anonymous_and_reserved_names() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let auth = Authenticator::new(users);

        assert!(auth.authenticate("alice", "secret"));
        assert!(!auth.authenticate("alice", "wrong"));
        assert!(!auth.authenticate("", "anything"));
        assert!(!auth.authenticate("@group", "anything"));
    }

    #[test]
    fn unconfigured_table_defaults_to_allow_all() {
        let table = RightsTable::new(HashMap::new(), true);
        let authz = table.resolve("").unwrap();
        assert!(authz.can_publish("default", "anything"));
        assert!(authz.subscribe_matcher("default").unwrap().matches("anything"));
    }

    #[test]
    fn configured_table_with_no_entry_defaults_to_deny() {
        let table = RightsTable::new(HashMap::new(), false);
        let authz = table.resolve("bob").unwrap();
        assert!(!authz.can_publish("default", "anything"));
        assert!(authz.subscribe_matcher("default").is_none());
    }

    #[test]
    fn per_node_pattern_gates_publish_by_topic() {
        let mut per_node = HashMap::new();
        per_node.insert(
            "nodeA".to_string(),
            NodeAccess::Pattern(PatternSpec::Single("foo/*".to_string())),
        );
        let mut entries = HashMap::new();
        entries.insert(
            "carol".to_string(),
            RightsEntry::PerKind(UserRights {
                publish: Some(AccessSpec::PerNode(per_node)),
                subscribe: None,
            }),
        );
        let table = RightsTable::new(entries, false);
        let authz = table.resolve("carol").unwrap();

        assert!(authz.can_publish("nodeA", "foo/bar"));
        assert!(!authz.can_publish("nodeA", "baz"));
        assert!(!authz.can_publish("nodeB", "foo/bar"));
    }

    #[test]
    fn subscribe_denied_on_node_returns_none() {
        let mut per_node = HashMap::new();
        per_node.insert("nodeA".to_string(), NodeAccess::Allow(false));
        let mut entries = HashMap::new();
        entries.insert(
            "dave".to_string(),
            RightsEntry::PerKind(UserRights {
                publish: None,
                subscribe: Some(AccessSpec::PerNode(per_node)),
            }),
        );
        let table = RightsTable::new(entries, false);
        let authz = table.resolve("dave").unwrap();

        assert!(authz.subscribe_matcher("nodeA").is_none());
        assert!(authz.subscribe_matcher("nodeZ").is_none());
    }
}
