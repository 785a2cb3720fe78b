//! Node capabilities.
//!
//! Nodes are owned by the compute provider; the engine only ever holds a
//! borrowed, reference-counted handle.

use std::sync::Arc;

/// The reserved tag key the default node-filter relies on. Its value is
/// the bare group name. Providers that can't tag nodes must instead encode
/// the group name in the node's base-name.
pub const GROUP_NAME_TAG: &str = "/pallet/group-name";

/// A live (or about-to-exist) compute node, as reported by a
/// `ComputeProvider`.
pub trait Node: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;
    fn base_name(&self) -> &str;
    fn primary_ip(&self) -> Option<String>;
    fn taggable(&self) -> bool;
    fn tag(&self, key: &str) -> Option<String>;
    fn compute_service(&self) -> &str;

    fn has_base_name(&self, name: &str) -> bool {
        self.base_name() == name
    }
}

/// Borrowed handle to a node; cheap to clone, shared across targets.
pub type NodeHandle = Arc<dyn Node>;

/// The default node-filter: a node belongs to a group if it carries the
/// group-name tag, falling back to a base-name match when the provider
/// can't tag nodes at all.
pub fn default_node_filter(node: &dyn Node, group_name: &str) -> bool {
    if node.taggable() {
        node.tag(GROUP_NAME_TAG).as_deref() == Some(group_name)
    } else {
        node.has_base_name(group_name)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory node used by tests and by `provider::testing`.
    #[derive(Debug)]
    pub struct TestNode {
        pub id: String,
        pub base_name: String,
        pub taggable: bool,
        pub tags: Mutex<HashMap<String, String>>,
    }

    impl TestNode {
        pub fn new(id: impl Into<String>, base_name: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                base_name: base_name.into(),
                taggable: true,
                tags: Mutex::new(HashMap::new()),
            }
        }

        pub fn untaggable(id: impl Into<String>, base_name: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                base_name: base_name.into(),
                taggable: false,
                tags: Mutex::new(HashMap::new()),
            }
        }

        pub fn with_tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.tags.lock().unwrap().insert(key.into(), value.into());
            self
        }
    }

    impl Node for TestNode {
        fn id(&self) -> &str {
            &self.id
        }

        fn base_name(&self) -> &str {
            &self.base_name
        }

        fn primary_ip(&self) -> Option<String> {
            None
        }

        fn taggable(&self) -> bool {
            self.taggable
        }

        fn tag(&self, key: &str) -> Option<String> {
            self.tags.lock().unwrap().get(key).cloned()
        }

        fn compute_service(&self) -> &str {
            "test"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestNode;
    use super::*;

    #[test]
    fn taggable_node_matches_by_tag() {
        let node = TestNode::new("n1", "web-abc").with_tag(GROUP_NAME_TAG, "web");
        assert!(default_node_filter(&node, "web"));
        assert!(!default_node_filter(&node, "db"));
    }

    #[test]
    fn untaggable_node_falls_back_to_base_name() {
        let node = TestNode::untaggable("n1", "web");
        assert!(default_node_filter(&node, "web"));
        assert!(!default_node_filter(&node, "db"));
    }
}
