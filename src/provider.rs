//! External effector contracts.
//!
//! The compute provider, the node capabilities it returns, and the action
//! executor are all opaque collaborators behind these traits — the
//! reconciliation engine never assumes a concrete transport, script
//! language, or cloud API.

use crate::node::NodeHandle;
use crate::recorder::ActionResult;
use crate::spec::NodeSpec;
use async_trait::async_trait;
use std::collections::HashMap;

/// The admin identity used for remote actions.
#[derive(Clone, Debug, Default)]
pub struct User {
    pub username: String,
    pub private_key_path: Option<String>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            private_key_path: None,
        }
    }
}

/// Provider metadata.
#[derive(Clone, Debug, Default)]
pub struct ServiceProperties {
    pub provider: String,
    pub extra: HashMap<String, String>,
}

/// What came back from a bulk destroy.
#[derive(Clone, Debug, Default)]
pub struct DestroyOutcome {
    pub destroyed_node_ids: Vec<String>,
    pub errors: Vec<String>,
}

/// The compute provider effector.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn nodes(&self) -> anyhow::Result<Vec<NodeHandle>>;

    async fn create_nodes(
        &self,
        node_spec: &NodeSpec,
        user: &User,
        count: u32,
        node_name: Option<&str>,
    ) -> anyhow::Result<Vec<NodeHandle>>;

    async fn destroy_nodes(&self, targets: &[NodeHandle]) -> anyhow::Result<DestroyOutcome>;

    fn service_properties(&self) -> ServiceProperties;
}

/// A single effect a plan function hands to the executor: a script to run
/// or a structured call, addressed at one target.
#[derive(Clone, Debug)]
pub struct Action {
    pub name: String,
    pub script: Option<String>,
    pub call: Option<serde_json::Value>,
}

impl Action {
    pub fn script(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Some(script.into()),
            call: None,
        }
    }

    pub fn call(name: impl Into<String>, call: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            script: None,
            call: Some(call),
        }
    }
}

/// The executor effector: SSH, local, or in-memory test
/// variants. Must report structured errors so the phase executor can
/// distinguish a domain error from a crash.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, target_id: &str, action: &Action) -> anyhow::Result<ActionResult>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use crate::node::testing::TestNode;
    use crate::node::{Node, GROUP_NAME_TAG};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// An in-memory compute provider for tests and downstream fixtures.
    pub struct InMemoryComputeProvider {
        nodes: Mutex<Vec<NodeHandle>>,
        next_id: Mutex<u64>,
    }

    impl InMemoryComputeProvider {
        pub fn new(seed: Vec<NodeHandle>) -> Self {
            let next_id = seed.len() as u64;
            Self {
                nodes: Mutex::new(seed),
                next_id: Mutex::new(next_id),
            }
        }

        pub fn empty() -> Self {
            Self::new(vec![])
        }
    }

    #[async_trait]
    impl ComputeProvider for InMemoryComputeProvider {
        async fn nodes(&self) -> anyhow::Result<Vec<NodeHandle>> {
            Ok(self.nodes.lock().clone())
        }

        async fn create_nodes(
            &self,
            node_spec: &NodeSpec,
            _user: &User,
            count: u32,
            node_name: Option<&str>,
        ) -> anyhow::Result<Vec<NodeHandle>> {
            let _ = node_spec;
            let mut created = Vec::new();
            let mut nodes = self.nodes.lock();
            let mut next_id = self.next_id.lock();
            for _ in 0..count {
                let id = format!("node-{}", *next_id);
                *next_id += 1;
                let base_name = node_name.unwrap_or("node").to_string();
                let test_node = TestNode::new(id, base_name.clone());
                if let Some(group_name) = node_name {
                    test_node.tags.lock().unwrap().insert(GROUP_NAME_TAG.to_string(), group_name.to_string());
                }
                let node: NodeHandle = Arc::new(test_node);
                nodes.push(node.clone());
                created.push(node);
            }
            Ok(created)
        }

        async fn destroy_nodes(&self, targets: &[NodeHandle]) -> anyhow::Result<DestroyOutcome> {
            let mut nodes = self.nodes.lock();
            let mut destroyed = Vec::new();
            for target in targets {
                let id = target.id().to_string();
                nodes.retain(|n| n.id() != id);
                destroyed.push(id);
            }
            Ok(DestroyOutcome {
                destroyed_node_ids: destroyed,
                errors: vec![],
            })
        }

        fn service_properties(&self) -> ServiceProperties {
            ServiceProperties {
                provider: "in-memory".to_string(),
                extra: HashMap::new(),
            }
        }
    }

    /// Tag a freshly created node with its group name, the way a real
    /// provider would.
    pub fn tag_with_group(node: &TestNode, group_name: &str) {
        node.tags
            .lock()
            .unwrap()
            .insert(GROUP_NAME_TAG.to_string(), group_name.to_string());
    }

    /// An executor that records every action it was asked to run and
    /// always succeeds.
    #[derive(Default)]
    pub struct LoggingExecutor {
        pub log: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Executor for LoggingExecutor {
        async fn execute(&self, target_id: &str, action: &Action) -> anyhow::Result<ActionResult> {
            self.log
                .lock()
                .push((target_id.to_string(), action.name.clone()));
            Ok(ActionResult::success(
                action.name.clone(),
                target_id.to_string(),
                "ok",
            ))
        }
    }

    /// An executor where a named action always fails with a domain error,
    /// for exercising failure paths.
    #[derive(Default)]
    pub struct FailingExecutor {
        pub failing_actions: Vec<String>,
    }

    impl FailingExecutor {
        pub fn new(failing_actions: impl IntoIterator<Item = impl Into<String>>) -> Self {
            Self {
                failing_actions: failing_actions.into_iter().map(Into::into).collect(),
            }
        }
    }

    #[async_trait]
    impl Executor for FailingExecutor {
        async fn execute(&self, target_id: &str, action: &Action) -> anyhow::Result<ActionResult> {
            if self.failing_actions.contains(&action.name) {
                Ok(ActionResult::failure(
                    action.name.clone(),
                    target_id.to_string(),
                    "simulated failure",
                ))
            } else {
                Ok(ActionResult::success(
                    action.name.clone(),
                    target_id.to_string(),
                    "ok",
                ))
            }
        }
    }
}
