//! Plan-state and the per-operation session.
//!
//! The session is treated as immutable; every layer that needs a
//! specialized view produces a new value rather than mutating a shared one.
//! Plan-state is the one piece of genuinely shared, mutable state, and it
//! is guarded by a single `parking_lot::Mutex` — a guarded cell.

use crate::provider::{Executor, User};
use crate::recorder::Recorder;
use crate::spec::Target;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A scope tuple for plan-state facts.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ScopeKey {
    pub universe: Option<String>,
    pub provider: Option<String>,
    pub service: Option<String>,
    pub host: Option<String>,
    pub group: Option<String>,
}

impl ScopeKey {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn for_group(group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Default::default()
        }
    }

    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }
}

/// Scoped key/value store of facts shared across phases. Lifetime is one
/// operation; optionally seeded by the caller via `OperationOptions`.
#[derive(Clone, Default)]
pub struct PlanState {
    facts: Arc<Mutex<HashMap<ScopeKey, serde_json::Value>>>,
}

impl PlanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(seed: HashMap<ScopeKey, serde_json::Value>) -> Self {
        Self {
            facts: Arc::new(Mutex::new(seed)),
        }
    }

    pub fn get(&self, key: &ScopeKey) -> Option<serde_json::Value> {
        self.facts.lock().get(key).cloned()
    }

    pub fn put(&self, key: ScopeKey, value: serde_json::Value) {
        self.facts.lock().insert(key, value);
    }
}

/// Per-operation context: the executor, the plan-state, the recorder
/// stack, the user identity, and (when addressing one target) the current
/// target.
#[derive(Clone)]
pub struct Session {
    pub executor: Arc<dyn Executor>,
    pub plan_state: PlanState,
    pub recorder: Arc<Recorder>,
    pub user: User,
    pub current_target: Option<Arc<Target>>,
}

impl Session {
    pub fn new(executor: Arc<dyn Executor>, user: User) -> Self {
        Self {
            executor,
            plan_state: PlanState::new(),
            recorder: Arc::new(Recorder::new()),
            user,
            current_target: None,
        }
    }

    /// Non-destructive overlay: bind a target and push a fresh recorder
    /// scope, returning a new session. The parent's recorder is still
    /// reachable through the child's `flatten()`.
    pub fn for_target(&self, target: Arc<Target>) -> Session {
        Session {
            executor: self.executor.clone(),
            plan_state: self.plan_state.clone(),
            recorder: Arc::new(self.recorder.push_scope()),
            user: self.user.clone(),
            current_target: Some(target),
        }
    }

    /// A nested capture scope for a plan function that itself invokes
    /// another plan function.
    pub fn nested_scope(&self) -> Session {
        Session {
            recorder: Arc::new(self.recorder.push_scope()),
            ..self.clone()
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl Session {
    /// Convenience constructor for unit tests that don't care about the
    /// executor or identity.
    pub fn root_for_test() -> Session {
        use crate::provider::testing::LoggingExecutor;
        Session::new(Arc::new(LoggingExecutor::default()), User::new("test"))
    }
}
