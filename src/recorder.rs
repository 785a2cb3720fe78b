//! Action recording.
//!
//! Plan functions don't execute actions themselves — they hand each action
//! to the executor effector and record what came back. The recorder is
//! a stack: every nested plan invocation pushes a scope-local frame that
//! still flattens into its parent on read, so a plan function calling
//! another plan function gets an isolated capture scope without losing
//! visibility of what the caller already recorded.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a single action against one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: String,
    pub target: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(action: impl Into<String>, target: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            exit_code: Some(0),
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(action: impl Into<String>, target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            exit_code: Some(1),
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A single capture frame in the recorder stack.
#[derive(Clone)]
pub struct Recorder {
    local: Arc<Mutex<Vec<ActionResult>>>,
    parent: Option<Arc<Recorder>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            local: Arc::new(Mutex::new(Vec::new())),
            parent: None,
        }
    }

    /// Push a new scope-local frame on top of this one. Actions recorded
    /// through the child are invisible to the parent until the child is
    /// read via `flatten`, at which point both frames are flattened
    /// together in recording order (parent first).
    pub fn push_scope(self: &Arc<Self>) -> Recorder {
        Recorder {
            local: Arc::new(Mutex::new(Vec::new())),
            parent: Some(self.clone()),
        }
    }

    pub fn record(&self, result: ActionResult) {
        self.local.lock().push(result);
    }

    /// Flatten this frame and every ancestor into one ordered list.
    pub fn flatten(&self) -> Vec<ActionResult> {
        let mut out = match &self.parent {
            Some(p) => p.flatten(),
            None => Vec::new(),
        };
        out.extend(self.local.lock().iter().cloned());
        out
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
