//! Plan functions — the unit of work a phase dispatches to a target.
//!
//! A plan function describes actions without performing them; the executor
//! effector is what actually runs an action against a node.

use crate::session::Session;
use async_trait::async_trait;
use serde_json::Value;

/// What a plan function returns when it completes without panicking.
///
/// A domain error is represented as `Ok` with `outcome.error` set on the
/// target's action results — the phase executor inspects the recorded
/// actions for `:error` after every phase, so it does not require plan
/// functions to return `Err` for expected failures. `Err` here is reserved
/// for conditions the plan function itself cannot recover from but that
/// are not a Rust panic (e.g. a required setting missing from plan-state).
pub type PlanOutcome = anyhow::Result<Value>;

/// A named unit of configuration work, bound to a target's effective phase
/// map.
#[async_trait]
pub trait PlanFn: Send + Sync {
    async fn plan(&self, session: Session) -> PlanOutcome;
}

/// Adapts a plain async closure into a `PlanFn`, for building test doubles
/// and inline plan functions without a named struct per phase.
pub struct FnPlan<F>(pub F);

#[async_trait]
impl<F, Fut> PlanFn for FnPlan<F>
where
    F: Fn(Session) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = PlanOutcome> + Send,
{
    async fn plan(&self, session: Session) -> PlanOutcome {
        (self.0)(session).await
    }
}
