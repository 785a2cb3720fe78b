use crate::recorder::ActionResult;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

/// The error taxonomy of the reconciliation engine.
///
/// Every async boundary returns `(value, Option<FleetError>)` pairs rather
/// than propagating a panic across a channel send; the one exception is a
/// genuine Rust panic inside a plan function, which surfaces as a
/// `tokio::task::JoinError` and is folded into `FleetError::PlanCrash` by
/// the phase executor.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Malformed group-spec / options; raised before any effect.
    #[error("validation error: {0}")]
    Validation(String),

    /// Compute or executor effector failure, attached to the spec whose
    /// task raised it.
    #[error("provider error (group {group:?}): {source}")]
    Provider {
        group: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    /// A recognized plan failure (non-zero exit, condition unmet). Flows
    /// as data on the action result; does not halt the phase.
    #[error("domain error on target {target}: {message}")]
    Domain { target: String, message: String },

    /// An unexpected panic inside a plan function. Wraps whatever action
    /// results were already recorded for that target.
    #[error("plan crashed on target {target}: {source}")]
    PlanCrash {
        target: String,
        partial: Vec<ActionResult>,
        #[source]
        source: anyhow::Error,
    },

    /// Combination of multiple child errors from a parallel fan-out.
    /// Preserves every cause.
    #[error("{} aggregate error(s)", .0.len())]
    Aggregate(Vec<FleetError>),

    /// The operation's cancellation token was observed closed.
    #[error("operation cancelled")]
    Cancelled,

    /// A synchronous wait exceeded `timeout_ms`.
    #[error("operation timed out")]
    Timeout,
}

impl FleetError {
    pub fn provider<E: Into<anyhow::Error>>(group: Option<String>, source: E) -> Self {
        Self::Provider {
            group,
            source: source.into(),
        }
    }

    pub fn domain(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Domain {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn plan_crash(
        target: impl Into<String>,
        partial: Vec<ActionResult>,
        source: anyhow::Error,
    ) -> Self {
        Self::PlanCrash {
            target: target.into(),
            partial,
            source,
        }
    }

    /// Fold errors collected from a parallel fan-out into one, or `None`
    /// if every task succeeded.
    pub fn aggregate(mut errors: Vec<FleetError>) -> Option<FleetError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(FleetError::Aggregate(errors)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Cancelled)
    }
}
