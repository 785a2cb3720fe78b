/*
 * fleetforge - declarative node-fleet reconciliation engine
 *
 * Drives a live set of compute nodes toward a declared group topology:
 * resolves which nodes belong to which group, computes the delta between
 * actual and desired counts, provisions or destroys nodes to close it, and
 * runs phased configuration work across the result.
 *
 * Architecture:
 * - Spec composition (`:extends` chains, cluster expansion, environment
 *   overlays)
 * - Target resolution (node -> group membership)
 * - Delta calculation and node-count adjustment
 * - Phase executor (per-target concurrency, partitioned)
 * - Operation driver (the converge/lift entry points)
 */

pub mod adjuster;
pub mod delta;
pub mod error;
pub mod node;
pub mod operation;
pub mod phase;
pub mod plan;
pub mod provider;
pub mod recorder;
pub mod session;
pub mod spec;
pub mod target;

pub use error::{FleetError, Result};
pub use node::{Node, NodeHandle, GROUP_NAME_TAG};
pub use operation::{converge, converge_async, converge_sync, lift, OperationHandle, OperationOptions, OperationResult};
pub use phase::{PhaseOutcome, PhaseResult, PostPhaseFn};
pub use plan::{FnPlan, PlanFn, PlanOutcome};
pub use provider::{Action, ComputeProvider, DestroyOutcome, Executor, ServiceProperties, User};
pub use recorder::{ActionResult, Recorder};
pub use session::{PlanState, ScopeKey, Session};
pub use spec::{
    ClusterSpec, Environment, GroupDelta, GroupOverlay, GroupSpec, NodeFilter, NodeSpec, PhaseEntry,
    PhaseMap, PhaseMeta, PhaseName, PhaseRef, RemovalSelectionFn, ServerSpec, Target, TargetType,
};
