//! The operation driver.
//!
//! Owns the end-to-end sequence for `converge` (resolve targets, compute
//! deltas, adjust node count, run the caller's phases) and the simpler
//! `lift` (run `[:settings]` then the caller's phases over an already-known
//! target set). Both are exposed synchronously (blocking until done or a
//! timeout elapses) and asynchronously (a pollable/cancellable handle).

use crate::delta::{self, Deltas};
use crate::error::{FleetError, Result};
use crate::node::NodeHandle;
use crate::phase::{self, default_partition, PartitionFn, PhaseResult, PostPhaseFn};
use crate::provider::{ComputeProvider, Executor, User};
use crate::recorder::Recorder;
use crate::session::{PlanState, ScopeKey, Session};
use crate::spec::{merge_phase_maps, GroupSpec, PhaseEntry, PhaseMap, PhaseMeta, PhaseName, PhaseRef, Target};
use crate::target;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// The closed option schema for an operation.
/// Constructed only through `OperationOptions::new`/builder methods so an
/// unrecognized key can never slip through — there is no open map here to
/// begin with.
#[derive(Clone)]
pub struct OperationOptions {
    pub compute: Arc<dyn ComputeProvider>,
    pub executor: Arc<dyn Executor>,
    pub user: User,
    pub environment: Option<crate::spec::Environment>,
    pub plan_state_seed: HashMap<ScopeKey, serde_json::Value>,
    pub partition_f: PartitionFn,
    pub timeout: Option<Duration>,
    /// `timeout-val` (spec.md §4.6 "Async semantics", §6): returned instead
    /// of `FleetError::Timeout` when `timeout` elapses, if supplied.
    pub timeout_val: Option<OperationResult>,
    /// Default true. Injects the OS-detection phases ahead of `:settings`/
    /// `:bootstrap` in `converge`, per spec.md §4.6 step 10. A target with
    /// no plan function bound to either phase simply reports `Skipped`.
    pub os_detect: bool,
    /// Extra groups whose resolved targets are folded into the live target
    /// set but excluded from delta computation — they receive only
    /// `:settings`, never creation/destruction/`:bootstrap` (spec.md §6,
    /// `all-node-set`).
    pub all_node_set: Vec<GroupSpec>,
    /// Caller-supplied `(group-spec, nodes)` pairs that bypass filter
    /// matching entirely — `split-groups-and-targets` (spec.md §4.6 step 5).
    /// Materialized directly into targets via `target::materialize_raw_targets`,
    /// folded into the live target set, and — like `all_node_set` — excluded
    /// from delta computation, receiving only `:settings`.
    pub raw_target_sets: Vec<(GroupSpec, Vec<NodeHandle>)>,
    /// `post-phase-f` (spec.md §4.5 item 5, §6): runs after each phase for
    /// side effects; its return value is discarded.
    pub post_phase_f: Option<PostPhaseFn>,
    /// `post-phase-fsm` (spec.md §4.5 item 5, §6): a second, independent
    /// post-phase hook, run the same way as `post_phase_f`.
    pub post_phase_fsm: Option<PostPhaseFn>,
}

/// OS-detection bootstrap phase: runs before configuration phases proper to
/// establish which OS family a node runs, per spec.md §4.6 step 10.
pub fn os_detect_bootstrap_phase() -> PhaseName {
    PhaseName::new("pallet/os-bs")
}

/// OS-detection phase: the main OS-identification pass.
pub fn os_detect_phase() -> PhaseName {
    PhaseName::new("pallet/os")
}

impl OperationOptions {
    pub fn new(compute: Arc<dyn ComputeProvider>, executor: Arc<dyn Executor>, user: User) -> Self {
        Self {
            compute,
            executor,
            user,
            environment: None,
            plan_state_seed: HashMap::new(),
            partition_f: default_partition(),
            timeout: None,
            timeout_val: None,
            os_detect: true,
            all_node_set: Vec::new(),
            raw_target_sets: Vec::new(),
            post_phase_f: None,
            post_phase_fsm: None,
        }
    }

    pub fn with_environment(mut self, environment: crate::spec::Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_val(mut self, timeout_val: OperationResult) -> Self {
        self.timeout_val = Some(timeout_val);
        self
    }

    pub fn with_partition(mut self, partition_f: PartitionFn) -> Self {
        self.partition_f = partition_f;
        self
    }

    pub fn with_os_detect(mut self, os_detect: bool) -> Self {
        self.os_detect = os_detect;
        self
    }

    pub fn with_all_node_set(mut self, groups: Vec<GroupSpec>) -> Self {
        self.all_node_set = groups;
        self
    }

    pub fn with_raw_target_sets(mut self, raw_target_sets: Vec<(GroupSpec, Vec<NodeHandle>)>) -> Self {
        self.raw_target_sets = raw_target_sets;
        self
    }

    pub fn with_post_phase_f(mut self, post_phase_f: PostPhaseFn) -> Self {
        self.post_phase_f = Some(post_phase_f);
        self
    }

    pub fn with_post_phase_fsm(mut self, post_phase_fsm: PostPhaseFn) -> Self {
        self.post_phase_fsm = Some(post_phase_fsm);
        self
    }
}

/// Everything an operation produced.
///
/// `started_at`/`completed_at` are wall-clock bookkeeping only — the
/// reconciliation engine itself never branches on them. They exist so
/// callers building their own dashboards know how long an operation took.
#[derive(Clone, Default)]
pub struct OperationResult {
    pub results: Vec<PhaseResult>,
    pub targets: Vec<Arc<Target>>,
    pub deltas: Option<Deltas>,
    pub old_node_ids: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn apply_environment(groups: Vec<GroupSpec>, environment: Option<&crate::spec::Environment>) -> Vec<GroupSpec> {
    match environment {
        Some(env) => groups.iter().map(|g| env.overlay(g)).collect(),
        None => groups,
    }
}

fn build_session(options: &OperationOptions) -> Session {
    Session {
        executor: options.executor.clone(),
        plan_state: PlanState::seeded(options.plan_state_seed.clone()),
        recorder: Arc::new(Recorder::new()),
        user: options.user.clone(),
        current_target: None,
    }
}

/// Splits a caller's phase list into bare name references and inline plan
/// functions, gensym'ing a fresh name for each inline entry and registering
/// it in a phase map scoped to this one operation (spec.md §4.6 step 2,
/// `process-phases`).
fn process_phases(phases: &[PhaseRef]) -> (Vec<PhaseName>, PhaseMap) {
    let mut names = Vec::with_capacity(phases.len());
    let mut inline = PhaseMap::new();

    for phase in phases {
        match phase {
            PhaseRef::Named(name) => names.push(name.clone()),
            PhaseRef::Inline(plan) => {
                let name = PhaseName::gensym("inline-phase");
                inline.insert(
                    name.clone(),
                    PhaseEntry {
                        name: name.clone(),
                        plan: plan.clone(),
                        meta: PhaseMeta::default(),
                    },
                );
                names.push(name);
            }
        }
    }

    (names, inline)
}

/// Merge a gensym'd inline-phase map into every target's effective phase
/// map, so the phase executor's per-target lookup (`Target::phase`) finds
/// them. A no-op when there are no inline phases in this operation.
fn with_inline_phases(targets: Vec<Arc<Target>>, inline: &PhaseMap) -> Vec<Arc<Target>> {
    if inline.is_empty() {
        return targets;
    }
    targets
        .into_iter()
        .map(|t| {
            Arc::new(Target {
                phases: merge_phase_maps(&t.phases, inline),
                ..(*t).clone()
            })
        })
        .collect()
}

/// `converge(groups, phases, options)` — the full reconciliation sequence:
///
/// 1. Compose each group-spec's `:extends` chain.
/// 2. Expand nested group-specs (`expand-group-spec-with-counts`): a
///    nested spec's `count` multiplies with its parent's.
/// 3. Apply the environment overlay, if supplied.
/// 4. List live nodes from the compute provider.
/// 5. Resolve targets (group membership); separately materialize
///    `all_node_set` and `raw_target_sets` (`split-groups-and-targets`) —
///    both are retained for `:settings` only, never delta-managed.
/// 6. Compute deltas.
/// 7. Validate — any missing `count` aborts before any effect.
/// 8. Adjust node count (create/destroy), concurrently per group.
/// 9. Split the caller's phase list into names and inline plan functions
///    (`process_phases`), gensym'ing the latter and merging them into every
///    target's phase map.
/// 10. Run `os-detection (if enabled) ++ [:settings, :bootstrap] ++ caller
///     phases` over the merged target set — newly created nodes pick up
///     their deferred `:bootstrap` here rather than during the adjust step.
///     After each phase, `post_phase_f`/`post_phase_fsm` run for side
///     effects, return values discarded.
/// 11. A target with no plan bound to a phase in that list simply reports
///     `Skipped` for it.
/// 12. Return `{results, targets, deltas, old-node-ids}`.
#[instrument(skip_all)]
pub async fn converge(
    groups: &[GroupSpec],
    phases: &[PhaseRef],
    options: &OperationOptions,
    cancellation: &CancellationToken,
) -> Result<OperationResult> {
    let started_at = Utc::now();
    let composed: Vec<GroupSpec> = groups.iter().map(GroupSpec::composed).collect();
    // `expand-group-spec-with-counts` (spec.md §4.6 step 4): a nested
    // group-spec's count multiplies with its parent's before delta
    // computation ever sees it.
    let expanded: Vec<GroupSpec> = composed.iter().flat_map(GroupSpec::expand_nested_counts).collect();
    let overlaid = apply_environment(expanded, options.environment.as_ref());

    let live_nodes: Vec<NodeHandle> = options
        .compute
        .nodes()
        .await
        .map_err(|e| FleetError::provider(None, e))?;

    let resolved = target::resolve_targets(&live_nodes, &overlaid);
    let deltas = delta::compute_deltas(&overlaid, &resolved)?;

    // Targets kept alive for `:settings` only, never subject to delta/adjust:
    // the `all-node-set` option (filter-resolved) and `split-groups-and-targets`
    // raw `(group-spec, nodes)` pairs (filter-bypassing), per spec.md §6 and
    // §4.6 step 5 respectively.
    let mut retained = if options.all_node_set.is_empty() {
        Vec::new()
    } else {
        let retained_groups: Vec<GroupSpec> = options.all_node_set.iter().map(GroupSpec::composed).collect();
        let retained_groups = apply_environment(retained_groups, options.environment.as_ref());
        target::resolve_targets(&live_nodes, &retained_groups)
    };
    retained.extend(target::materialize_raw_targets(&options.raw_target_sets));

    let session = build_session(options);
    let (phase_names, inline_phases) = process_phases(phases);

    let (adjust_outcome, adjust_err) = crate::adjuster::adjust(
        &session,
        options.compute.clone(),
        deltas.clone(),
        &resolved,
        &options.partition_f,
        cancellation,
    )
    .await;

    if let Some(err) = adjust_err {
        return Err(err);
    }

    let mut all_results = adjust_outcome.results;
    let mut targets = with_inline_phases(adjust_outcome.targets, &inline_phases);

    // Phases proper: os-detection (if enabled) ++ [:settings, :bootstrap] ++
    // caller phases, per spec.md §4.6 step 10.
    let mut full_phase_list = Vec::new();
    if options.os_detect {
        full_phase_list.push(os_detect_bootstrap_phase());
        full_phase_list.push(os_detect_phase());
    }
    full_phase_list.push(PhaseName::new("settings"));
    full_phase_list.push(PhaseName::new("bootstrap"));
    full_phase_list.extend(phase_names);

    if !cancellation.is_cancelled() {
        let (phase_results, phase_err) = phase::lift_op(
            &session,
            &full_phase_list,
            &targets,
            &options.partition_f,
            cancellation,
            options.post_phase_f.as_ref(),
            options.post_phase_fsm.as_ref(),
        )
        .await;
        all_results.extend(phase_results);
        if let Some(err) = phase_err {
            if matches!(err, FleetError::PlanCrash { .. } | FleetError::Cancelled) {
                return Err(err);
            }
            info!(error = %err, "converge completed with at least one domain failure");
        }
    }

    // `all_node_set` targets receive `:settings` only — never the full
    // os-detect/bootstrap/caller phase list — and are never subject to
    // delta computation, per spec.md §6.
    if !retained.is_empty() && !cancellation.is_cancelled() {
        let (settings_only, settings_err) = phase::lift_phase(
            &session,
            &PhaseName::new("settings"),
            &retained,
            &options.partition_f,
            cancellation,
        )
        .await;
        all_results.extend(settings_only);
        if let Some(err) = settings_err {
            if matches!(err, FleetError::PlanCrash { .. } | FleetError::Cancelled) {
                return Err(err);
            }
        }
    }
    targets.extend(retained);

    Ok(OperationResult {
        results: all_results,
        targets,
        deltas: Some(deltas),
        old_node_ids: adjust_outcome.old_node_ids,
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
    })
}

/// `lift(targets, phases, options)` — runs `[:settings]` ahead of the
/// caller's phases, skipping delta computation and node-count adjustment
/// entirely. Inline plan functions in `phases` are gensym'd the same way
/// `converge` handles them (spec.md §4.6 step 2).
#[instrument(skip_all)]
pub async fn lift(
    targets: &[Arc<Target>],
    phases: &[PhaseRef],
    options: &OperationOptions,
    cancellation: &CancellationToken,
) -> Result<OperationResult> {
    let started_at = Utc::now();
    let session = build_session(options);
    let (phase_names, inline_phases) = process_phases(phases);
    let augmented = with_inline_phases(targets.to_vec(), &inline_phases);

    let mut full_phase_list = vec![PhaseName::new("settings")];
    full_phase_list.extend(phase_names);

    let (results, err) = phase::lift_op(
        &session,
        &full_phase_list,
        &augmented,
        &options.partition_f,
        cancellation,
        options.post_phase_f.as_ref(),
        options.post_phase_fsm.as_ref(),
    )
    .await;

    if let Some(err) = err {
        if matches!(err, FleetError::PlanCrash { .. } | FleetError::Cancelled) {
            return Err(err);
        }
    }

    Ok(OperationResult {
        results,
        targets: targets.to_vec(),
        deltas: None,
        old_node_ids: vec![],
        started_at: Some(started_at),
        completed_at: Some(Utc::now()),
    })
}

/// A handle to an operation running on its own task, supporting
/// cancellation and either polling or awaiting.
pub struct OperationHandle {
    cancellation: CancellationToken,
    receiver: oneshot::Receiver<Result<OperationResult>>,
}

impl OperationHandle {
    /// Request cooperative cancellation; in-flight phase tasks observe this
    /// at their next await point and exit, reporting `FleetError::Cancelled`.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn join(self) -> Result<OperationResult> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Cancelled),
        }
    }
}

/// Spawn `converge` as an independent task and return a handle immediately.
pub fn converge_async(groups: Vec<GroupSpec>, phases: Vec<PhaseRef>, options: OperationOptions) -> OperationHandle {
    let cancellation = CancellationToken::new();
    let token = cancellation.clone();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = converge(&groups, &phases, &options, &token).await;
        let _ = tx.send(result);
    });

    OperationHandle {
        cancellation,
        receiver: rx,
    }
}

/// Run `converge` synchronously, blocking until completion or until
/// `options.timeout` elapses.
pub async fn converge_sync(
    groups: &[GroupSpec],
    phases: &[PhaseRef],
    options: &OperationOptions,
) -> Result<OperationResult> {
    let cancellation = CancellationToken::new();
    match options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, converge(groups, phases, options, &cancellation)).await {
            Ok(result) => result,
            Err(_) => match &options.timeout_val {
                Some(fallback) => Ok(fallback.clone()),
                None => Err(FleetError::Timeout),
            },
        },
        None => converge(groups, phases, options, &cancellation).await,
    }
}
