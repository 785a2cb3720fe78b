//! The node-count adjuster.
//!
//! Turns `Deltas` into compute-provider effects: one task per removal-spec,
//! one task per add-spec, all running concurrently and reporting through a
//! single buffered completion channel sized to the task count so producers
//! never block on a slow consumer.

use crate::delta::{AddSpec, Deltas, RemovalSpec};
use crate::error::FleetError;
use crate::node::{NodeHandle, GROUP_NAME_TAG};
use crate::phase::{self, PartitionFn, PhaseResult};
use crate::provider::ComputeProvider;
use crate::session::Session;
use crate::spec::{PhaseName, Target, TargetType};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the adjuster produced, handed back to the operation driver for the
/// remaining (non-delta) phases.
#[derive(Default)]
pub struct AdjustOutcome {
    pub results: Vec<PhaseResult>,
    /// Every target now known to be live, old and new, to hand onward to
    /// the remaining phases of the operation.
    pub targets: Vec<Arc<Target>>,
    /// Node ids destroyed by this adjustment, for the caller's bookkeeping.
    pub old_node_ids: Vec<String>,
}

fn phase_name(name: &str) -> PhaseName {
    PhaseName::new(name)
}

async fn run_removal(
    session: Session,
    provider: Arc<dyn ComputeProvider>,
    removal: RemovalSpec,
    partition_f: PartitionFn,
    cancellation: CancellationToken,
) -> (Vec<PhaseResult>, Vec<String>, Option<FleetError>) {
    let destroy_server = phase_name("destroy-server");
    let (mut results, crash) = phase::lift_phase(
        &session,
        &destroy_server,
        &removal.targets,
        &partition_f,
        &cancellation,
    )
    .await;

    if crash.is_some() {
        return (results, vec![], crash);
    }

    let nodes: Vec<NodeHandle> = removal
        .targets
        .iter()
        .filter_map(|t| t.node.clone())
        .collect();

    let outcome = match provider.destroy_nodes(&nodes).await {
        Ok(outcome) => outcome,
        Err(source) => {
            return (
                results,
                vec![],
                Some(FleetError::provider(Some(removal.group.group_name.clone()), source)),
            );
        }
    };

    if !outcome.errors.is_empty() {
        warn!(
            group = %removal.group.group_name,
            errors = ?outcome.errors,
            "destroy-nodes reported partial failures"
        );
    }

    if removal.remove_group && outcome.destroyed_node_ids.len() == removal.targets.len() {
        let group_target = crate::target::group_scope_target(&removal.group);
        let destroy_group = phase_name("destroy-group");
        let (group_results, crash) = phase::lift_phase(
            &session,
            &destroy_group,
            std::slice::from_ref(&group_target),
            &partition_f,
            &cancellation,
        )
        .await;
        results.extend(group_results);
        if crash.is_some() {
            return (results, outcome.destroyed_node_ids, crash);
        }
    }

    (results, outcome.destroyed_node_ids, None)
}

async fn run_add(
    session: Session,
    provider: Arc<dyn ComputeProvider>,
    add: AddSpec,
    partition_f: PartitionFn,
    cancellation: CancellationToken,
) -> (Vec<PhaseResult>, Vec<Arc<Target>>, Option<FleetError>) {
    let mut results = Vec::new();

    if add.create_group {
        let group_target = crate::target::group_scope_target(&add.group);
        let create_group = phase_name("create-group");
        let (group_results, crash) = phase::lift_phase(
            &session,
            &create_group,
            std::slice::from_ref(&group_target),
            &partition_f,
            &cancellation,
        )
        .await;
        results.extend(group_results);
        if crash.is_some() {
            return (results, vec![], crash);
        }
    }

    let created = match provider
        .create_nodes(
            &add.group.node_spec,
            &session.user,
            add.count,
            Some(&add.group.group_name),
        )
        .await
    {
        Ok(nodes) => nodes,
        Err(source) => {
            return (
                results,
                vec![],
                Some(FleetError::provider(Some(add.group.group_name.clone()), source)),
            );
        }
    };

    for node in &created {
        info!(node = %node.id(), group = %add.group.group_name, "node created");
        if node.tag(GROUP_NAME_TAG).is_none() && node.taggable() {
            warn!(
                node = %node.id(),
                "compute provider returned an untagged node; default node-filter will \
                 fall back to base-name matching for it"
            );
        }
    }

    let new_targets: Vec<Arc<Target>> = created
        .into_iter()
        .map(|node| {
            Arc::new(Target {
                node: Some(node),
                group_name: add.group.group_name.clone(),
                group_names: HashSet::from([add.group.group_name.clone()]),
                phases: add.group.server_spec.phases.clone(),
                default_phases: add.group.server_spec.default_phases.clone(),
                roles: add.group.roles.clone(),
                target_type: TargetType::Node,
            })
        })
        .collect();

    // `:bootstrap` is deliberately not run here; it is deferred to the
    // operation driver's remaining phase list.
    (results, new_targets, None)
}

enum TaskResult {
    Removal(Vec<PhaseResult>, Vec<String>, Option<FleetError>),
    Add(Vec<PhaseResult>, Vec<Arc<Target>>, Option<FleetError>),
}

/// Apply every removal-spec and add-spec concurrently, one task each,
/// aggregating through a single completion channel.
pub async fn adjust(
    session: &Session,
    provider: Arc<dyn ComputeProvider>,
    deltas: Deltas,
    existing_targets: &[Arc<Target>],
    partition_f: &PartitionFn,
    cancellation: &CancellationToken,
) -> (AdjustOutcome, Option<FleetError>) {
    let task_count = deltas.removals.len() + deltas.adds.len();
    if task_count == 0 {
        return (
            AdjustOutcome {
                results: vec![],
                targets: existing_targets.to_vec(),
                old_node_ids: vec![],
            },
            None,
        );
    }

    let (tx, mut rx) = mpsc::channel(task_count);

    for removal in deltas.removals {
        let session = session.clone();
        let provider = provider.clone();
        let partition_f = partition_f.clone();
        let cancellation = cancellation.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(run_removal(session, provider, removal, partition_f, cancellation));
            let result = match task.await {
                Ok((results, destroyed, err)) => TaskResult::Removal(results, destroyed, err),
                Err(join_err) => TaskResult::Removal(
                    vec![],
                    vec![],
                    Some(FleetError::provider(
                        None,
                        anyhow::anyhow!("removal task panicked: {join_err}"),
                    )),
                ),
            };
            let _ = tx.send(result).await;
        });
    }

    for add in deltas.adds {
        let session = session.clone();
        let provider = provider.clone();
        let partition_f = partition_f.clone();
        let cancellation = cancellation.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(run_add(session, provider, add, partition_f, cancellation));
            let result = match task.await {
                Ok((results, targets, err)) => TaskResult::Add(results, targets, err),
                Err(join_err) => TaskResult::Add(
                    vec![],
                    vec![],
                    Some(FleetError::provider(
                        None,
                        anyhow::anyhow!("add task panicked: {join_err}"),
                    )),
                ),
            };
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut results = Vec::new();
    let mut targets = existing_targets.to_vec();
    let mut old_node_ids = Vec::new();
    let mut errors = Vec::new();
    let mut received = 0;

    while received < task_count {
        let Some(task_result) = rx.recv().await else {
            break;
        };
        received += 1;

        match task_result {
            TaskResult::Removal(phase_results, destroyed, err) => {
                results.extend(phase_results);
                targets.retain(|t| {
                    t.node
                        .as_ref()
                        .map(|n| !destroyed.contains(&n.id().to_string()))
                        .unwrap_or(true)
                });
                old_node_ids.extend(destroyed);
                if let Some(e) = err {
                    errors.push(e);
                }
            }
            TaskResult::Add(phase_results, new_targets, err) => {
                results.extend(phase_results);
                targets.extend(new_targets);
                if let Some(e) = err {
                    errors.push(e);
                }
            }
        }
    }

    let outcome = AdjustOutcome {
        results,
        targets,
        old_node_ids,
    };

    (outcome, FleetError::aggregate(errors))
}
