//! The phase executor.
//!
//! Selects, for each target, the plan function bound to the phase name in
//! the target's effective phase map; spawns one task per target within a
//! partition (partitions run sequentially, targets within a partition run
//! concurrently); folds panics and unexpected plan errors into
//! `CrashedResults`, expected action failures into `DomainError`.

use crate::error::FleetError;
use crate::recorder::ActionResult;
use crate::session::Session;
use crate::spec::{PhaseName, Target};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How one target's phase invocation ended.
#[derive(Clone, Debug)]
pub enum PhaseOutcome {
    Succeeded(serde_json::Value),
    /// A recognized plan failure; flows as data, does not halt the phase.
    DomainError,
    /// No plan function bound to this phase for this target.
    Skipped,
    /// An unexpected panic or plan error; the partial action results are
    /// still recorded, but the phase executor also surfaces an aggregate
    /// error for this phase.
    CrashedResults,
}

/// `{target, action-results, return-value | exception}`.
#[derive(Clone, Debug)]
pub struct PhaseResult {
    pub target: Arc<Target>,
    pub action_results: Vec<ActionResult>,
    pub outcome: PhaseOutcome,
}

impl PhaseResult {
    pub fn has_error(&self) -> bool {
        self.action_results.iter().any(ActionResult::is_error)
    }
}

/// Splits a target list into partitions. Defaults to a single partition
/// holding every target.
pub type PartitionFn = Arc<dyn Fn(&[Arc<Target>]) -> Vec<Vec<Arc<Target>>> + Send + Sync>;

pub fn default_partition() -> PartitionFn {
    Arc::new(|targets: &[Arc<Target>]| vec![targets.to_vec()])
}

/// `post-phase-f`/`post-phase-fsm` (spec.md §4.5 item 5, §6): an optional
/// hook invoked after a phase's results are known, for side effects only —
/// its return value is discarded. The two options are distinguished only by
/// name in the source system; `lift_op` runs both the same way.
pub type PostPhaseFn = Arc<dyn Fn(&PhaseName, &[PhaseResult]) + Send + Sync>;

enum TaskOutcome {
    Success(serde_json::Value, Vec<ActionResult>),
    Crashed(Vec<ActionResult>, anyhow::Error),
}

async fn run_target(
    session: Session,
    target: Arc<Target>,
    phase: PhaseName,
    cancellation: CancellationToken,
) -> TaskOutcome {
    let target_session = session.for_target(target.clone());
    let recorder = target_session.recorder.clone();
    let entry = target_session
        .current_target
        .as_ref()
        .and_then(|t| t.phase(&phase))
        .cloned();

    let plan = match entry {
        Some(e) => e.plan,
        None => unreachable!("caller filters targets without this phase before spawning"),
    };

    let outcome = tokio::select! {
        _ = cancellation.cancelled() => {
            return TaskOutcome::Crashed(recorder.flatten(), anyhow::anyhow!("operation cancelled"));
        }
        result = plan.plan(target_session) => result,
    };

    match outcome {
        Ok(value) => TaskOutcome::Success(value, recorder.flatten()),
        Err(e) => TaskOutcome::Crashed(recorder.flatten(), e),
    }
}

/// Runs one phase over a set of targets, returning per-target results
/// alongside an optional halting error.
pub async fn lift_phase(
    session: &Session,
    phase: &PhaseName,
    targets: &[Arc<Target>],
    partition_f: &PartitionFn,
    cancellation: &CancellationToken,
) -> (Vec<PhaseResult>, Option<FleetError>) {
    let mut results = Vec::new();
    let mut crash_errors = Vec::new();

    for partition in partition_f(targets) {
        if cancellation.is_cancelled() {
            for target in &partition {
                results.push(PhaseResult {
                    target: target.clone(),
                    action_results: vec![],
                    outcome: PhaseOutcome::CrashedResults,
                });
            }
            crash_errors.push(FleetError::Cancelled);
            continue;
        }

        let mut runnable = Vec::new();
        for target in &partition {
            if target.phase(phase).is_some() {
                runnable.push(target.clone());
            } else {
                results.push(PhaseResult {
                    target: target.clone(),
                    action_results: vec![],
                    outcome: PhaseOutcome::Skipped,
                });
            }
        }

        if runnable.is_empty() {
            continue;
        }

        let (tx, mut rx) = mpsc::channel(runnable.len());
        for target in &runnable {
            let session = session.clone();
            let target = target.clone();
            let phase = phase.clone();
            let cancellation = cancellation.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let target_id = target.id();
                // Spawn the plan invocation as its own task so a panic inside
                // it surfaces as a `JoinError` here rather than taking down
                // this supervisor task (and with it, the channel send).
                let inner = tokio::spawn(run_target(
                    session,
                    target.clone(),
                    phase,
                    cancellation,
                ));
                let outcome = match inner.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        TaskOutcome::Crashed(vec![], anyhow::anyhow!("plan panicked: {join_err}"))
                    }
                };
                let _ = tx.send((target, target_id, outcome)).await;
            });
        }
        drop(tx);

        let mut received = 0;
        while received < runnable.len() {
            let Some((target, target_id, outcome)) = rx.recv().await else {
                break;
            };
            received += 1;

            match outcome {
                TaskOutcome::Success(value, actions) => {
                    let domain_failed = actions.iter().any(ActionResult::is_error);
                    info!(target = %target_id, phase = %phase, "phase completed");
                    results.push(PhaseResult {
                        target,
                        action_results: actions,
                        outcome: if domain_failed {
                            PhaseOutcome::DomainError
                        } else {
                            PhaseOutcome::Succeeded(value)
                        },
                    });
                }
                TaskOutcome::Crashed(actions, source) => {
                    warn!(target = %target_id, phase = %phase, error = %source, "phase crashed");
                    crash_errors.push(FleetError::plan_crash(target_id, actions.clone(), source));
                    results.push(PhaseResult {
                        target,
                        action_results: actions,
                        outcome: PhaseOutcome::CrashedResults,
                    });
                }
            }
        }
    }

    (results, FleetError::aggregate(crash_errors))
}

/// `lift-op(session, [p1…pn], targets, options)`: runs each phase in order; a crash in phase *i* halts
/// phase *i+1*; a domain error (an action result carrying `:error`) is
/// recorded as a "phase failed" error but subsequent phases still run.
pub async fn lift_op(
    session: &Session,
    phases: &[PhaseName],
    targets: &[Arc<Target>],
    partition_f: &PartitionFn,
    cancellation: &CancellationToken,
    post_phase_f: Option<&PostPhaseFn>,
    post_phase_fsm: Option<&PostPhaseFn>,
) -> (Vec<PhaseResult>, Option<FleetError>) {
    let mut all_results = Vec::new();
    let mut domain_failure: Option<FleetError> = None;

    for phase in phases {
        let (results, crash) = lift_phase(session, phase, targets, partition_f, cancellation).await;
        let any_domain_error = results.iter().any(PhaseResult::has_error);

        if let Some(hook) = post_phase_f {
            hook(phase, &results);
        }
        if let Some(hook) = post_phase_fsm {
            hook(phase, &results);
        }

        all_results.extend(results);

        if let Some(err) = crash {
            return (all_results, Some(err));
        }

        if any_domain_error {
            domain_failure = Some(FleetError::domain(
                phase.as_str(),
                format!("phase '{phase}' failed on at least one target"),
            ));
        }
    }

    (all_results, domain_failure)
}
