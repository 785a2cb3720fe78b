//! End-to-end reconciliation scenarios, exercised against the
//! in-memory compute provider and executor.

use fleetforge::{
    converge, Action, ComputeProvider, Environment, FleetError, FnPlan, GroupOverlay, GroupSpec,
    NodeSpec, OperationOptions, PhaseRef, User,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod support {
    pub use fleetforge::node::testing::TestNode;
    pub use fleetforge::provider::testing::{FailingExecutor, InMemoryComputeProvider, LoggingExecutor};
}

fn configure_plan() -> Arc<dyn fleetforge::PlanFn> {
    Arc::new(FnPlan(|session: fleetforge::Session| async move {
        let target_id = session.current_target.as_ref().unwrap().id();
        session
            .executor
            .execute(&target_id, &Action::script("configure", "apt install nginx"))
            .await?;
        Ok(serde_json::json!({"configured": true}))
    }))
}

#[tokio::test]
async fn grow_from_zero_creates_nodes_and_configures_them() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor.clone(), User::new("admin"));

    let group = GroupSpec::new("web").with_count(3).with_phase("configure", configure_plan());

    let result = converge(
        &[group],
        &[PhaseRef::from("configure")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.targets.len(), 3);
    assert_eq!(provider.nodes().await.unwrap().len(), 3);
    assert_eq!(executor.log.lock().len(), 3);
}

#[tokio::test]
async fn shrink_destroys_the_right_number_without_dissolving_the_group() {
    let seed: Vec<fleetforge::NodeHandle> = (0..3)
        .map(|i| {
            Arc::new(
                support::TestNode::new(format!("n{i}"), "web")
                    .with_tag(fleetforge::GROUP_NAME_TAG, "web"),
            ) as fleetforge::NodeHandle
        })
        .collect();
    let provider = Arc::new(support::InMemoryComputeProvider::new(seed));
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"));

    let group = GroupSpec::new("web").with_count(1);
    let result = converge(&[group], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.targets.len(), 1);
    assert_eq!(provider.nodes().await.unwrap().len(), 1);
    assert_eq!(result.old_node_ids.len(), 2);
}

#[tokio::test]
async fn dissolve_to_zero_destroys_every_node_and_the_group_itself() {
    let seed: Vec<fleetforge::NodeHandle> = vec![Arc::new(
        support::TestNode::new("n1", "web").with_tag(fleetforge::GROUP_NAME_TAG, "web"),
    )];
    let provider = Arc::new(support::InMemoryComputeProvider::new(seed));
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"));

    let group = GroupSpec::new("web").with_count(0);
    let result = converge(&[group], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.targets.is_empty());
    assert!(provider.nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn cross_group_growth_runs_concurrently_and_independently() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor.clone(), User::new("admin"));

    let web = GroupSpec::new("web").with_count(2).with_phase("configure", configure_plan());
    let db = GroupSpec::new("db").with_count(1).with_phase("configure", configure_plan());

    let result = converge(
        &[web, db],
        &[PhaseRef::from("configure")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.targets.len(), 3);
    assert_eq!(executor.log.lock().len(), 3);
}

#[tokio::test]
async fn plan_crash_surfaces_partial_results_and_halts_later_phases() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"));

    let crashing_plan: Arc<dyn fleetforge::PlanFn> = Arc::new(FnPlan(|session: fleetforge::Session| async move {
        let target_id = session.current_target.as_ref().unwrap().id();
        session
            .executor
            .execute(&target_id, &Action::script("pre-check", "test -f /etc/hosts"))
            .await?;
        anyhow::bail!("unrecoverable: disk full")
    }));

    let group = GroupSpec::new("web")
        .with_count(1)
        .with_phase("configure", crashing_plan)
        .with_phase("bootstrap", configure_plan());

    let err = converge(
        &[group],
        &[PhaseRef::from("configure"), PhaseRef::from("bootstrap")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        FleetError::PlanCrash { partial, .. } => {
            assert_eq!(partial.len(), 1);
            assert_eq!(partial[0].action, "pre-check");
        }
        other => panic!("expected PlanCrash, got {other:?}"),
    }
}

#[tokio::test]
async fn cluster_expansion_prefixes_names_and_applies_cluster_phases() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor.clone(), User::new("admin"));

    let cluster = fleetforge::ClusterSpec {
        name: "prod".to_string(),
        groups: vec![
            GroupSpec::new("web").with_count(1),
            GroupSpec::new("db").with_count(1),
        ],
        ..Default::default()
    };
    let groups = cluster.expand();

    let result = converge(&groups, &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.targets.len(), 2);
    let names: std::collections::HashSet<_> = result
        .targets
        .iter()
        .map(|t| t.group_name.clone())
        .collect();
    assert!(names.contains("prod-web"));
    assert!(names.contains("prod-db"));
}

#[tokio::test]
async fn domain_error_does_not_halt_later_phases() {
    let seed: Vec<fleetforge::NodeHandle> = vec![Arc::new(
        support::TestNode::new("n1", "web").with_tag(fleetforge::GROUP_NAME_TAG, "web"),
    )];
    let provider = Arc::new(support::InMemoryComputeProvider::new(seed));
    let executor = Arc::new(support::FailingExecutor::new(["configure"]));
    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"));

    let group = GroupSpec::new("web")
        .with_count(1)
        .with_phase("configure", configure_plan())
        .with_phase("bootstrap", configure_plan());

    let result = converge(
        &[group],
        &[PhaseRef::from("configure"), PhaseRef::from("bootstrap")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Every phase still ran even though configure's action failed: 3 of the
    // implicit/caller phases are skipped (no plan bound), and the bound
    // phases ("bootstrap" runs once implicitly and once as a caller phase,
    // plus "configure") each report a domain error rather than halting.
    let failed = result.results.iter().filter(|r| r.has_error()).count();
    assert_eq!(failed, 3);
    assert!(result.results.iter().any(|r| r.has_error()));
}

#[tokio::test]
async fn environment_overlay_changes_node_spec_for_newly_created_nodes() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());

    let mut groups = std::collections::HashMap::new();
    groups.insert(
        "web".to_string(),
        GroupOverlay {
            node_spec: NodeSpec {
                hardware_id: Some("c5.large".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let environment = Environment {
        node_spec: NodeSpec {
            image: Some("base-2024".to_string()),
            ..Default::default()
        },
        groups,
        ..Default::default()
    };

    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"))
        .with_environment(environment);

    let group = GroupSpec::new("web").with_count(1);
    let result = converge(&[group], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.targets.len(), 1);
}

#[tokio::test]
async fn os_detect_runs_bound_os_phases_ahead_of_settings_and_bootstrap() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor.clone(), User::new("admin"));

    let os_seen: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_for_os = os_seen.clone();
    let seen_for_bootstrap = os_seen.clone();

    let group = GroupSpec::new("web")
        .with_count(1)
        .with_phase(
            "pallet/os",
            Arc::new(FnPlan(move |_s: fleetforge::Session| {
                let seen = seen_for_os.clone();
                async move {
                    seen.lock().push("os".to_string());
                    Ok(serde_json::Value::Null)
                }
            })),
        )
        .with_phase(
            "bootstrap",
            Arc::new(FnPlan(move |_s: fleetforge::Session| {
                let seen = seen_for_bootstrap.clone();
                async move {
                    seen.lock().push("bootstrap".to_string());
                    Ok(serde_json::Value::Null)
                }
            })),
        );

    let result = converge(&[group], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.targets.len(), 1);
    assert_eq!(os_seen.lock().as_slice(), &["os".to_string(), "bootstrap".to_string()]);
}

#[tokio::test]
async fn os_detect_false_skips_injected_os_phases() {
    let provider = Arc::new(support::InMemoryComputeProvider::empty());
    let executor = Arc::new(support::LoggingExecutor::default());
    let options = OperationOptions::new(provider.clone(), executor.clone(), User::new("admin")).with_os_detect(false);

    let group = GroupSpec::new("web").with_count(1).with_phase(
        "pallet/os",
        Arc::new(FnPlan(|_s: fleetforge::Session| async move {
            panic!("pallet/os must not run when os_detect is disabled");
        })),
    );

    let result = converge(&[group], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.targets.len(), 1);
    let ran = result
        .results
        .iter()
        .any(|r| matches!(r.outcome, fleetforge::PhaseOutcome::Succeeded(_)));
    assert!(!ran);
}

#[tokio::test]
async fn all_node_set_receives_settings_only_and_is_not_subject_to_delta() {
    let seed: Vec<fleetforge::NodeHandle> = vec![Arc::new(
        support::TestNode::new("legacy-1", "legacy").with_tag(fleetforge::GROUP_NAME_TAG, "legacy"),
    )];
    let provider = Arc::new(support::InMemoryComputeProvider::new(seed));
    let executor = Arc::new(support::LoggingExecutor::default());

    let legacy_group = GroupSpec::new("legacy").with_phase(
        "settings",
        Arc::new(FnPlan(|_s: fleetforge::Session| async move { Ok(serde_json::json!({"settings": true})) })),
    );

    let options = OperationOptions::new(provider.clone(), executor, User::new("admin"))
        .with_all_node_set(vec![legacy_group]);

    let web = GroupSpec::new("web").with_count(1);
    let result = converge(&[web], &[], &options, &CancellationToken::new())
        .await
        .unwrap();

    // The legacy node is retained (not destroyed, since it was never a
    // delta target) and shows up in the final target set alongside web.
    assert_eq!(result.targets.len(), 2);
    assert!(provider
        .nodes()
        .await
        .unwrap()
        .iter()
        .any(|n| n.id() == "legacy-1"));
    assert!(result
        .results
        .iter()
        .any(|r| matches!(r.outcome, fleetforge::PhaseOutcome::Succeeded(_)) && r.target.group_name == "legacy"));
}
