//! Target resolution.
//!
//! Classifies each live node under zero or more groups using each group's
//! node-filter, yielding target records. Nodes matching no group are
//! dropped.

use crate::node::NodeHandle;
use crate::spec::{GroupSpec, Target, TargetType};
use std::collections::HashSet;
use std::sync::Arc;

/// For each node, evaluate every group's filter and fold the matching
/// group-specs together into one target.
pub fn resolve_targets(nodes: &[NodeHandle], groups: &[GroupSpec]) -> Vec<Arc<Target>> {
    nodes
        .iter()
        .filter_map(|node| target_for_node(node, groups))
        .collect()
}

fn target_for_node(node: &NodeHandle, groups: &[GroupSpec]) -> Option<Arc<Target>> {
    let matching: Vec<&GroupSpec> = groups
        .iter()
        .filter(|g| g.node_filter.matches(node.as_ref()))
        .collect();

    if matching.is_empty() {
        return None;
    }

    let group_names: HashSet<String> = matching.iter().map(|g| g.group_name.clone()).collect();

    let folded = matching
        .into_iter()
        .cloned()
        .reduce(|acc, g| GroupSpec::fold(&acc, &g))
        .expect("non-empty matching set");

    Some(Arc::new(Target {
        node: Some(node.clone()),
        group_name: folded.group_name,
        group_names,
        phases: folded.server_spec.phases,
        default_phases: folded.server_spec.default_phases,
        roles: folded.roles,
        target_type: TargetType::Node,
    }))
}

/// A caller may supply raw `(group-spec, nodes)` pairs that bypass filter
/// matching — one target per node, using the supplied group-spec directly.
pub fn materialize_raw_targets(pairs: &[(GroupSpec, Vec<NodeHandle>)]) -> Vec<Arc<Target>> {
    pairs
        .iter()
        .flat_map(|(group, nodes)| {
            nodes.iter().map(move |node| {
                Arc::new(Target {
                    node: Some(node.clone()),
                    group_name: group.group_name.clone(),
                    group_names: HashSet::from([group.group_name.clone()]),
                    phases: group.server_spec.phases.clone(),
                    default_phases: group.server_spec.default_phases.clone(),
                    roles: group.roles.clone(),
                    target_type: TargetType::Node,
                })
            })
        })
        .collect()
}

/// A group-scope target (no node), used for `:create-group`/`:destroy-group`
/// phases.
pub fn group_scope_target(group: &GroupSpec) -> Arc<Target> {
    Arc::new(Target {
        node: None,
        group_name: group.group_name.clone(),
        group_names: HashSet::from([group.group_name.clone()]),
        phases: group.server_spec.phases.clone(),
        default_phases: group.server_spec.default_phases.clone(),
        roles: group.roles.clone(),
        target_type: TargetType::Group,
    })
}

/// Invert a target stream into a `role → [node]` map, used by plan
/// functions to resolve cross-role references.
pub fn role_index(targets: &[Arc<Target>]) -> std::collections::HashMap<String, Vec<NodeHandle>> {
    let mut index: std::collections::HashMap<String, Vec<NodeHandle>> = std::collections::HashMap::new();
    for target in targets {
        if let Some(node) = &target.node {
            for role in &target.roles {
                index.entry(role.clone()).or_default().push(node.clone());
            }
        }
    }
    index
}
