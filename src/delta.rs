//! Delta calculation.
//!
//! For each group, compute `(actual, target, delta)` and partition the
//! result into removal-specs and add-specs for the node-count adjuster.

use crate::error::{FleetError, Result};
use crate::spec::{GroupDelta, GroupSpec, Target};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RemovalSpec {
    pub group: GroupSpec,
    /// The group itself is being dissolved; the group-scope
    /// `:destroy-group` phase must run once this completes.
    pub remove_group: bool,
    pub targets: Vec<Arc<Target>>,
}

#[derive(Clone, Debug)]
pub struct AddSpec {
    pub group: GroupSpec,
    pub count: u32,
    /// The group did not previously exist; `:create-group` must run once
    /// before any node is created.
    pub create_group: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Deltas {
    pub group_deltas: Vec<GroupDelta>,
    pub removals: Vec<RemovalSpec>,
    pub adds: Vec<AddSpec>,
}

fn matching_targets(group: &GroupSpec, targets: &[Arc<Target>]) -> Vec<Arc<Target>> {
    targets
        .iter()
        .filter(|t| t.node.is_some() && t.group_names.contains(&group.group_name))
        .cloned()
        .collect()
}

/// Compute `(actual, target, delta)` for every group and partition into
/// removal/add specs.
pub fn compute_deltas(groups: &[GroupSpec], targets: &[Arc<Target>]) -> Result<Deltas> {
    let mut out = Deltas::default();

    for group in groups {
        let target_count = group.count.ok_or_else(|| {
            FleetError::Validation(format!("group '{}' has no count", group.group_name))
        })? as i64;

        let matching = matching_targets(group, targets);
        let actual = matching.len();
        let delta = target_count - actual as i64;

        out.group_deltas.push(GroupDelta {
            group: group.clone(),
            actual,
            target: target_count as usize,
            delta,
            targets: matching.clone(),
        });

        if delta < 0 {
            let n = (-delta) as usize;
            out.removals.push(RemovalSpec {
                group: group.clone(),
                remove_group: target_count == 0,
                targets: group.removal_selection_fn.select(n, &matching),
            });
        } else if delta > 0 {
            out.adds.push(AddSpec {
                group: group.clone(),
                count: delta as u32,
                create_group: actual == 0,
            });
        }
    }

    Ok(out)
}
