//! Data model and the spec composer.
//!
//! `Target` and `GroupDelta` live here rather than in `target`/`delta`
//! because `GroupSpec::removal_selection_fn` is typed over `Target` and
//! `Target` is typed over `GroupSpec` — the two are mutually recursive and
//! Rust wants them in the same module. `target`/`delta` hold the
//! algorithms (resolution, delta computation); this module holds the
//! shapes.

use crate::node::{default_node_filter, Node, NodeHandle};
use crate::plan::PlanFn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A cheap, shareable phase identifier. Phases are runtime symbols, not a
/// closed Rust enum, because callers can supply arbitrary names and the
/// operation driver gensyms fresh names for inline anonymous phases.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PhaseName(Arc<str>);

impl PhaseName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A fresh, process-unique name for an inline plan function.
    pub fn gensym(prefix: &str) -> Self {
        Self::new(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }
}

/// One entry of a caller's phase list: either a reference to a name already
/// bound in the targets' phase maps, or a plan function supplied inline.
/// The operation driver splits these apart (`process_phases`) before
/// dispatch, gensym'ing a fresh name for each inline entry and registering
/// it in a phase map scoped to that one operation (spec.md §4.6 step 2,
/// §9 "Inline anonymous phases").
#[derive(Clone)]
pub enum PhaseRef {
    Named(PhaseName),
    Inline(Arc<dyn PlanFn>),
}

impl From<PhaseName> for PhaseRef {
    fn from(name: PhaseName) -> Self {
        PhaseRef::Named(name)
    }
}

impl From<&str> for PhaseRef {
    fn from(name: &str) -> Self {
        PhaseRef::Named(PhaseName::new(name))
    }
}

impl From<String> for PhaseRef {
    fn from(name: String) -> Self {
        PhaseRef::Named(PhaseName::new(name))
    }
}

impl From<Arc<dyn PlanFn>> for PhaseRef {
    fn from(plan: Arc<dyn PlanFn>) -> Self {
        PhaseRef::Inline(plan)
    }
}

impl std::fmt::Debug for PhaseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseRef::Named(name) => write!(f, "PhaseRef::Named({name:?})"),
            PhaseRef::Inline(_) => write!(f, "PhaseRef::Inline(..)"),
        }
    }
}

impl std::fmt::Debug for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PhaseName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PhaseName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Per-phase metadata: execution settings and partitioning hints.
#[derive(Clone, Debug, Default)]
pub struct PhaseMeta {
    pub execution_settings: HashMap<String, serde_json::Value>,
    pub partition_hint: Option<String>,
}

impl PhaseMeta {
    /// Merge strategy for phase metadata: the child's keys win, the
    /// parent's keys survive where the child is silent.
    pub fn merge(base: &PhaseMeta, overlay: &PhaseMeta) -> PhaseMeta {
        let mut execution_settings = base.execution_settings.clone();
        execution_settings.extend(overlay.execution_settings.clone());
        PhaseMeta {
            execution_settings,
            partition_hint: overlay.partition_hint.clone().or_else(|| base.partition_hint.clone()),
        }
    }
}

/// A phase name bound to a plan function and its metadata.
#[derive(Clone)]
pub struct PhaseEntry {
    pub name: PhaseName,
    pub plan: Arc<dyn PlanFn>,
    pub meta: PhaseMeta,
}

impl std::fmt::Debug for PhaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseEntry")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .finish()
    }
}

pub type PhaseMap = HashMap<PhaseName, PhaseEntry>;

/// Merge two phase maps: child entries win per key, but the per-entry
/// metadata merges rather than being wholesale replaced.
pub fn merge_phase_maps(base: &PhaseMap, overlay: &PhaseMap) -> PhaseMap {
    let mut merged = base.clone();
    for (name, overlay_entry) in overlay {
        let entry = match merged.get(name) {
            Some(base_entry) => PhaseEntry {
                name: name.clone(),
                plan: overlay_entry.plan.clone(),
                meta: PhaseMeta::merge(&base_entry.meta, &overlay_entry.meta),
            },
            None => overlay_entry.clone(),
        };
        merged.insert(name.clone(), entry);
    }
    merged
}

/// Provider-neutral template for a new node. Inert
/// data — the compute provider interprets it.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeSpec {
    pub image: Option<String>,
    pub hardware_id: Option<String>,
    pub network: Option<String>,
    pub location: Option<String>,
}

impl NodeSpec {
    /// Overlay: `overlay`'s present fields win, `base`'s survive otherwise
    /// (scalar-overwrite, per the spec-merge table).
    pub fn merge(base: &NodeSpec, overlay: &NodeSpec) -> NodeSpec {
        NodeSpec {
            image: overlay.image.clone().or_else(|| base.image.clone()),
            hardware_id: overlay.hardware_id.clone().or_else(|| base.hardware_id.clone()),
            network: overlay.network.clone().or_else(|| base.network.clone()),
            location: overlay.location.clone().or_else(|| base.location.clone()),
        }
    }
}

/// A predicate deciding whether a live node belongs to a group.
#[derive(Clone)]
pub struct NodeFilter(Arc<dyn Fn(&dyn Node) -> bool + Send + Sync>);

impl NodeFilter {
    pub fn new(f: impl Fn(&dyn Node) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, node: &dyn Node) -> bool {
        (self.0)(node)
    }

    /// The default filter: tag match, falling back to base-name match.
    pub fn default_for(group_name: impl Into<String>) -> Self {
        let group_name = group_name.into();
        Self::new(move |node| default_node_filter(node, &group_name))
    }
}

impl std::fmt::Debug for NodeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeFilter(..)")
    }
}

/// `int × [Target] → [Target]`, selecting which targets to remove.
#[derive(Clone)]
pub struct RemovalSelectionFn(Arc<dyn Fn(usize, &[Arc<Target>]) -> Vec<Arc<Target>> + Send + Sync>);

impl RemovalSelectionFn {
    pub fn new(f: impl Fn(usize, &[Arc<Target>]) -> Vec<Arc<Target>> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn select(&self, n: usize, targets: &[Arc<Target>]) -> Vec<Arc<Target>> {
        (self.0)(n, targets)
    }

    /// Default: take the first `n`. Total on `(n, xs)` when `n = xs.len()`.
    pub fn take_first() -> Self {
        Self::new(|n, targets| targets.iter().take(n).cloned().collect())
    }
}

impl std::fmt::Debug for RemovalSelectionFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemovalSelectionFn(..)")
    }
}

impl Default for RemovalSelectionFn {
    fn default() -> Self {
        Self::take_first()
    }
}

/// A mapping from phase name to plan function plus per-phase metadata.
/// Composable via an `:extends` chain: children override, phase maps
/// merge key-by-key.
#[derive(Clone, Debug, Default)]
pub struct ServerSpec {
    /// Ancestor specs, declaration order, not yet flattened.
    pub extends: Vec<ServerSpec>,
    pub phases: PhaseMap,
    pub default_phases: Vec<PhaseName>,
}

impl ServerSpec {
    /// Flatten the `:extends` chain into this spec by left-to-right
    /// merging of ancestor specs into the child. The result carries no further ancestors.
    pub fn compose(&self) -> ServerSpec {
        let mut acc = ServerSpec::default();
        for ancestor in &self.extends {
            acc = ServerSpec::merge(&acc, &ancestor.compose());
        }
        let mut composed = ServerSpec::merge(&acc, &self.without_extends());
        if composed.default_phases.is_empty() {
            composed.default_phases = vec![PhaseName::new("configure")];
        }
        composed
    }

    fn without_extends(&self) -> ServerSpec {
        ServerSpec {
            extends: Vec::new(),
            phases: self.phases.clone(),
            default_phases: self.default_phases.clone(),
        }
    }

    /// The static merge table: phase maps merge recursively, sequences of
    /// extension chains concatenate in declaration order, scalars
    /// overwrite.
    pub fn merge(base: &ServerSpec, overlay: &ServerSpec) -> ServerSpec {
        ServerSpec {
            extends: base
                .extends
                .iter()
                .cloned()
                .chain(overlay.extends.iter().cloned())
                .collect(),
            phases: merge_phase_maps(&base.phases, &overlay.phases),
            default_phases: if overlay.default_phases.is_empty() {
                base.default_phases.clone()
            } else {
                overlay.default_phases.clone()
            },
        }
    }
}

/// An extension of `ServerSpec` carrying group membership, desired count,
/// and the template for new members.
#[derive(Clone, Debug)]
pub struct GroupSpec {
    pub server_spec: ServerSpec,
    pub group_name: String,
    pub count: Option<u32>,
    pub node_spec: NodeSpec,
    pub roles: HashSet<String>,
    pub node_filter: NodeFilter,
    pub removal_selection_fn: RemovalSelectionFn,
    /// Child group-specs nested under this one. A nested spec's own `count`
    /// is a per-parent-instance multiplier, not an absolute count — see
    /// `expand_nested_counts` (spec.md §4.6 step 4,
    /// `expand-group-spec-with-counts`).
    pub nested: Vec<GroupSpec>,
}

impl GroupSpec {
    pub fn new(group_name: impl Into<String>) -> Self {
        let group_name = group_name.into();
        Self {
            server_spec: ServerSpec::default(),
            node_filter: NodeFilter::default_for(group_name.clone()),
            group_name,
            count: None,
            node_spec: NodeSpec::default(),
            roles: HashSet::new(),
            removal_selection_fn: RemovalSelectionFn::take_first(),
            nested: Vec::new(),
        }
    }

    pub fn with_nested(mut self, nested: impl IntoIterator<Item = GroupSpec>) -> Self {
        self.nested = nested.into_iter().collect();
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_phase(mut self, name: impl Into<PhaseName>, plan: Arc<dyn PlanFn>) -> Self {
        let name = name.into();
        self.server_spec.phases.insert(
            name.clone(),
            PhaseEntry {
                name,
                plan,
                meta: PhaseMeta::default(),
            },
        );
        self
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_node_spec(mut self, node_spec: NodeSpec) -> Self {
        self.node_spec = node_spec;
        self
    }

    /// Compose the group's own `:extends` chain.
    pub fn composed(&self) -> GroupSpec {
        GroupSpec {
            server_spec: self.server_spec.compose(),
            ..self.clone()
        }
    }

    pub fn default_phases(&self) -> &[PhaseName] {
        &self.server_spec.default_phases
    }

    pub fn phases(&self) -> &PhaseMap {
        &self.server_spec.phases
    }

    /// Fold two matching group-specs together. The left operand's identity
    /// fields (group_name, node_spec, node_filter, removal_selection_fn,
    /// count) win; phases merge and roles union.
    pub fn fold(base: &GroupSpec, other: &GroupSpec) -> GroupSpec {
        GroupSpec {
            server_spec: ServerSpec::merge(&base.server_spec, &other.server_spec),
            roles: base.roles.union(&other.roles).cloned().collect(),
            ..base.clone()
        }
    }

    /// Flatten `nested` group-specs into standalone siblings
    /// (`expand-group-spec-with-counts`, spec.md §4.6 step 4). Each nested
    /// spec's `count` is a per-parent-instance multiplier: its effective
    /// count is `nested.count * parent.count`. The nested spec's name is
    /// prefixed with the parent's, its `:extends` chain is rooted in the
    /// parent's server-spec, and its roles union with the parent's —
    /// mirroring `ClusterSpec::expand`. Nesting recurses: a nested spec may
    /// itself carry further nested specs.
    pub fn expand_nested_counts(&self) -> Vec<GroupSpec> {
        let parent_count = self.count.unwrap_or(0);
        let mut out = vec![GroupSpec {
            nested: Vec::new(),
            ..self.clone()
        }];

        for child in &self.nested {
            let mut group_name = self.group_name.clone();
            group_name.push('-');
            group_name.push_str(&child.group_name);

            let child = child.composed();
            let server_spec = ServerSpec::merge(&self.server_spec, &child.server_spec);
            let effective_count = child.count.unwrap_or(0) * parent_count;

            let expanded_child = GroupSpec {
                server_spec,
                group_name: group_name.clone(),
                count: Some(effective_count),
                node_filter: NodeFilter::default_for(group_name),
                roles: self.roles.union(&child.roles).cloned().collect(),
                ..child.clone()
            };
            out.extend(expanded_child.expand_nested_counts());
        }

        out
    }
}

/// A named container of `GroupSpec`s.
#[derive(Clone, Debug, Default)]
pub struct ClusterSpec {
    pub name: String,
    pub groups: Vec<GroupSpec>,
    pub roles: HashSet<String>,
    pub server_spec: ServerSpec,
    pub node_spec: NodeSpec,
}

impl ClusterSpec {
    /// Expand a cluster into its constituent group-specs: prefix each group's name with `name-`, union
    /// cluster roles, extend by cluster phases, then reapply each group's
    /// own phases last so group phases win over cluster phases.
    pub fn expand(&self) -> Vec<GroupSpec> {
        self.groups
            .iter()
            .map(|g| {
                let mut group_name = self.name.clone();
                group_name.push('-');
                group_name.push_str(&g.group_name);

                let cluster_extended = ServerSpec::merge(&self.server_spec, &g.server_spec);
                let node_spec = NodeSpec::merge(&self.node_spec, &g.node_spec);

                GroupSpec {
                    server_spec: cluster_extended,
                    group_name: group_name.clone(),
                    node_filter: NodeFilter::default_for(group_name),
                    roles: self.roles.union(&g.roles).cloned().collect(),
                    node_spec,
                    ..g.clone()
                }
            })
            .collect()
    }
}

/// Overlay an environment map onto a group: `E`'s node-keys, then `G`, then `E.groups[G]`, merged
/// left-to-right.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    pub node_spec: NodeSpec,
    pub phases: PhaseMap,
    pub groups: HashMap<String, GroupOverlay>,
}

#[derive(Clone, Debug, Default)]
pub struct GroupOverlay {
    pub phases: PhaseMap,
    pub node_spec: NodeSpec,
}

impl Environment {
    pub fn overlay(&self, group: &GroupSpec) -> GroupSpec {
        let env_base = ServerSpec {
            phases: self.phases.clone(),
            ..ServerSpec::default()
        };
        let mut merged_spec = ServerSpec::merge(&env_base, &group.server_spec);
        let mut node_spec = NodeSpec::merge(&self.node_spec, &group.node_spec);

        if let Some(group_overlay) = self.groups.get(&group.group_name) {
            let overlay_spec = ServerSpec {
                phases: group_overlay.phases.clone(),
                ..ServerSpec::default()
            };
            merged_spec = ServerSpec::merge(&merged_spec, &overlay_spec);
            node_spec = NodeSpec::merge(&node_spec, &group_overlay.node_spec);
        }

        GroupSpec {
            server_spec: merged_spec,
            node_spec,
            ..group.clone()
        }
    }
}

/// Which kind of target this is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetType {
    Node,
    Group,
}

/// The runtime record fed to the phase executor.
/// Targets are created per operation and never persist.
#[derive(Clone, Debug)]
pub struct Target {
    pub node: Option<NodeHandle>,
    pub group_name: String,
    pub group_names: HashSet<String>,
    pub phases: PhaseMap,
    pub default_phases: Vec<PhaseName>,
    pub roles: HashSet<String>,
    pub target_type: TargetType,
}

impl Target {
    pub fn id(&self) -> String {
        match &self.node {
            Some(node) => node.id().to_string(),
            None => format!("group:{}", self.group_name),
        }
    }

    pub fn phase(&self, name: &PhaseName) -> Option<&PhaseEntry> {
        self.phases.get(name)
    }
}

/// `{group, actual, target, delta, targets}`.
/// Derived, read-only.
#[derive(Clone, Debug)]
pub struct GroupDelta {
    pub group: GroupSpec,
    pub actual: usize,
    pub target: usize,
    pub delta: i64,
    pub targets: Vec<Arc<Target>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FnPlan;

    fn noop_plan() -> Arc<dyn PlanFn> {
        Arc::new(FnPlan(|_s| async move { Ok(serde_json::Value::Null) }))
    }

    #[test]
    fn default_phases_falls_back_to_configure() {
        let spec = ServerSpec::default().compose();
        assert_eq!(spec.default_phases, vec![PhaseName::new("configure")]);
    }

    #[test]
    fn extends_chain_merges_left_to_right_child_wins() {
        let mut parent = ServerSpec::default();
        parent
            .phases
            .insert(PhaseName::new("configure"), PhaseEntry {
                name: PhaseName::new("configure"),
                plan: noop_plan(),
                meta: PhaseMeta {
                    execution_settings: HashMap::from([("timeout".to_string(), serde_json::json!(10))]),
                    partition_hint: None,
                },
            });

        let mut child = ServerSpec {
            extends: vec![parent],
            ..Default::default()
        };
        child.phases.insert(PhaseName::new("bootstrap"), PhaseEntry {
            name: PhaseName::new("bootstrap"),
            plan: noop_plan(),
            meta: PhaseMeta::default(),
        });

        let composed = child.compose();
        assert!(composed.phases.contains_key(&PhaseName::new("configure")));
        assert!(composed.phases.contains_key(&PhaseName::new("bootstrap")));
    }

    #[test]
    fn roles_union_on_fold() {
        let a = GroupSpec::new("web").with_roles(["frontend"]);
        let b = GroupSpec::new("web").with_roles(["cache"]);
        let folded = GroupSpec::fold(&a, &b);
        assert_eq!(folded.roles.len(), 2);
        assert!(folded.roles.contains("frontend"));
        assert!(folded.roles.contains("cache"));
    }

    #[test]
    fn cluster_expansion_prefixes_group_names_and_unions_roles() {
        let cluster = ClusterSpec {
            name: "prod".to_string(),
            groups: vec![
                GroupSpec::new("web").with_count(1).with_roles(["frontend"]),
                GroupSpec::new("db").with_count(1),
            ],
            roles: HashSet::from(["prod-wide".to_string()]),
            ..Default::default()
        };

        let expanded = cluster.expand();
        let names: HashSet<_> = expanded.iter().map(|g| g.group_name.clone()).collect();
        assert!(names.contains("prod-web"));
        assert!(names.contains("prod-db"));

        let web = expanded.iter().find(|g| g.group_name == "prod-web").unwrap();
        assert!(web.roles.contains("frontend"));
        assert!(web.roles.contains("prod-wide"));
    }

    #[test]
    fn nested_group_count_multiplies_with_parent_count() {
        let shard = GroupSpec::new("shard").with_count(3);
        let parent = GroupSpec::new("cluster").with_count(2).with_nested([shard]);

        let expanded = parent.expand_nested_counts();
        assert_eq!(expanded.len(), 2);

        let parent_out = expanded.iter().find(|g| g.group_name == "cluster").unwrap();
        assert_eq!(parent_out.count, Some(2));
        assert!(parent_out.nested.is_empty());

        let shard_out = expanded.iter().find(|g| g.group_name == "cluster-shard").unwrap();
        assert_eq!(shard_out.count, Some(6));
    }

    #[test]
    fn cluster_group_phases_override_cluster_phases_on_collision() {
        let mut cluster_spec = ServerSpec::default();
        cluster_spec.phases.insert(PhaseName::new("configure"), PhaseEntry {
            name: PhaseName::new("configure"),
            plan: noop_plan(),
            meta: PhaseMeta {
                execution_settings: HashMap::from([("source".to_string(), serde_json::json!("cluster"))]),
                partition_hint: None,
            },
        });

        let mut group = GroupSpec::new("web").with_count(1);
        group.server_spec.phases.insert(PhaseName::new("configure"), PhaseEntry {
            name: PhaseName::new("configure"),
            plan: noop_plan(),
            meta: PhaseMeta {
                execution_settings: HashMap::from([("source".to_string(), serde_json::json!("group"))]),
                partition_hint: None,
            },
        });

        let cluster = ClusterSpec {
            name: "prod".to_string(),
            groups: vec![group],
            server_spec: cluster_spec,
            ..Default::default()
        };

        let expanded = cluster.expand();
        let web = &expanded[0];
        let configure = web.phases().get(&PhaseName::new("configure")).unwrap();
        assert_eq!(
            configure.meta.execution_settings.get("source"),
            Some(&serde_json::json!("group"))
        );
    }

    #[test]
    fn environment_overlay_merges_node_keys_then_group_then_group_overlay() {
        let env = Environment {
            node_spec: NodeSpec {
                image: Some("base-image".to_string()),
                ..Default::default()
            },
            groups: HashMap::from([(
                "web".to_string(),
                GroupOverlay {
                    node_spec: NodeSpec {
                        hardware_id: Some("big".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };

        let group = GroupSpec::new("web").with_node_spec(NodeSpec {
            network: Some("vpc-1".to_string()),
            ..Default::default()
        });

        let overlaid = env.overlay(&group);
        assert_eq!(overlaid.node_spec.image.as_deref(), Some("base-image"));
        assert_eq!(overlaid.node_spec.network.as_deref(), Some("vpc-1"));
        assert_eq!(overlaid.node_spec.hardware_id.as_deref(), Some("big"));
    }

    #[test]
    fn removal_selection_take_first_is_total_when_n_equals_len() {
        let node_spec = NodeSpec::default();
        let group = GroupSpec::new("web").with_node_spec(node_spec);
        let targets: Vec<Arc<Target>> = (0..3)
            .map(|i| {
                Arc::new(Target {
                    node: None,
                    group_name: group.group_name.clone(),
                    group_names: HashSet::from([group.group_name.clone()]),
                    phases: PhaseMap::new(),
                    default_phases: vec![],
                    roles: HashSet::new(),
                    target_type: TargetType::Node,
                })
            })
            .collect();

        let selected = RemovalSelectionFn::take_first().select(targets.len(), &targets);
        assert_eq!(selected.len(), targets.len());
    }
}
