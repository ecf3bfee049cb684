//! Cross-root dependency propagation.
//!
//! Given the types a pass changed in one root, [`DependencyResolver::find_dependent`]
//! works out which files of which roots have to be recompiled, in dependency order,
//! and which roots are only marked dirty for a later full scan.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use url::Url;

use strata_core::{ProjectId, RootUrl, TrackingMode, TypeHandle};

use crate::class_index::ClassIndexProvider;

/// The root dependency graph maintained by the scheduler.
pub trait RootGraph: Send + Sync {
    /// Every known root.
    fn roots(&self) -> Vec<RootUrl>;

    /// Roots that `root` depends on directly.
    fn dependencies(&self, root: &RootUrl) -> Vec<RootUrl>;

    /// Roots compiled together with `root` (e.g. main and test sources of one module).
    fn peers(&self, root: &RootUrl) -> Vec<RootUrl> {
        let _ = root;
        Vec::new()
    }

    fn owning_project(&self, root: &RootUrl) -> Option<ProjectId> {
        let _ = root;
        None
    }

    /// Whether `root` only holds annotation processor output.
    fn is_processor_output(&self, root: &RootUrl) -> bool {
        let _ = root;
        false
    }
}

/// A [`RootGraph`] built up front.
#[derive(Clone, Debug, Default)]
pub struct StaticRootGraph {
    roots: Vec<RootUrl>,
    dependencies: HashMap<RootUrl, Vec<RootUrl>>,
    peers: HashMap<RootUrl, Vec<RootUrl>>,
    projects: HashMap<RootUrl, ProjectId>,
    processor_output: HashSet<RootUrl>,
}

impl StaticRootGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, root: RootUrl) -> &mut Self {
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
        self
    }

    /// Record that `root` depends on `dependency`.
    pub fn add_dependency(&mut self, root: RootUrl, dependency: RootUrl) -> &mut Self {
        self.add_root(root.clone());
        self.add_root(dependency.clone());
        let deps = self.dependencies.entry(root).or_default();
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
        self
    }

    /// Record `a` and `b` as peers of each other.
    pub fn add_peers(&mut self, a: RootUrl, b: RootUrl) -> &mut Self {
        self.add_root(a.clone());
        self.add_root(b.clone());
        self.peers.entry(a.clone()).or_default().push(b.clone());
        self.peers.entry(b).or_default().push(a);
        self
    }

    pub fn set_project(&mut self, root: RootUrl, project: ProjectId) -> &mut Self {
        self.add_root(root.clone());
        self.projects.insert(root, project);
        self
    }

    pub fn set_processor_output(&mut self, root: RootUrl) -> &mut Self {
        self.add_root(root.clone());
        self.processor_output.insert(root);
        self
    }
}

impl RootGraph for StaticRootGraph {
    fn roots(&self) -> Vec<RootUrl> {
        self.roots.clone()
    }

    fn dependencies(&self, root: &RootUrl) -> Vec<RootUrl> {
        self.dependencies.get(root).cloned().unwrap_or_default()
    }

    fn peers(&self, root: &RootUrl) -> Vec<RootUrl> {
        self.peers.get(root).cloned().unwrap_or_default()
    }

    fn owning_project(&self, root: &RootUrl) -> Option<ProjectId> {
        self.projects.get(root).cloned()
    }

    fn is_processor_output(&self, root: &RootUrl) -> bool {
        self.processor_output.contains(root)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle among {} roots", .cycles.iter().map(Vec::len).sum::<usize>())]
pub struct CycleError {
    /// Every node, cycles collapsed into adjacent runs, otherwise in dependency order.
    pub partial: Vec<RootUrl>,
    pub cycles: Vec<Vec<RootUrl>>,
}

/// Order `nodes` so that each node comes before every node it has an edge to.
///
/// Edges leaving `nodes` are ignored. Ties keep the input order.
pub fn topological_sort(
    nodes: &[RootUrl],
    edges: &HashMap<RootUrl, Vec<RootUrl>>,
) -> Result<Vec<RootUrl>, CycleError> {
    let position: HashMap<&RootUrl, usize> =
        nodes.iter().enumerate().map(|(idx, node)| (node, idx)).collect();
    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .map(|node| {
            edges
                .get(node)
                .into_iter()
                .flatten()
                .filter_map(|succ| position.get(succ).copied())
                .collect()
        })
        .collect();

    let mut tarjan = Tarjan::new(&successors);
    for node in 0..nodes.len() {
        if tarjan.index[node].is_none() {
            tarjan.visit(node);
        }
    }

    // Tarjan emits a component only after everything reachable from it.
    let mut components = tarjan.components;
    components.reverse();
    let mut order = Vec::with_capacity(nodes.len());
    let mut cycles = Vec::new();
    for mut component in components {
        component.sort_unstable();
        let self_loop = component.len() == 1 && successors[component[0]].contains(&component[0]);
        if component.len() > 1 || self_loop {
            cycles.push(component.iter().map(|&idx| nodes[idx].clone()).collect());
        }
        order.extend(component.into_iter().map(|idx| nodes[idx].clone()));
    }
    if cycles.is_empty() {
        Ok(order)
    } else {
        Err(CycleError {
            partial: order,
            cycles,
        })
    }
}

struct Tarjan<'a> {
    successors: &'a [Vec<usize>],
    next_index: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(successors: &'a [Vec<usize>]) -> Self {
        let len = successors.len();
        Self {
            successors,
            next_index: 0,
            index: vec![None; len],
            lowlink: vec![0; len],
            on_stack: vec![false; len],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, node: usize) {
        self.index[node] = Some(self.next_index);
        self.lowlink[node] = self.next_index;
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        let successors = self.successors;
        for &succ in &successors[node] {
            match self.index[succ] {
                None => {
                    self.visit(succ);
                    self.lowlink[node] = self.lowlink[node].min(self.lowlink[succ]);
                }
                Some(succ_index) if self.on_stack[succ] => {
                    self.lowlink[node] = self.lowlink[node].min(succ_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[node]) == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/// Input of [`DependencyResolver::find_dependent`].
#[derive(Clone, Debug)]
pub struct DependencyQuery {
    pub root: RootUrl,
    /// Types whose shape changed; their implementors are followed transitively.
    pub changed: BTreeSet<TypeHandle>,
    /// Types that no longer exist; only their direct users are affected.
    pub removed: BTreeSet<TypeHandle>,
    /// Also revisit files that failed to compile, since new types may fix them.
    pub include_error_files: bool,
    pub include_current_root: bool,
}

impl DependencyQuery {
    pub fn new(root: RootUrl) -> Self {
        Self {
            root,
            changed: BTreeSet::new(),
            removed: BTreeSet::new(),
            include_error_files: false,
            include_current_root: true,
        }
    }

    pub fn changed(mut self, types: impl IntoIterator<Item = TypeHandle>) -> Self {
        self.changed.extend(types);
        self
    }

    pub fn removed(mut self, types: impl IntoIterator<Item = TypeHandle>) -> Self {
        self.removed.extend(types);
        self
    }

    pub fn include_error_files(mut self, include: bool) -> Self {
        self.include_error_files = include;
        self
    }

    pub fn include_current_root(mut self, include: bool) -> Self {
        self.include_current_root = include;
        self
    }
}

/// Output of [`DependencyResolver::find_dependent`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependents {
    /// Files to recompile, per root, in dependency order. Never holds an empty set.
    pub files: IndexMap<RootUrl, BTreeSet<Url>>,
    /// Roots that must be marked dirty and are left to the next full scan.
    pub deferred: BTreeSet<RootUrl>,
}

impl Dependents {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deferred.is_empty()
    }

    /// Add `other` to this result, keeping the order roots were first seen in.
    pub fn merge(&mut self, other: Dependents) {
        for (root, files) in other.files {
            if !files.is_empty() {
                self.files.entry(root).or_default().extend(files);
            }
        }
        self.deferred.extend(other.deferred);
    }
}

#[derive(Clone, Debug, Default)]
struct Bases {
    expanded: BTreeSet<TypeHandle>,
    removed: BTreeSet<TypeHandle>,
}

pub struct DependencyResolver<'a> {
    graph: &'a dyn RootGraph,
    indexes: &'a dyn ClassIndexProvider,
    mode: TrackingMode,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        graph: &'a dyn RootGraph,
        indexes: &'a dyn ClassIndexProvider,
        mode: TrackingMode,
    ) -> Self {
        Self {
            graph,
            indexes,
            mode,
        }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn find_dependent(&self, query: &DependencyQuery) -> Dependents {
        let changed: BTreeSet<TypeHandle> = query
            .changed
            .iter()
            .filter(|ty| !ty.is_anonymous())
            .cloned()
            .collect();
        let removed: BTreeSet<TypeHandle> = query
            .removed
            .iter()
            .filter(|ty| !ty.is_anonymous())
            .cloned()
            .collect();
        let mut out = Dependents::default();
        if changed.is_empty() && removed.is_empty() && !query.include_error_files {
            return out;
        }

        let root = &query.root;
        let inverse = self.inverse_dependencies();
        let Some(order) = self.roots_to_examine(root, &inverse, &mut out.deferred) else {
            return out;
        };

        let mut queue: VecDeque<TypeHandle> = changed.into_iter().collect();
        let mut pending_removed = removed;
        let mut bases: HashMap<RootUrl, Bases> = HashMap::new();
        for dep_root in &order {
            let Some(index) = self.indexes.class_index(dep_root) else {
                tracing::trace!(
                    target = "strata.index",
                    root = %dep_root,
                    "no class index, skipping dependent root"
                );
                continue;
            };

            let mut removed = std::mem::take(&mut pending_removed);
            for upstream in self
                .graph
                .dependencies(dep_root)
                .into_iter()
                .chain(self.graph.peers(dep_root))
            {
                if let Some(upstream) = bases.get(&upstream) {
                    queue.extend(upstream.expanded.iter().cloned());
                    removed.extend(upstream.removed.iter().cloned());
                }
            }

            let mut expanded = BTreeSet::new();
            while let Some(ty) = queue.pop_front() {
                if expanded.insert(ty.clone()) {
                    queue.extend(index.implementors(&ty));
                }
            }

            if dep_root != root || query.include_current_root {
                let mut files: BTreeSet<Url> = expanded
                    .iter()
                    .chain(removed.iter())
                    .flat_map(|ty| index.resources(ty))
                    .collect();
                if query.include_error_files {
                    files.extend(index.files_in_error());
                }
                if !files.is_empty() {
                    out.files.insert(dep_root.clone(), files);
                }
            }
            bases.insert(dep_root.clone(), Bases { expanded, removed });
        }

        tracing::debug!(
            target = "strata.index",
            root = %root,
            mode = ?self.mode,
            roots = out.files.len(),
            files = out.files.values().map(BTreeSet::len).sum::<usize>(),
            deferred = out.deferred.len(),
            "dependency propagation finished"
        );
        out
    }

    fn inverse_dependencies(&self) -> HashMap<RootUrl, Vec<RootUrl>> {
        let mut inverse: HashMap<RootUrl, Vec<RootUrl>> = HashMap::new();
        for root in self.graph.roots() {
            for dep in self.graph.dependencies(&root) {
                inverse.entry(dep).or_default().push(root.clone());
            }
        }
        inverse
    }

    /// Roots to examine in order, or `None` when everything is deferred.
    fn roots_to_examine(
        &self,
        root: &RootUrl,
        inverse: &HashMap<RootUrl, Vec<RootUrl>>,
        deferred: &mut BTreeSet<RootUrl>,
    ) -> Option<Vec<RootUrl>> {
        let dependents = transitive_dependents(root, inverse, |_| true);
        let candidates = match self.mode {
            TrackingMode::Disabled => {
                if dependents.is_empty() {
                    deferred.insert(root.clone());
                } else {
                    deferred.extend(dependents);
                }
                return None;
            }
            TrackingMode::WithinRoot => {
                deferred.extend(dependents);
                vec![root.clone()]
            }
            TrackingMode::WithinProject => {
                let project = self.graph.owning_project(root);
                let same_project = |candidate: &RootUrl| {
                    let owner = self.graph.owning_project(candidate);
                    owner.is_none() || owner == project
                };
                let examined = transitive_dependents(root, inverse, same_project);
                deferred.extend(
                    dependents
                        .into_iter()
                        .filter(|candidate| !examined.contains(candidate)),
                );
                std::iter::once(root.clone()).chain(examined).collect()
            }
            TrackingMode::Enabled => std::iter::once(root.clone()).chain(dependents).collect(),
        };

        let mut order = if candidates.len() == 1 {
            candidates
        } else {
            match topological_sort(&candidates, inverse) {
                Ok(order) => order,
                Err(err) => {
                    tracing::warn!(
                        target = "strata.index",
                        root = %root,
                        cycles = ?err.cycles,
                        "cyclic root dependencies, using partial order"
                    );
                    let allowed: BTreeSet<&RootUrl> = candidates.iter().collect();
                    err.partial
                        .iter()
                        .filter(|node| allowed.contains(node))
                        .cloned()
                        .collect()
                }
            }
        };

        let mut insert_at = order
            .iter()
            .position(|candidate| candidate == root)
            .map_or(order.len(), |idx| idx + 1);
        for peer in self.graph.peers(root) {
            if !order.contains(&peer) {
                order.insert(insert_at, peer);
                insert_at += 1;
            }
        }
        Some(order)
    }
}

/// Roots that transitively depend on `root`, stopping at roots rejected by `follow`.
fn transitive_dependents(
    root: &RootUrl,
    inverse: &HashMap<RootUrl, Vec<RootUrl>>,
    follow: impl Fn(&RootUrl) -> bool,
) -> Vec<RootUrl> {
    let mut seen: BTreeSet<RootUrl> = BTreeSet::new();
    let mut out = Vec::new();
    let mut queue: VecDeque<&RootUrl> = VecDeque::from([root]);
    while let Some(next) = queue.pop_front() {
        for dependent in inverse.get(next).into_iter().flatten() {
            if dependent == root || seen.contains(dependent) || !follow(dependent) {
                continue;
            }
            seen.insert(dependent.clone());
            out.push(dependent.clone());
            queue.push_back(dependent);
        }
    }
    out
}
