//! Dependency resolution
//!
//! Builds an installation plan from a request and the tenant's installed
//! set. Every module gets the highest version satisfying all accumulated
//! range constraints; the loop re-accumulates until the selection stops
//! changing. Installed modules are fixed nodes unless listed as upgrades.
//!
//! The resulting plan is topologically ordered so dependencies always come
//! before their dependents.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::ModuleCatalog;
use crate::error::{ConflictError, Requirement};
use crate::model::{ModuleId, ModuleVersion};

const ROOT_REQUESTER: &str = "request";

/// What the orchestrator must do with a planned module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Install,
    Upgrade,
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub module_id: ModuleId,
    pub version: Version,
    pub action: PlanAction,
}

/// Topologically ordered resolution result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn entry(&self, module_id: &ModuleId) -> Option<&PlanEntry> {
        self.entries.iter().find(|entry| &entry.module_id == module_id)
    }

    /// Entries that install or upgrade something
    pub fn changes(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|entry| entry.action != PlanAction::Keep)
    }

    pub fn position(&self, module_id: &ModuleId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.module_id == module_id)
    }
}

/// Input to [`DependencyResolver::resolve_request`]
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub targets: Vec<(ModuleId, VersionReq)>,
    /// Tenant's committed installations
    pub installed: BTreeMap<ModuleId, Version>,
    /// Installed modules whose version may change
    pub upgrades: BTreeSet<ModuleId>,
    /// Optional dependencies the caller asked for explicitly
    pub requested_optional: BTreeSet<ModuleId>,
}

impl ResolveRequest {
    pub fn new(module_id: impl Into<ModuleId>, range: VersionReq) -> Self {
        Self {
            targets: vec![(module_id.into(), range)],
            ..Self::default()
        }
    }

    pub fn also(mut self, module_id: impl Into<ModuleId>, range: VersionReq) -> Self {
        self.targets.push((module_id.into(), range));
        self
    }

    pub fn with_installed(mut self, installed: BTreeMap<ModuleId, Version>) -> Self {
        self.installed = installed;
        self
    }

    pub fn upgrading(mut self, module_id: impl Into<ModuleId>) -> Self {
        self.upgrades.insert(module_id.into());
        self
    }

    pub fn with_optional(mut self, module_id: impl Into<ModuleId>) -> Self {
        self.requested_optional.insert(module_id.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Constraint {
    requester: String,
    range: VersionReq,
}

type Selection = BTreeMap<ModuleId, Version>;

pub struct DependencyResolver {
    catalog: Arc<dyn ModuleCatalog>,
}

impl DependencyResolver {
    pub fn new(catalog: Arc<dyn ModuleCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve a single target against the installed set
    ///
    /// # Errors
    ///
    /// See [`DependencyResolver::resolve_request`].
    pub fn resolve(
        &self,
        module_id: &ModuleId,
        range: &VersionReq,
        installed: &BTreeMap<ModuleId, Version>,
    ) -> Result<Plan, ConflictError> {
        self.resolve_request(
            &ResolveRequest::new(module_id.clone(), range.clone()).with_installed(installed.clone()),
        )
    }

    /// Resolve every target of `request` into one plan
    ///
    /// # Errors
    ///
    /// `CyclicDependency` when the selected graph has a cycle (checked before
    /// any version conflict is reported), `VersionConflict` when a module's
    /// accumulated ranges admit no published version, `ModuleNotFound` for
    /// unknown modules.
    pub fn resolve_request(&self, request: &ResolveRequest) -> Result<Plan, ConflictError> {
        let fixed: Selection = request
            .installed
            .iter()
            .filter(|(id, _)| !request.upgrades.contains(*id))
            .map(|(id, version)| (id.clone(), version.clone()))
            .collect();

        let mut selected = fixed.clone();
        let mut history: Vec<Selection> = Vec::new();

        loop {
            let constraints = self.constraints(request, &selected)?;
            let mut next = fixed.clone();
            // Reported only once the selection settles without a cycle
            let mut missing: Option<ModuleId> = None;

            for (module_id, requirements) in &constraints {
                if let Some(version) = fixed.get(module_id) {
                    if requirements.iter().all(|c| c.range.matches(version)) {
                        continue;
                    }
                    return Err(self.conflict(request, &selected, module_id, requirements));
                }

                let versions = self.catalog.versions(module_id);
                if versions.is_empty() {
                    missing.get_or_insert_with(|| module_id.clone());
                    continue;
                }
                match highest_satisfying(&versions, requirements) {
                    Some(version) => {
                        next.insert(module_id.clone(), version);
                    }
                    None => return Err(self.conflict(request, &selected, module_id, requirements)),
                }
            }

            if next == selected {
                if let Some(module_id) = missing {
                    if let Some(cycle) = self.graph(request, &selected).cycle() {
                        return Err(ConflictError::CyclicDependency { cycle });
                    }
                    return Err(ConflictError::ModuleNotFound(module_id));
                }
                return self.plan(request, &selected);
            }

            if history.contains(&next) {
                // Greedy selection keeps flipping between the same states
                let module_id = next
                    .iter()
                    .find(|(id, version)| selected.get(*id) != Some(*version))
                    .map(|(id, _)| id.clone())
                    .or_else(|| selected.keys().find(|id| !next.contains_key(*id)).cloned())
                    .unwrap_or_else(|| ModuleId::from(ROOT_REQUESTER));
                let requirements = constraints.get(&module_id).cloned().unwrap_or_default();
                return Err(self.conflict(request, &selected, &module_id, &requirements));
            }

            history.push(std::mem::replace(&mut selected, next));
        }
    }

    /// Accumulate every range placed on every module by the current selection
    fn constraints(
        &self,
        request: &ResolveRequest,
        selected: &Selection,
    ) -> Result<BTreeMap<ModuleId, Vec<Constraint>>, ConflictError> {
        let mut constraints: BTreeMap<ModuleId, Vec<Constraint>> = BTreeMap::new();
        for (module_id, range) in &request.targets {
            constraints.entry(module_id.clone()).or_default().push(Constraint {
                requester: ROOT_REQUESTER.to_string(),
                range: range.clone(),
            });
        }

        let mut optional = Vec::new();
        for (module_id, version) in selected {
            let release = self.release(module_id, version)?;
            let requester = release.label();
            for dependency in release.dependencies {
                let constraint = Constraint {
                    requester: requester.clone(),
                    range: dependency.range,
                };
                if dependency.optional {
                    optional.push((dependency.module_id, constraint));
                } else {
                    constraints.entry(dependency.module_id).or_default().push(constraint);
                }
            }
        }

        // Optional edges count once the module is in play for any other reason
        for (module_id, constraint) in optional {
            if constraints.contains_key(&module_id)
                || request.installed.contains_key(&module_id)
                || request.requested_optional.contains(&module_id)
            {
                constraints.entry(module_id).or_default().push(constraint);
            }
        }

        Ok(constraints)
    }

    fn release(&self, module_id: &ModuleId, version: &Version) -> Result<ModuleVersion, ConflictError> {
        self.catalog
            .version(module_id, version)
            .ok_or_else(|| ConflictError::ModuleNotFound(module_id.clone()))
    }

    fn conflict(
        &self,
        request: &ResolveRequest,
        selected: &Selection,
        module_id: &ModuleId,
        requirements: &[Constraint],
    ) -> ConflictError {
        let graph = self.graph(request, selected);
        if let Some(cycle) = graph.cycle() {
            return ConflictError::CyclicDependency { cycle };
        }

        debug!(module = %module_id, requesters = requirements.len(), "Unsatisfiable version ranges");
        ConflictError::VersionConflict {
            module_id: module_id.clone(),
            requirements: requirements
                .iter()
                .map(|c| Requirement {
                    requester: c.requester.clone(),
                    range: c.range.to_string(),
                })
                .collect(),
        }
    }

    fn plan(&self, request: &ResolveRequest, selected: &Selection) -> Result<Plan, ConflictError> {
        let graph = self.graph(request, selected);
        if let Some(cycle) = graph.cycle() {
            return Err(ConflictError::CyclicDependency { cycle });
        }

        let order = toposort(&graph.graph, None).map_err(|cycle| ConflictError::CyclicDependency {
            cycle: vec![graph.label(cycle.node_id())],
        })?;

        let mut entries = Vec::with_capacity(order.len());
        for node in order {
            let Some(module_id) = graph.graph.node_weight(node) else {
                continue;
            };
            let Some(version) = selected.get(module_id) else {
                continue;
            };
            let action = match request.installed.get(module_id) {
                None => PlanAction::Install,
                Some(installed) if installed != version => PlanAction::Upgrade,
                Some(_) => PlanAction::Keep,
            };
            entries.push(PlanEntry {
                module_id: module_id.clone(),
                version: version.clone(),
                action,
            });
        }

        debug!(entries = entries.len(), "Plan resolved");
        Ok(Plan { entries })
    }

    /// Graph of selected modules reachable from the targets, edges pointing
    /// from a dependency to its dependent
    fn graph(&self, request: &ResolveRequest, selected: &Selection) -> DependencyGraph {
        let mut requires: BTreeMap<ModuleId, BTreeSet<ModuleId>> = BTreeMap::new();
        for (module_id, version) in selected {
            let deps = self
                .catalog
                .version(module_id, version)
                .map(|release| {
                    release
                        .dependencies
                        .into_iter()
                        .map(|dep| dep.module_id)
                        .filter(|dep| selected.contains_key(dep))
                        .collect()
                })
                .unwrap_or_default();
            requires.insert(module_id.clone(), deps);
        }

        let mut reachable = BTreeSet::new();
        let mut queue: VecDeque<ModuleId> = request
            .targets
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| selected.contains_key(id))
            .collect();
        while let Some(module_id) = queue.pop_front() {
            if !reachable.insert(module_id.clone()) {
                continue;
            }
            if let Some(deps) = requires.get(&module_id) {
                queue.extend(deps.iter().cloned());
            }
        }

        let mut graph = DiGraph::new();
        let mut index: BTreeMap<ModuleId, NodeIndex> = BTreeMap::new();
        for module_id in &reachable {
            index.insert(module_id.clone(), graph.add_node(module_id.clone()));
        }
        for module_id in &reachable {
            let (Some(&dependent), Some(deps)) = (index.get(module_id), requires.get(module_id)) else {
                continue;
            };
            for dep in deps {
                if let Some(&dependency) = index.get(dep) {
                    graph.add_edge(dependency, dependent, ());
                }
            }
        }

        DependencyGraph {
            graph,
            versions: selected.clone(),
        }
    }
}

struct DependencyGraph {
    graph: DiGraph<ModuleId, ()>,
    versions: Selection,
}

impl DependencyGraph {
    fn label(&self, node: NodeIndex) -> String {
        match self.graph.node_weight(node) {
            Some(module_id) => match self.versions.get(module_id) {
                Some(version) => format!("{module_id}@{version}"),
                None => module_id.to_string(),
            },
            None => String::new(),
        }
    }

    /// Nodes of the first strongly connected component that forms a cycle
    fn cycle(&self) -> Option<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| match component.as_slice() {
                [single] => self.graph.contains_edge(*single, *single),
                _ => true,
            })
            .map(|component| {
                let mut names: Vec<String> = component.into_iter().map(|node| self.label(node)).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles.into_iter().next()
    }
}

fn highest_satisfying(versions: &[ModuleVersion], requirements: &[Constraint]) -> Option<Version> {
    versions
        .iter()
        .map(|release| &release.version)
        .filter(|version| requirements.iter().all(|c| c.range.matches(version)))
        .max_by(|a, b| {
            a.cmp_precedence(b)
                .then_with(|| a.to_string().cmp(&b.to_string()))
        })
        .cloned()
}
