//! Dependency resolution over the `connect` maps of defined modules.
//!
//! Graphs map a module to the set of modules it depends on (forward) or to the set of
//! modules depending on it (reverse). They are recomputed on every call; nothing here
//! is cached because definitions may change between calls.
//!
//! Ordering is deterministic: graphs are `IndexMap`s filled in discovery order, and
//! `toposort` always emits the first ready node in that order.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::descriptor::{BaseMap, ModuleBase, ModuleDescriptor, ModuleId};

pub type DependencyGraph = IndexMap<ModuleId, IndexSet<ModuleId>>;
pub type DefinedModules = BaseMap<Arc<ModuleDescriptor>>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module '{module}' is not defined")]
    UnknownModule { module: ModuleId },
    #[error("no module named '{name}' is defined in any base")]
    UnknownName { name: String },
    #[error("module name '{name}' is ambiguous, defined in {bases:?}")]
    AmbiguousName { name: String, bases: Vec<ModuleBase> },
    #[error("connector '{connector}' of '{module}' points to unknown module '{target}'")]
    UnknownTarget {
        module: ModuleId,
        connector: String,
        target: String,
    },
    #[error(
        "connector '{connector}' of '{module}' points to '{target}', which is defined in {bases:?}"
    )]
    AmbiguousTarget {
        module: ModuleId,
        connector: String,
        target: String,
        bases: Vec<ModuleBase>,
    },
    #[error("dependency cycle between modules: {}", format_ids(.members))]
    Cycle { members: Vec<ModuleId> },
}

fn format_ids(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of a graph walk. Invalid edges are reported in `errors` and left out of `graph`;
/// whatever could be resolved is still returned.
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    pub graph: DependencyGraph,
    pub errors: Vec<ResolveError>,
}

impl Resolution {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// The graph, or every error collected while building it.
    ///
    /// # Errors
    /// Returns the collected errors if any edge could not be resolved.
    pub fn into_result(self) -> Result<DependencyGraph, Vec<ResolveError>> {
        if self.errors.is_empty() {
            Ok(self.graph)
        } else {
            Err(self.errors)
        }
    }
}

/// Find the single module called `name`, whatever its base.
///
/// # Errors
/// Returns `UnknownName` if no base defines it and `AmbiguousName` if several do.
pub fn find_by_name(defined: &DefinedModules, name: &str) -> Result<ModuleId, ResolveError> {
    match defined.bases_of(name).as_slice() {
        [] => Err(ResolveError::UnknownName {
            name: name.to_owned(),
        }),
        [base] => Ok(ModuleId::new(*base, name)),
        bases => Err(ResolveError::AmbiguousName {
            name: name.to_owned(),
            bases: bases.to_vec(),
        }),
    }
}

fn resolve_edge(
    defined: &DefinedModules,
    module: &ModuleId,
    connector: &str,
    target: &str,
) -> Result<ModuleId, ResolveError> {
    find_by_name(defined, target).map_err(|e| match e {
        ResolveError::AmbiguousName { bases, .. } => ResolveError::AmbiguousTarget {
            module: module.clone(),
            connector: connector.to_owned(),
            target: target.to_owned(),
            bases,
        },
        _ => ResolveError::UnknownTarget {
            module: module.clone(),
            connector: connector.to_owned(),
            target: target.to_owned(),
        },
    })
}

/// Direct dependencies of one module, with per-edge errors.
fn direct_dependencies(
    defined: &DefinedModules,
    id: &ModuleId,
    desc: &ModuleDescriptor,
    errors: &mut Vec<ResolveError>,
) -> IndexSet<ModuleId> {
    let mut deps = IndexSet::new();
    for (connector, target) in &desc.connections {
        match resolve_edge(defined, id, connector, target) {
            Ok(dep) => {
                deps.insert(dep);
            }
            Err(e) => errors.push(e),
        }
    }
    deps
}

/// Transitive `module -> {dependencies}` graph rooted at `root`. The root and every
/// reachable leaf appear as keys.
#[must_use]
pub fn forward_dependencies(defined: &DefinedModules, root: &ModuleId) -> Resolution {
    let mut res = Resolution::default();
    if !defined.contains(root) {
        res.errors.push(ResolveError::UnknownModule {
            module: root.clone(),
        });
        return res;
    }

    let mut stack = vec![root.clone()];
    while let Some(id) = stack.pop() {
        if res.graph.contains_key(&id) {
            continue;
        }
        let Some(desc) = defined.get(&id) else {
            continue;
        };
        let deps = direct_dependencies(defined, &id, desc, &mut res.errors);
        // reversed so that the first declared connector is walked first
        for dep in deps.iter().rev() {
            if !res.graph.contains_key(dep) {
                stack.push(dep.clone());
            }
        }
        res.graph.insert(id, deps);
    }
    res
}

/// Transitive `module -> {dependents}` graph rooted at `target`: everything that would
/// break if `target` stopped.
#[must_use]
pub fn reverse_dependencies(defined: &DefinedModules, target: &ModuleId) -> Resolution {
    let mut res = Resolution::default();
    if !defined.contains(target) {
        res.errors.push(ResolveError::UnknownModule {
            module: target.clone(),
        });
        return res;
    }

    // invert every resolvable edge once
    let mut dependents: IndexMap<ModuleId, IndexSet<ModuleId>> = IndexMap::new();
    for (id, desc) in defined.iter() {
        let mut ignored = Vec::new();
        for dep in direct_dependencies(defined, &id, desc, &mut ignored) {
            dependents.entry(dep).or_default().insert(id.clone());
        }
    }

    let mut stack = vec![target.clone()];
    while let Some(id) = stack.pop() {
        if res.graph.contains_key(&id) {
            continue;
        }
        let users = dependents.get(&id).cloned().unwrap_or_default();
        for user in users.iter().rev() {
            if !res.graph.contains_key(user) {
                stack.push(user.clone());
            }
        }
        res.graph.insert(id, users);
    }
    res
}

/// Forward graph restricted to `ids`: edges leaving the set are dropped.
#[must_use]
pub fn graph_of(defined: &DefinedModules, ids: &IndexSet<ModuleId>) -> Resolution {
    let mut res = Resolution::default();
    for id in ids {
        let Some(desc) = defined.get(id) else {
            res.errors.push(ResolveError::UnknownModule { module: id.clone() });
            continue;
        };
        let deps = direct_dependencies(defined, id, desc, &mut res.errors)
            .into_iter()
            .filter(|d| ids.contains(d))
            .collect();
        res.graph.insert(id.clone(), deps);
    }
    res
}

/// Swap edge direction, keeping every node.
#[must_use]
pub fn invert(graph: &DependencyGraph) -> DependencyGraph {
    let mut inverted: DependencyGraph = graph.keys().map(|k| (k.clone(), IndexSet::new())).collect();
    for (node, deps) in graph {
        for dep in deps {
            inverted.entry(dep.clone()).or_default().insert(node.clone());
        }
    }
    inverted
}

/// Kahn's algorithm over a `module -> {dependencies}` map. Dependencies first.
///
/// Each round emits the first node, in input order, whose dependencies were all emitted.
/// Dependencies that are not keys of `graph` are treated as already satisfied.
///
/// # Errors
/// Returns `ResolveError::Cycle` naming every node left over once no node is ready.
pub fn toposort(graph: &DependencyGraph) -> Result<Vec<ModuleId>, ResolveError> {
    let mut remaining: IndexMap<&ModuleId, usize> = graph
        .iter()
        .map(|(node, deps)| (node, deps.iter().filter(|d| graph.contains_key(*d)).count()))
        .collect();
    let dependents = invert(graph);
    let mut order = Vec::with_capacity(graph.len());

    loop {
        let Some(ready) = remaining
            .iter()
            .find(|(_, pending)| **pending == 0)
            .map(|(node, _)| *node)
        else {
            break;
        };
        remaining.shift_remove(ready);
        if let Some(users) = dependents.get(ready) {
            for user in users {
                if let Some(pending) = remaining.get_mut(user) {
                    *pending = pending.saturating_sub(1);
                }
            }
        }
        order.push(ready.clone());
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(ResolveError::Cycle {
            members: remaining.keys().map(|id| (*id).clone()).collect(),
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn hw(name: &str) -> ModuleId {
        ModuleId::new(ModuleBase::Hardware, name)
    }
    fn logic(name: &str) -> ModuleId {
        ModuleId::new(ModuleBase::Logic, name)
    }
    fn gui(name: &str) -> ModuleId {
        ModuleId::new(ModuleBase::Gui, name)
    }

    fn define(defined: &mut DefinedModules, desc: ModuleDescriptor) {
        let id = desc.id();
        defined.insert(&id, Arc::new(desc));
    }

    fn scenario() -> DefinedModules {
        let mut d = DefinedModules::default();
        define(&mut d, ModuleDescriptor::local(ModuleBase::Hardware, "counter", "dummy.Counter"));
        define(
            &mut d,
            ModuleDescriptor::local(ModuleBase::Logic, "logic1", "dummy.Logic")
                .with_connection("counter", "counter"),
        );
        define(
            &mut d,
            ModuleDescriptor::local(ModuleBase::Gui, "gui1", "dummy.Gui")
                .with_connection("logic", "logic1"),
        );
        d
    }

    #[test]
    fn forward_order_is_dependencies_first() {
        let d = scenario();
        let res = forward_dependencies(&d, &gui("gui1"));
        assert!(res.is_complete());
        assert_eq!(res.graph.len(), 3);
        assert!(res.graph[&hw("counter")].is_empty());

        let order = toposort(&res.graph).unwrap();
        assert_eq!(order, vec![hw("counter"), logic("logic1"), gui("gui1")]);
    }

    #[test]
    fn stop_order_is_reverse_of_start_order() {
        let d = scenario();
        let start = toposort(&forward_dependencies(&d, &gui("gui1")).graph).unwrap();

        let reverse = reverse_dependencies(&d, &hw("counter"));
        assert!(reverse.is_complete());
        let ids: IndexSet<ModuleId> = start.iter().cloned().collect();
        let restricted: DependencyGraph = reverse
            .graph
            .into_iter()
            .filter(|(k, _)| ids.contains(k))
            .collect();
        let stop = toposort(&restricted).unwrap();

        let mut expected = start;
        expected.reverse();
        assert_eq!(stop, expected);
    }

    #[test]
    fn unknown_and_ambiguous_targets_are_reported_per_edge() {
        let mut d = scenario();
        define(&mut d, ModuleDescriptor::local(ModuleBase::Hardware, "dup", "dummy.Counter"));
        define(&mut d, ModuleDescriptor::local(ModuleBase::Logic, "dup", "dummy.Other"));
        define(
            &mut d,
            ModuleDescriptor::local(ModuleBase::Logic, "broken", "dummy.Logic")
                .with_connection("a", "dup")
                .with_connection("b", "nowhere")
                .with_connection("c", "logic1"),
        );

        let res = forward_dependencies(&d, &logic("broken"));
        assert_eq!(res.errors.len(), 2);
        assert!(matches!(res.errors[0], ResolveError::AmbiguousTarget { ref connector, .. } if connector == "a"));
        assert!(matches!(res.errors[1], ResolveError::UnknownTarget { ref target, .. } if target == "nowhere"));
        // the valid branch is still walked
        assert!(res.graph[&logic("broken")].contains(&logic("logic1")));
        assert!(res.graph.contains_key(&logic("logic1")));
        assert!(res.into_result().is_err());
    }

    #[test]
    fn cycles_are_reported_with_members() {
        let mut d = DefinedModules::default();
        define(
            &mut d,
            ModuleDescriptor::local(ModuleBase::Logic, "a", "x.A").with_connection("next", "b"),
        );
        define(
            &mut d,
            ModuleDescriptor::local(ModuleBase::Logic, "b", "x.B").with_connection("next", "a"),
        );
        define(&mut d, ModuleDescriptor::local(ModuleBase::Hardware, "c", "x.C"));

        let res = forward_dependencies(&d, &logic("a"));
        let err = toposort(&res.graph).unwrap_err();
        let ResolveError::Cycle { members } = err else {
            panic!("expected a cycle");
        };
        assert!(members.contains(&logic("a")));
        assert!(members.contains(&logic("b")));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut g = DependencyGraph::new();
        g.insert(hw("z"), IndexSet::new());
        g.insert(logic("top"), [hw("z"), hw("a")].into_iter().collect());
        g.insert(hw("a"), IndexSet::new());
        assert_eq!(toposort(&g).unwrap(), vec![hw("z"), hw("a"), logic("top")]);
    }

    #[test]
    fn graph_of_drops_edges_leaving_the_set() {
        let d = scenario();
        let ids: IndexSet<ModuleId> = [logic("logic1"), gui("gui1")].into_iter().collect();
        let res = graph_of(&d, &ids);
        assert!(res.graph[&logic("logic1")].is_empty());
        assert_eq!(
            toposort(&res.graph).unwrap(),
            vec![logic("logic1"), gui("gui1")]
        );
    }

    #[test]
    fn find_by_name_rejects_ambiguity() {
        let mut d = scenario();
        define(&mut d, ModuleDescriptor::local(ModuleBase::Gui, "counter", "x.C"));
        assert!(matches!(
            find_by_name(&d, "counter"),
            Err(ResolveError::AmbiguousName { .. })
        ));
        assert_eq!(find_by_name(&d, "logic1").unwrap(), logic("logic1"));
        assert!(matches!(
            find_by_name(&d, "ghost"),
            Err(ResolveError::UnknownName { .. })
        ));
    }
}
