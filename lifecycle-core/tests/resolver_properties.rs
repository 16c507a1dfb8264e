//! Property tests for dependency resolution over generated catalogs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use lifecycle_core::*;
use proptest::prelude::*;
use semver::{Version, VersionReq};

fn name(index: usize) -> String {
    format!("m{index:02}")
}

/// Acyclic catalog: module `i` may only depend on modules `< i`
fn dag() -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (2usize..12).prop_flat_map(|size| {
        (0..size)
            .map(|index| proptest::collection::btree_set(0..index.max(1), 0..=index.min(3)))
            .collect::<Vec<_>>()
            .prop_map(|sets| {
                sets.into_iter()
                    .enumerate()
                    .map(|(index, deps)| deps.into_iter().filter(|dep| *dep < index).collect())
                    .collect()
            })
    })
}

fn catalog_for(edges: &[BTreeSet<usize>]) -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    for (index, deps) in edges.iter().enumerate() {
        let mut release = ModuleVersion::new(name(index), Version::new(1, 0, 0), format!("hash-{index}"));
        for dep in deps {
            release = release.with_dependency(DependencySpec::required(name(*dep), VersionReq::STAR));
        }
        catalog.publish_version(release).unwrap();
    }
    catalog
}

fn reachable(edges: &[BTreeSet<usize>], from: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(index) = stack.pop() {
        if seen.insert(index) {
            stack.extend(edges[index].iter().copied());
        }
    }
    seen
}

proptest! {
    #[test]
    fn plan_orders_dependencies_first(edges in dag()) {
        let target = edges.len() - 1;
        let resolver = DependencyResolver::new(Arc::new(catalog_for(&edges)));
        let plan = resolver
            .resolve(&ModuleId::from(name(target)), &VersionReq::STAR, &BTreeMap::new())
            .unwrap();

        let planned: BTreeSet<String> = plan.entries.iter().map(|entry| entry.module_id.to_string()).collect();
        let expected: BTreeSet<String> = reachable(&edges, target).into_iter().map(name).collect();
        prop_assert_eq!(planned, expected);

        for (index, deps) in edges.iter().enumerate() {
            let Some(position) = plan.position(&ModuleId::from(name(index))) else { continue };
            for dep in deps {
                let dep_position = plan.position(&ModuleId::from(name(*dep)));
                prop_assert!(dep_position.is_some_and(|dep_position| dep_position < position));
            }
        }
        prop_assert!(plan.entries.iter().all(|entry| entry.action == PlanAction::Install));
    }

    #[test]
    fn installed_modules_are_kept(edges in dag()) {
        let target = edges.len() - 1;
        let installed: BTreeMap<ModuleId, Version> = (0..target)
            .step_by(2)
            .map(|index| (ModuleId::from(name(index)), Version::new(1, 0, 0)))
            .collect();
        let resolver = DependencyResolver::new(Arc::new(catalog_for(&edges)));
        let plan = resolver
            .resolve(&ModuleId::from(name(target)), &VersionReq::STAR, &installed)
            .unwrap();

        for entry in &plan.entries {
            let expected = if installed.contains_key(&entry.module_id) {
                PlanAction::Keep
            } else {
                PlanAction::Install
            };
            prop_assert_eq!(entry.action, expected);
        }
    }

    #[test]
    fn cycles_name_every_member(length in 1usize..8) {
        let catalog = InMemoryCatalog::new();
        for index in 0..length {
            let next = (index + 1) % length;
            catalog
                .publish_version(
                    ModuleVersion::new(name(index), Version::new(1, 0, 0), format!("hash-{index}"))
                        .with_dependency(DependencySpec::required(name(next), VersionReq::STAR)),
                )
                .unwrap();
        }

        let error = DependencyResolver::new(Arc::new(catalog))
            .resolve(&ModuleId::from(name(0)), &VersionReq::STAR, &BTreeMap::new())
            .unwrap_err();
        let expected: Vec<String> = (0..length).map(|index| format!("{}@1.0.0", name(index))).collect();
        prop_assert_eq!(error, ConflictError::CyclicDependency { cycle: expected });
    }

    #[test]
    fn cycles_outrank_unknown_modules(length in 1usize..8, orphan in 0usize..8) {
        let orphan = orphan % length;
        let catalog = InMemoryCatalog::new();
        for index in 0..length {
            let next = (index + 1) % length;
            let mut release = ModuleVersion::new(name(index), Version::new(1, 0, 0), format!("hash-{index}"))
                .with_dependency(DependencySpec::required(name(next), VersionReq::STAR));
            if index == orphan {
                release = release.with_dependency(DependencySpec::required("ghost", VersionReq::STAR));
            }
            catalog.publish_version(release).unwrap();
        }

        let error = DependencyResolver::new(Arc::new(catalog))
            .resolve(&ModuleId::from(name(0)), &VersionReq::STAR, &BTreeMap::new())
            .unwrap_err();
        prop_assert!(matches!(error, ConflictError::CyclicDependency { .. }), "got {:?}", error);
    }
}
