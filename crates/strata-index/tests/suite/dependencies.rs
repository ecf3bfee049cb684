use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use strata_core::{ProjectId, RootUrl, TrackingMode, TypeHandle};
use strata_index::{
    ClassIndex, ClassIndexProvider, DependencyQuery, DependencyResolver, FileFacts,
    PersistentClassIndex, StaticRootGraph,
};
use url::Url;

use super::support::handles;

fn root(name: &str) -> RootUrl {
    RootUrl::parse(&format!("file:///work/{name}/")).unwrap()
}

fn file(root: &RootUrl, path: &str) -> Url {
    root.join(path).unwrap()
}

#[derive(Default)]
struct Indexes(HashMap<RootUrl, Arc<PersistentClassIndex>>);

impl Indexes {
    /// `sources` are `(path, declared, extends, uses, has_errors)`.
    fn add(&mut self, root: &RootUrl, sources: &[(&str, &str, Option<&str>, &[&str], bool)]) {
        let mut index = PersistentClassIndex::new();
        for (path, declared, extends, uses, has_errors) in sources {
            let ty = TypeHandle::class(*declared);
            let supertypes: Vec<(TypeHandle, TypeHandle)> = extends
                .iter()
                .map(|base| (ty.clone(), TypeHandle::class(*base)))
                .collect();
            let mut references: Vec<TypeHandle> =
                uses.iter().map(|name| TypeHandle::class(*name)).collect();
            references.extend(supertypes.iter().map(|(_, base)| base.clone()));
            index.update_file(
                &file(root, path),
                FileFacts::new([&ty], &supertypes, &references, *has_errors),
            );
        }
        self.0.insert(root.clone(), Arc::new(index));
    }
}

impl ClassIndexProvider for Indexes {
    fn class_index(&self, root: &RootUrl) -> Option<Arc<dyn ClassIndex>> {
        self.0
            .get(root)
            .map(|index| Arc::clone(index) as Arc<dyn ClassIndex>)
    }
}

/// `lib` <- `core` <- `app`, each depending on the previous one.
struct Chain {
    lib: RootUrl,
    core: RootUrl,
    app: RootUrl,
    graph: StaticRootGraph,
    indexes: Indexes,
}

fn chain() -> Chain {
    let (lib, core, app) = (root("lib"), root("core"), root("app"));
    let mut graph = StaticRootGraph::new();
    graph
        .add_dependency(core.clone(), lib.clone())
        .add_dependency(app.clone(), core.clone());
    let mut indexes = Indexes::default();
    indexes.add(&lib, &[("p/Base.java", "p.Base", None, &[], false)]);
    indexes.add(
        &core,
        &[
            ("q/Impl.java", "q.Impl", Some("p.Base"), &[], false),
            ("q/Other.java", "q.Other", None, &[], false),
        ],
    );
    indexes.add(
        &app,
        &[
            ("r/User.java", "r.User", None, &["q.Impl"], false),
            ("r/Unrelated.java", "r.Unrelated", None, &["q.Other"], false),
            ("r/Broken.java", "r.Broken", None, &[], true),
        ],
    );
    Chain {
        lib,
        core,
        app,
        graph,
        indexes,
    }
}

fn files(root: &RootUrl, paths: &[&str]) -> BTreeSet<Url> {
    paths.iter().map(|path| file(root, path)).collect()
}

#[test]
fn enabled_mode_follows_implementors_through_every_dependent_root() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::Enabled);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.lib.clone()).changed(handles(&["p.Base"])),
    );

    assert_eq!(
        deps.files.keys().cloned().collect::<Vec<_>>(),
        vec![c.lib.clone(), c.core.clone(), c.app.clone()]
    );
    assert_eq!(deps.files[&c.lib], files(&c.lib, &["p/Base.java"]));
    assert_eq!(deps.files[&c.core], files(&c.core, &["q/Impl.java"]));
    assert_eq!(deps.files[&c.app], files(&c.app, &["r/User.java"]));
    assert!(deps.deferred.is_empty());
}

#[test]
fn within_root_defers_dependent_roots() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::WithinRoot);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.lib.clone()).changed(handles(&["p.Base"])),
    );

    assert_eq!(deps.files.len(), 1);
    assert_eq!(deps.files[&c.lib], files(&c.lib, &["p/Base.java"]));
    assert_eq!(deps.deferred, BTreeSet::from([c.core, c.app]));
}

#[test]
fn disabled_mode_only_marks_roots_dirty() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::Disabled);
    let query = DependencyQuery::new(c.lib.clone()).changed(handles(&["p.Base"]));
    let deps = resolver.find_dependent(&query);
    assert!(deps.files.is_empty());
    assert_eq!(deps.deferred, BTreeSet::from([c.core.clone(), c.app.clone()]));

    let leaf = resolver.find_dependent(
        &DependencyQuery::new(c.app.clone()).changed(handles(&["r.User"])),
    );
    assert_eq!(leaf.deferred, BTreeSet::from([c.app]));
}

#[test]
fn within_project_stops_at_foreign_projects() {
    let mut c = chain();
    c.graph
        .set_project(c.lib.clone(), ProjectId::new("one"))
        .set_project(c.core.clone(), ProjectId::new("one"))
        .set_project(c.app.clone(), ProjectId::new("two"));
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::WithinProject);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.lib.clone()).changed(handles(&["p.Base"])),
    );

    assert!(deps.files.contains_key(&c.core));
    assert!(!deps.files.contains_key(&c.app));
    assert_eq!(deps.deferred, BTreeSet::from([c.app]));
}

#[test]
fn within_project_follows_unowned_roots_from_an_unowned_root() {
    let mut c = chain();
    c.graph.set_project(c.app.clone(), ProjectId::new("two"));
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::WithinProject);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.lib.clone()).changed(handles(&["p.Base"])),
    );

    assert_eq!(
        deps.files.keys().cloned().collect::<Vec<_>>(),
        vec![c.lib.clone(), c.core.clone()]
    );
    assert_eq!(deps.files[&c.core], files(&c.core, &["q/Impl.java"]));
    assert_eq!(deps.deferred, BTreeSet::from([c.app]));
}

#[test]
fn removed_types_reach_direct_users_only() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::Enabled);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.lib.clone())
            .removed(handles(&["p.Base"]))
            .include_current_root(false),
    );

    assert!(!deps.files.contains_key(&c.lib));
    assert_eq!(deps.files[&c.core], files(&c.core, &["q/Impl.java"]));
    assert!(!deps.files.contains_key(&c.app));
}

#[test]
fn error_files_are_revisited_when_types_appear() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::Enabled);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(c.core.clone())
            .changed(handles(&["q.Other"]))
            .include_error_files(true),
    );

    assert_eq!(
        deps.files[&c.app],
        files(&c.app, &["r/Broken.java", "r/Unrelated.java"])
    );
}

#[test]
fn nothing_changed_means_nothing_to_do() {
    let c = chain();
    let resolver = DependencyResolver::new(&c.graph, &c.indexes, TrackingMode::Enabled);
    assert!(resolver
        .find_dependent(&DependencyQuery::new(c.lib.clone()))
        .is_empty());
}

#[test]
fn cyclic_roots_are_still_examined() {
    let (a, b) = (root("a"), root("b"));
    let mut graph = StaticRootGraph::new();
    graph
        .add_dependency(b.clone(), a.clone())
        .add_dependency(a.clone(), b.clone());
    let mut indexes = Indexes::default();
    indexes.add(&a, &[("p/Base.java", "p.Base", None, &[], false)]);
    indexes.add(&b, &[("q/Impl.java", "q.Impl", Some("p.Base"), &[], false)]);

    let resolver = DependencyResolver::new(&graph, &indexes, TrackingMode::Enabled);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(a.clone()).changed(handles(&["p.Base"])),
    );

    assert_eq!(deps.files[&a], files(&a, &["p/Base.java"]));
    assert_eq!(deps.files[&b], files(&b, &["q/Impl.java"]));
}

#[test]
fn peers_see_changes_of_their_partner() {
    let (main, test) = (root("main"), root("test"));
    let mut graph = StaticRootGraph::new();
    graph.add_peers(main.clone(), test.clone());
    let mut indexes = Indexes::default();
    indexes.add(&main, &[("p/Base.java", "p.Base", None, &[], false)]);
    indexes.add(
        &test,
        &[("p/BaseTest.java", "p.BaseTest", None, &["p.Base"], false)],
    );

    let resolver = DependencyResolver::new(&graph, &indexes, TrackingMode::WithinRoot);
    let deps = resolver.find_dependent(
        &DependencyQuery::new(main.clone())
            .changed(handles(&["p.Base"]))
            .include_current_root(false),
    );

    assert_eq!(deps.files[&test], files(&test, &["p/BaseTest.java"]));
}
