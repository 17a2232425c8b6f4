//! Concretization engine for source-based HPC package stacks.
//!
//! Given partial package requests such as `hdf5@1.14 +mpi %gcc ^openmpi`,
//! a repository of package definitions and a layered policy, this crate
//! produces one fully resolved, mutually consistent dependency graph, or
//! explains which constraints cannot hold together.
//!
//! The pipeline:
//!
//! 1. [`parse_specs`] turns request strings into abstract [`Spec`]s.
//! 2. [`FactBase::collect`] reads the reachable closure out of a
//!    [`RepoSnapshot`].
//! 3. [`PolicyCompiler`] turns the [`Policy`] and the request into hard
//!    constraints and a tiered [`CostModel`].
//! 4. [`ReuseIndex`] snapshots installed, cached and external nodes.
//! 5. [`SearchSpace`] enumerates every candidate node; [`Optimizer`] asks
//!    the [`resolvo`] SAT solver for feasibility and then minimizes the
//!    cost lexicographically by branch-and-bound.
//! 6. [`materialize`] re-validates the winner into a [`ConcreteGraph`].
//!
//! [`Concretizer`] runs all of it.

mod concretizer;
mod config;
mod cost;
mod error;
mod explain;
mod facts;
mod materialize;
mod package;
mod parse;
mod policy;
mod pool;
mod provider;
mod repository;
mod reuse;
mod solver;
mod space;
mod spec;
mod version;

pub use concretizer::{Concretization, ConcretizeOptions, Concretizer};
pub use config::{ConfigError, PolicyConfig};
pub use cost::{CostFunction, CostModel, CostVector, Tier};
pub use error::{ConcretizeError, Result, UnsatisfiableRequest};
pub use explain::{Explanation, minimal_conflict};
pub use facts::{FactBase, PackageFacts};
pub use materialize::{
    ConcreteEdge, ConcreteGraph, ConcreteNode, NodeOrigin, SpecHash, materialize,
};
pub use package::{
    ConflictDecl, DefinitionError, DependencyDecl, PackageBuilder, PackageDef, ProvideDecl,
    RequireDecl, VariantDecl, VariantDomain, VersionDecl,
};
pub use parse::{ParseError, parse_spec, parse_specs};
pub use policy::{
    CompiledPolicy, ConstraintId, ConstraintOrigin, Policy, PolicyCompiler, ReuseMode, RootScope,
    TieBreak, TimeoutPolicy,
};
pub use provider::{Probe, SpaceProvider, probe};
pub use repository::{InMemoryRepository, PackageRepository, RepoSnapshot};
pub use reuse::{InMemoryStore, Provenance, RecordEdge, ReuseIndex, ReuseRecord, ReuseSource};
pub use solver::{
    Assignment, CancellationToken, Optimality, Optimizer, SearchBudget, Solution, SolveFailure,
};
pub use space::{ConfigId, Configuration, ConstraintMask, SearchSpace};
pub use spec::{DepType, DepTypes, DependencyConstraint, DependencyKind, Spec, VariantValue};
pub use version::{Version, VersionConstraint, VersionError, VersionRange};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::concretizer::{Concretization, ConcretizeOptions, Concretizer};
    use crate::error::ConcretizeError;
    use crate::materialize::{ConcreteGraph, NodeOrigin};
    use crate::policy::{ConstraintOrigin, Policy};
    use crate::repository::{InMemoryRepository, RepoSnapshot};
    use crate::reuse::{InMemoryStore, Provenance, ReuseSource};
    use crate::solver::Optimality;
    use crate::spec::VariantValue;

    const REPO: &str = r#"
packages:
  foo:
    versions: ["1.5", "1.4", "1.2", "1.1", "1.0"]
    variants:
      shared: {default: true}
      build_type: {values: [Release, Debug], default: Release}
    depends_on: [zlib]
  zlib:
    versions: ["1.3", "1.2"]
  app:
    versions: ["1.0"]
    variants: {x: {default: false}}
    depends_on: [c, {spec: "libb@2:", when: "+x"}]
  libb:
    versions: ["2.1", "1.0"]
  sci:
    versions: ["3.0"]
    depends_on: [c, fortran, mpi]
  gcc:
    versions: ["13.2", "12.3"]
    provides: [c, cxx, fortran]
  clang:
    versions: ["17.0"]
    provides: [c, cxx]
  openmpi:
    versions: ["5.0"]
    depends_on: [c]
    provides: [mpi]
  mpich:
    versions: ["4.2"]
    depends_on: [c]
    provides: [mpi]
  cyc-a:
    versions: ["1.0"]
    depends_on: [cyc-b]
  cyc-b:
    versions: ["1.0"]
    variants: {loop: {default: false}}
    depends_on: [{spec: cyc-a, when: "+loop"}]
  opt:
    versions: ["1.0"]
    variants: {x: {default: true}}
    depends_on: [{spec: libb, when: "+x"}]
  pin:
    versions: ["1.5", "1.0"]
    depends_on: [{spec: libb, when: "@1.0"}]
  net:
    versions: ["1.0"]
    variants: {fabrics: {values: [ofi, ucx, psm], multi: true, default: ofi}}
"#;

    fn concretizer(policy: &str) -> Concretizer {
        let repo = InMemoryRepository::from_yaml_str(REPO).unwrap();
        Concretizer::new(RepoSnapshot::new(repo), Policy::from_yaml_str(policy).unwrap())
    }

    fn solve(concretizer: &Concretizer, request: &str) -> Concretization {
        concretizer
            .concretize_str(request, &ConcretizeOptions::default())
            .unwrap_or_else(|e| panic!("{request}: {e}"))
    }

    /// Store holding the graph of `request`, solved without policy.
    fn installed(request: &str) -> Arc<InMemoryStore> {
        let graph = solve(&concretizer("{}"), request).graph;
        let store = Arc::new(InMemoryStore::new("store"));
        store.install(&graph, Provenance::Installed);
        store
    }

    fn version<'g>(graph: &'g ConcreteGraph, name: &str) -> &'g str {
        graph.node(name).unwrap().version.as_str()
    }

    #[test]
    fn identical_inputs_give_identical_graphs() {
        let concretizer = concretizer("packages:\n  all:\n    providers: {mpi: [mpich]}\n");
        let first = solve(&concretizer, "sci");
        let second = solve(&concretizer, "sci");
        assert_eq!(first.graph, second.graph);
        assert_eq!(first.cost, second.cost);
        assert_eq!(first.graph.to_json().unwrap(), second.graph.to_json().unwrap());
    }

    #[test]
    fn strong_preference_outranks_reuse() {
        let store = installed("foo@1.0");
        let concretizer = concretizer("packages:\n  foo:\n    prefer: [\"@1.1\"]\n")
            .with_reuse_source(store as Arc<dyn ReuseSource>);
        let graph = solve(&concretizer, "foo").graph;
        let foo = graph.node("foo").unwrap();
        assert_eq!(foo.version.as_str(), "1.1");
        assert_eq!(foo.origin, NodeOrigin::Built);
        // Nothing outranks reuse for the dependency.
        assert_eq!(graph.node("zlib").unwrap().origin, NodeOrigin::Reused(Provenance::Installed));
    }

    #[test]
    fn reuse_outranks_newer_versions() {
        let store = installed("foo@1.0");
        let concretizer = concretizer("{}").with_reuse_source(store as Arc<dyn ReuseSource>);
        let graph = solve(&concretizer, "foo").graph;
        assert_eq!(version(&graph, "foo"), "1.0");
        assert!(graph.nodes.iter().all(|n| n.origin == NodeOrigin::Reused(Provenance::Installed)));
    }

    #[test]
    fn requirements_win_over_reuse_and_preferences() {
        let store = installed("foo@1.0");
        let concretizer = concretizer(
            "packages:\n  foo:\n    require: \"@1.2\"\n    prefer: [\"@1.0\"]\n    version: [\"1.0\"]\n",
        )
        .with_reuse_source(store as Arc<dyn ReuseSource>);
        let graph = solve(&concretizer, "foo").graph;
        assert_eq!(version(&graph, "foo"), "1.2");
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);
    }

    #[test]
    fn plain_preferences_beat_defaults() {
        let concretizer = concretizer(
            "packages:\n  foo:\n    version: [\"1.4\"]\n    variants: \"~shared build_type=Debug\"\n",
        );
        let graph = solve(&concretizer, "foo").graph;
        let foo = graph.node("foo").unwrap();
        assert_eq!(foo.version.as_str(), "1.4");
        assert_eq!(foo.variants["shared"], VariantValue::Bool(false));
        assert_eq!(foo.variants["build_type"], VariantValue::Value("Debug".into()));
    }

    #[test]
    fn graphs_are_acyclic() {
        let concretizer = concretizer("{}");
        let graph = solve(&concretizer, "cyc-a").graph;
        let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["cyc-b", "cyc-a"]);
        graph.validate().unwrap();

        let err = concretizer
            .concretize_str("cyc-a ^cyc-b+loop", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(err.unsatisfiable().is_some(), "{err}");
    }

    #[test]
    fn variants_stay_in_their_domain() {
        let concretizer = concretizer("{}");
        let graph = solve(&concretizer, "foo build_type=Debug").graph;
        assert_eq!(
            graph.node("foo").unwrap().variants["build_type"],
            VariantValue::Value("Debug".into())
        );

        let err = concretizer
            .concretize_str("foo build_type=Fast", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, ConcretizeError::InvalidVariantValue { ref value, .. } if value == "Fast"),
            "{err}"
        );
        let err = concretizer
            .concretize_str("foo+mpi", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::UnknownVariant { .. }), "{err}");
    }

    #[test]
    fn contradictory_constraints_are_explained() {
        let concretizer = concretizer(
            "packages:\n  foo:\n    require: [\"@1.2:\"]\n    conflict: [\"@1.4\"]\n  zlib:\n    require: \"@1.3\"\n",
        );
        let err = concretizer
            .concretize_str("foo@1.4", &ConcretizeOptions::default())
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let explanation = err.unsatisfiable().unwrap();
        assert_eq!(explanation.conflicts.len(), 2, "{explanation}");
        assert!(matches!(
            &explanation.conflicts[0],
            ConstraintOrigin::Conflict { package, index: 0, .. } if package == "foo"
        ));
        assert!(matches!(
            &explanation.conflicts[1],
            ConstraintOrigin::Request { spec } if spec.starts_with("foo@")
        ));
        assert!(!explanation.details.is_empty());
    }

    #[test]
    fn dependencies_only_reuse_rebuilds_roots() {
        let store = installed("foo@1.0 ^zlib@1.2");
        let concretizer = concretizer("concretizer:\n  reuse: dependencies\n")
            .with_reuse_source(store as Arc<dyn ReuseSource>);

        let graph = solve(&concretizer, "foo@1.1").graph;
        assert_eq!(version(&graph, "foo"), "1.1");
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);
        assert_eq!(version(&graph, "zlib"), "1.2");
        assert_eq!(graph.node("zlib").unwrap().origin, NodeOrigin::Reused(Provenance::Installed));

        // Even a matching install is not reused for the root.
        let graph = solve(&concretizer, "foo@1.0").graph;
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);
        assert_eq!(graph.node("zlib").unwrap().origin, NodeOrigin::Reused(Provenance::Installed));
    }

    #[test]
    fn fresh_flags_control_reuse() {
        let store = installed("foo@1.0 ^zlib@1.2");
        let concretizer = concretizer("{}").with_reuse_source(store as Arc<dyn ReuseSource>);
        let fresh = ConcretizeOptions {
            fresh: true,
            ..ConcretizeOptions::default()
        };
        let graph = concretizer.concretize_str("foo", &fresh).unwrap().graph;
        assert!(graph.nodes.iter().all(|n| n.origin == NodeOrigin::Built));
        assert_eq!(version(&graph, "foo"), "1.5");

        let fresh_roots = ConcretizeOptions {
            fresh_roots: true,
            ..ConcretizeOptions::default()
        };
        let graph = concretizer.concretize_str("foo", &fresh_roots).unwrap().graph;
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);
        assert_eq!(version(&graph, "zlib"), "1.2");
    }

    #[test]
    fn conditional_dependency_stays_off_by_default() {
        let concretizer = concretizer("{}");
        let graph = solve(&concretizer, "app").graph;
        let app = graph.node("app").unwrap();
        assert_eq!(app.variants["x"], VariantValue::Bool(false));
        assert!(graph.node("libb").is_none());
        assert_eq!(app.dependencies.len(), 1);
        let compiler = &app.dependencies[0];
        assert!(compiler.virtuals.contains("c"));
        assert!(["gcc", "clang"].contains(&compiler.name.as_str()));

        let graph = solve(&concretizer, "app+x").graph;
        assert_eq!(version(&graph, "libb"), "2.1");
    }

    #[test]
    fn one_provider_per_virtual_is_shared() {
        let concretizer = concretizer("{}");
        let graph = solve(&concretizer, "sci").graph;
        let sci = graph.node("sci").unwrap();
        // gcc is the only fortran provider, so it also serves c.
        let compilers: Vec<&str> = sci
            .dependencies
            .iter()
            .filter(|e| e.virtuals.contains("c") || e.virtuals.contains("fortran"))
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(compilers, ["gcc"]);
        let mpi = sci.dependencies.iter().find(|e| e.virtuals.contains("mpi")).unwrap();
        let provider = graph.node(&mpi.name).unwrap();
        assert_eq!(provider.dependencies[0].name, "gcc");
        assert!(graph.node("clang").is_none());
    }

    #[test]
    fn languages_may_use_different_compilers() {
        let concretizer = concretizer("{}");
        let graph = solve(&concretizer, "sci %c=clang %fortran=gcc").graph;
        let sci = graph.node("sci").unwrap();
        let by_language = |lang: &str| {
            sci.dependencies
                .iter()
                .find(|e| e.virtuals.contains(lang))
                .map(|e| e.name.as_str())
        };
        assert_eq!(by_language("c"), Some("clang"));
        assert_eq!(by_language("fortran"), Some("gcc"));
    }

    #[test]
    fn provider_preferences_and_virtual_roots() {
        let concretizer = concretizer("packages:\n  all:\n    providers: {mpi: [mpich, openmpi]}\n");
        let graph = solve(&concretizer, "sci").graph;
        assert!(graph.node("mpich").is_some());
        assert!(graph.node("openmpi").is_none());

        let graph = solve(&concretizer, "mpi").graph;
        assert_eq!(graph.roots.len(), 1);
        assert!(["mpich", "openmpi"].contains(&graph.roots[0].as_str()));
    }

    #[test]
    fn concurrent_solves_share_one_concretizer() {
        let concretizer = concretizer("{}");
        let graphs: Vec<ConcreteGraph> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| solve(&concretizer, "sci").graph))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(graphs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn graph_size_does_not_matter_without_reuse() {
        let store = installed("foo@1.0");
        let policy = "packages:\n  pin:\n    version: [\"1.0\"]\n";
        let fresh = ConcretizeOptions {
            fresh: true,
            ..ConcretizeOptions::default()
        };
        let default = ConcretizeOptions::default();
        let with_store = concretizer(policy).with_reuse_source(store.clone() as Arc<dyn ReuseSource>);
        let reuse_off = concretizer(&format!("{policy}concretizer:\n  reuse: false\n"))
            .with_reuse_source(store as Arc<dyn ReuseSource>);

        for (concretizer, options) in [(&with_store, &fresh), (&reuse_off, &default)] {
            let graph = concretizer.concretize_str("opt", options).unwrap().graph;
            assert_eq!(graph.node("opt").unwrap().variants["x"], VariantValue::Bool(true));
            assert!(graph.node("libb").is_some());

            let graph = concretizer.concretize_str("pin", options).unwrap().graph;
            assert_eq!(version(&graph, "pin"), "1.0");
            assert!(graph.nodes.iter().all(|n| n.origin == NodeOrigin::Built));
        }
    }

    #[test]
    fn reuse_prefers_externals_then_installs_then_caches() {
        let cache = Arc::new(InMemoryStore::new("cache"));
        cache.install(&solve(&concretizer("{}"), "foo@1.0").graph, Provenance::BuildCache);
        let local = Arc::new(InMemoryStore::new("local"));
        local.install(&solve(&concretizer("{}"), "foo@1.2").graph, Provenance::Installed);
        let with_stores = |policy: &str| {
            concretizer(policy)
                .with_reuse_source(cache.clone() as Arc<dyn ReuseSource>)
                .with_reuse_source(local.clone() as Arc<dyn ReuseSource>)
        };

        let graph = solve(&with_stores("{}"), "foo").graph;
        assert_eq!(version(&graph, "foo"), "1.2");
        // zlib sits in both stores under the same hash.
        assert!(graph.nodes.iter().all(|n| n.origin == NodeOrigin::Reused(Provenance::Installed)));

        let concretizer = with_stores("packages:\n  zlib:\n    externals: [{spec: \"zlib@1.3\", prefix: /usr}]\n");
        let graph = solve(&concretizer, "zlib").graph;
        let zlib = graph.node("zlib").unwrap();
        assert_eq!(zlib.origin, NodeOrigin::Reused(Provenance::External));
        assert_eq!(zlib.prefix.as_deref(), Some("/usr"));
    }

    #[test]
    fn constrained_roots_are_rebuilt() {
        let store = installed("foo@1.0 ^zlib@1.2");
        let requested = concretizer("concretizer:\n  reuse: dependencies\n")
            .with_reuse_source(store.clone() as Arc<dyn ReuseSource>);
        let graph = solve(&requested, "foo@1.1 ^zlib@1.2").graph;
        assert_eq!(graph.node("zlib").unwrap().origin, NodeOrigin::Reused(Provenance::Installed));

        let constrained = concretizer("concretizer:\n  reuse: dependencies\n  roots: constrained\n")
            .with_reuse_source(store as Arc<dyn ReuseSource>);
        let graph = solve(&constrained, "foo@1.1 ^zlib@1.2").graph;
        assert_eq!(version(&graph, "zlib"), "1.2");
        assert_eq!(graph.node("zlib").unwrap().origin, NodeOrigin::Built);
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);
    }

    #[test]
    fn conditional_policy_entries() {
        let concretizer = concretizer(
            "packages:
  foo:
    require: [{spec: \"build_type=Debug\", when: \"@1.0\"}]
    prefer: [{spec: \"~shared\", when: \"@1.1\"}]
    conflict: [{spec: \"build_type=Debug\", when: \"@1.5\"}]
",
        );
        let graph = solve(&concretizer, "foo").graph;
        let foo = graph.node("foo").unwrap();
        assert_eq!(foo.version.as_str(), "1.5");
        assert_eq!(foo.variants["build_type"], VariantValue::Value("Release".into()));
        assert_eq!(foo.variants["shared"], VariantValue::Bool(true));

        let graph = solve(&concretizer, "foo@1.0").graph;
        assert_eq!(
            graph.node("foo").unwrap().variants["build_type"],
            VariantValue::Value("Debug".into())
        );

        let graph = solve(&concretizer, "foo@1.1").graph;
        assert_eq!(graph.node("foo").unwrap().variants["shared"], VariantValue::Bool(false));

        let graph = solve(&concretizer, "foo build_type=Debug").graph;
        assert_eq!(version(&graph, "foo"), "1.4");

        let err = concretizer
            .concretize_str("foo@1.5 build_type=Debug", &ConcretizeOptions::default())
            .unwrap_err();
        let explanation = err.unsatisfiable().unwrap();
        assert!(
            explanation
                .conflicts
                .iter()
                .any(|c| matches!(c, ConstraintOrigin::Conflict { package, .. } if package == "foo")),
            "{explanation}"
        );
    }

    #[test]
    fn unbuildable_packages_resolve_to_externals() {
        let concretizer = concretizer(
            "packages:\n  zlib:\n    buildable: false\n    externals: [{spec: \"zlib@1.2\", prefix: /opt/zlib}]\n",
        );
        let fresh = ConcretizeOptions {
            fresh: true,
            ..ConcretizeOptions::default()
        };
        let graph = concretizer.concretize_str("foo", &fresh).unwrap().graph;
        let zlib = graph.node("zlib").unwrap();
        assert_eq!(zlib.version.as_str(), "1.2");
        assert_eq!(zlib.origin, NodeOrigin::Reused(Provenance::External));
        assert_eq!(zlib.prefix.as_deref(), Some("/opt/zlib"));
        assert_eq!(graph.node("foo").unwrap().origin, NodeOrigin::Built);

        let err = concretizer
            .concretize_str("foo ^zlib@1.3", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(err.unsatisfiable().is_some(), "{err}");
    }

    #[test]
    fn multi_valued_variants_extend_the_default() {
        let concretizer = concretizer("{}");
        let fabrics = |request: &str| {
            let graph = solve(&concretizer, request).graph;
            graph.node("net").unwrap().variants["fabrics"].clone()
        };
        assert_eq!(fabrics("net"), VariantValue::Value("ofi".into()));
        assert_eq!(fabrics("net fabrics=ucx"), VariantValue::from_assignment("ofi,ucx"));
        assert_eq!(fabrics("net fabrics=ucx,psm"), VariantValue::from_assignment("ofi,psm,ucx"));

        let err = concretizer
            .concretize_str("net fabrics=ofi,tcp", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::InvalidVariantValue { .. }), "{err}");
    }

    #[test]
    fn wall_clock_budget_covers_the_whole_solve() {
        let expired = concretizer("concretizer:\n  budget: {timeout_ms: 0}\n");
        let err = expired.concretize_str("sci", &ConcretizeOptions::default()).unwrap_err();
        assert!(matches!(err, ConcretizeError::SolveTimeout { best_effort: None, .. }), "{err}");
        // No fresh budget is started to explain an infeasible request.
        let err = expired
            .concretize_str("cyc-a ^cyc-b+loop", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::SolveTimeout { .. }), "{err}");

        let generous = concretizer("concretizer:\n  budget: {timeout_ms: 600000}\n");
        assert_eq!(solve(&generous, "sci").optimality, Optimality::Optimal);
    }

    #[test]
    fn strong_preferences_reach_into_dependencies() {
        let concretizer = concretizer(
            "packages:
  all:
    providers: {c: [gcc, clang]}
  app:
    prefer: [\"%clang\"]
  foo:
    prefer: [\"^zlib@1.2\"]
",
        );
        let graph = solve(&concretizer, "app").graph;
        let app = graph.node("app").unwrap();
        assert_eq!(app.dependencies[0].name, "clang");
        assert!(graph.node("gcc").is_none());

        let graph = solve(&concretizer, "foo").graph;
        assert_eq!(version(&graph, "foo"), "1.5");
        assert_eq!(version(&graph, "zlib"), "1.2");
    }

    #[test]
    fn unknown_packages_are_reported() {
        let concretizer = concretizer("{}");
        let err = concretizer
            .concretize_str("nonexistent", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::UnknownPackage { .. }));
        let err = concretizer
            .concretize_str("foo ^", &ConcretizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::Parse(_)));
    }
}
