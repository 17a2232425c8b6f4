//! Example: concretize a small HPC stack.
//!
//! Models a slice of a scientific software tree: compilers providing the
//! `c`, `cxx` and `fortran` languages, two MPI implementations, HDF5 with an
//! `mpi` variant and a few libraries. The same requests are solved under a
//! site policy, first from scratch and then on top of an installed store, to
//! show how requirements, preferences and reuse interact.
//!
//! Run with `RUST_LOG=spec_concretizer=debug` to see the solver at work.

use std::sync::Arc;

use spec_concretizer::{
    ConcretizeOptions, Concretizer, InMemoryRepository, InMemoryStore, PackageDef, Policy,
    Provenance, RepoSnapshot, ReuseSource,
};
use tracing_subscriber::EnvFilter;

fn build_repo() -> InMemoryRepository {
    let mut repo = InMemoryRepository::new();
    let defs = [
        PackageDef::builder("gcc")
            .version("13.2.0")
            .version("12.3.0")
            .provides("c")
            .provides("cxx")
            .provides("fortran"),
        PackageDef::builder("llvm")
            .version("17.0.6")
            .provides("c")
            .provides("cxx"),
        PackageDef::builder("zlib")
            .version("1.3.1")
            .version("1.2.13")
            .bool_variant("shared", true)
            .depends_on("c"),
        PackageDef::builder("openmpi")
            .version("5.0.3")
            .version("4.1.6")
            .value_variant("fabrics", &["auto", "ofi", "ucx"], "auto")
            .depends_on("c")
            .depends_on("zlib")
            .provides("mpi"),
        PackageDef::builder("mpich")
            .version("4.2.1")
            .depends_on("c")
            .depends_on("fortran")
            .provides("mpi"),
        PackageDef::builder("hdf5")
            .version("1.14.3")
            .version("1.12.2")
            .bool_variant("mpi", true)
            .bool_variant("fortran", false)
            .value_variant("api", &["default", "v18", "v110"], "default")
            .depends_on("c")
            .depends_on("zlib@1.2:")
            .depends_on_when("mpi", "+mpi")
            .depends_on_when("fortran", "+fortran")
            .conflicts_with("%c=llvm", Some("+fortran"), Some("llvm has no fortran frontend")),
        PackageDef::builder("netcdf-c")
            .version("4.9.2")
            .bool_variant("mpi", true)
            .depends_on("c")
            .depends_on("hdf5")
            .requires("^hdf5+mpi", Some("+mpi"), None),
    ];
    for builder in defs {
        repo.add(builder.build().unwrap());
    }
    repo
}

const POLICY: &str = r#"
packages:
  all:
    providers: {mpi: [openmpi, mpich]}
    variants: "+shared"
  hdf5:
    require: "@1.14:"
    prefer: ["api=v110"]
  openmpi:
    version: ["4.1.6"]
concretizer:
  targets: [zen3, x86_64]
"#;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let snapshot = RepoSnapshot::new(build_repo());
    let policy = Policy::from_yaml_str(POLICY).unwrap();
    let store = Arc::new(InMemoryStore::new("store"));
    let concretizer = Concretizer::new(snapshot, policy)
        .with_reuse_source(Arc::clone(&store) as Arc<dyn ReuseSource>);

    let options = ConcretizeOptions::default();
    for request in ["netcdf-c", "hdf5+fortran", "hdf5 ^mpich", "zlib %c=llvm"] {
        println!("\n==> {request}");
        match concretizer.concretize_str(request, &options) {
            Ok(result) => {
                print!("{}", result.graph);
                println!("    cost {} ({}, {} steps)", result.cost, result.optimality, result.steps);
            }
            Err(e) => println!("    error: {e}"),
        }
    }

    // Install the first solution; later solves reuse what they can.
    let installed = concretizer.concretize_str("netcdf-c", &options).unwrap();
    store.install(&installed.graph, Provenance::Installed);
    println!("\n==> installed {} nodes", store.len());

    for request in ["hdf5", "netcdf-c ^zlib@1.2"] {
        println!("\n==> {request}");
        match concretizer.concretize_str(request, &options) {
            Ok(result) => print!("{}", result.graph),
            Err(e) => println!("    error: {e}"),
        }
    }

    let fresh = ConcretizeOptions {
        fresh: true,
        ..ConcretizeOptions::default()
    };
    println!("\n==> hdf5 (fresh)");
    match concretizer.concretize_str("hdf5", &fresh) {
        Ok(result) => print!("{}", result.graph),
        Err(e) => println!("    error: {e}"),
    }

    println!("\n==> JSON of netcdf-c");
    println!("{}", installed.graph.to_json().unwrap());
}
