//! Example: demonstrate concretization **failure modes**.
//!
//! Each scenario pairs a tiny repository with a policy and a request that
//! cannot be satisfied, and prints the error: the minimal set of request
//! and policy constraints responsible, followed by the SAT engine's own
//! derivation.

use spec_concretizer::{ConcretizeOptions, Concretizer, InMemoryRepository, Policy, RepoSnapshot};
use tracing_subscriber::EnvFilter;

const REPO: &str = r#"
packages:
  gcc:
    versions: ["13.2.0", "12.3.0"]
    provides: [c, cxx, fortran]
  llvm:
    versions: ["17.0.6"]
    provides: [c, cxx]
  zlib:
    versions: ["1.3.1", "1.2.13"]
    variants: {shared: {default: true}}
    depends_on: [c]
  openmpi:
    versions: ["5.0.3", "4.1.6"]
    depends_on: [c, zlib]
    provides: [mpi]
  hdf5:
    versions: ["1.14.3", "1.12.2"]
    variants:
      mpi: {default: true}
      fortran: {default: false}
      api: {values: [default, v18, v110], default: default}
    depends_on: [c, "zlib@1.3:", {spec: mpi, when: "+mpi"}, {spec: fortran, when: "+fortran"}]
    conflicts:
      - {spec: "%c=llvm", when: "+fortran", message: "llvm has no fortran frontend"}
"#;

/// Concretize and print the result (expected to fail).
fn try_concretize(title: &str, policy: &str, request: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{title}");
    println!("  request: {request}");
    println!("{}", "=".repeat(60));

    let repo = InMemoryRepository::from_yaml_str(REPO).unwrap();
    let policy = Policy::from_yaml_str(policy).unwrap();
    let concretizer = Concretizer::new(RepoSnapshot::new(repo), policy);

    match concretizer.concretize_str(request, &ConcretizeOptions::default()) {
        Ok(result) => {
            println!("  Concretized (unexpected for this example):");
            print!("{}", result.graph);
        }
        Err(e) => {
            println!("{e}");
            println!("  (exit status {})", e.exit_code());
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Scenario 1: the request contradicts a site requirement.
    try_concretize(
        "Scenario 1: request vs. policy requirement",
        "packages:\n  hdf5:\n    require: [{spec: \"@1.14:\", message: \"site supports 1.14 only\"}]\n",
        "hdf5@1.12",
    );

    // Scenario 2: a package conflict the request walks into.
    try_concretize(
        "Scenario 2: declared conflict",
        "{}",
        "hdf5+fortran %c=llvm",
    );

    // Scenario 3: the dependency bound excludes the pinned version.
    try_concretize(
        "Scenario 3: dependency version out of range",
        "{}",
        "hdf5 ^zlib@1.2",
    );

    // Scenario 4: a policy conflict removes every candidate.
    try_concretize(
        "Scenario 4: policy conflict",
        "packages:\n  openmpi:\n    conflict: [\"@4:\"]\n",
        "hdf5+mpi",
    );

    // Scenario 5: variant value outside the declared domain.
    try_concretize("Scenario 5: invalid variant value", "{}", "hdf5 api=v200");

    // Scenario 6: an unknown package.
    try_concretize("Scenario 6: unknown package", "{}", "hdf5 ^szip");
}
