//! Metadata facts extraction.
//!
//! Starting from the request, [`FactBase::collect`] walks the repository
//! breadth-first and records everything the search space needs about the
//! closure of reachable packages: definitions, ordered versions, virtual
//! providers, and which variant names and values are mentioned anywhere.
//! Each frontier is expanded in parallel.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{ConcretizeError, Result};
use crate::package::{PackageDef, VersionDecl};
use crate::policy::{Policy, TieBreak};
use crate::repository::RepoSnapshot;
use crate::reuse::ReuseIndex;
use crate::spec::Spec;
use crate::version::Version;

/// Facts about one reachable package.
#[derive(Debug, Clone)]
pub struct PackageFacts {
    /// Definition.
    pub def: Arc<PackageDef>,
    /// Versions, best first.
    pub versions: Vec<VersionDecl>,
}

impl PackageFacts {
    /// Position of `version` in the preference order; unknown versions
    /// (e.g. of reused nodes) rank after every known one.
    pub fn rank(&self, version: &Version) -> usize {
        self.versions
            .iter()
            .position(|d| &d.version == version)
            .unwrap_or(self.versions.len())
    }
}

/// Everything known about the closure of a request.
#[derive(Debug, Clone)]
pub struct FactBase {
    snapshot: RepoSnapshot,
    packages: BTreeMap<String, PackageFacts>,
    virtuals: BTreeMap<String, Vec<String>>,
    referenced: BTreeSet<String>,
    mentioned: BTreeMap<String, BTreeSet<String>>,
}

enum Expansion {
    Package(Arc<PackageDef>, Vec<String>),
    Virtual(Vec<String>),
}

impl FactBase {
    /// Collect the closure reachable from `request`, from dependencies
    /// named in policy requirements, and from the dependencies of reusable
    /// records.
    pub fn collect(
        snapshot: &RepoSnapshot,
        policy: &Policy,
        request: &[Spec],
        reuse: &ReuseIndex,
    ) -> Result<Self> {
        let repo = snapshot.repo();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut frontier: Vec<(String, Option<String>)> = Vec::new();

        for spec in request {
            for part in spec.traverse() {
                if let Some(name) = &part.name {
                    frontier.push((name.clone(), None));
                }
            }
        }
        for name in policy.required_names() {
            if repo.package(name).is_some() || repo.is_virtual(name) {
                frontier.push((name.to_string(), None));
            } else {
                warn!(package = name, "policy requires an unknown package");
            }
        }

        let mut packages = BTreeMap::new();
        let mut virtuals = BTreeMap::new();
        while !frontier.is_empty() {
            frontier.retain(|(name, _)| seen.insert(name.clone()));
            let expanded = frontier
                .par_iter()
                .map(|(name, parent)| {
                    if let Some(def) = repo.package(name) {
                        let mut next: Vec<String> =
                            def.dependency_names().into_iter().map(str::to_string).collect();
                        for record in reuse.records_for(name) {
                            next.extend(
                                record
                                    .dependencies
                                    .iter()
                                    .filter(|e| repo.package(&e.name).is_some())
                                    .map(|e| e.name.clone()),
                            );
                        }
                        Ok((name.clone(), Expansion::Package(def, next)))
                    } else if repo.is_virtual(name) {
                        Ok((name.clone(), Expansion::Virtual(repo.providers(name))))
                    } else {
                        Err(ConcretizeError::UnknownPackage {
                            name: name.clone(),
                            needed_by: parent.clone(),
                        })
                    }
                })
                .collect::<Result<Vec<_>>>()?;

            let mut next = Vec::new();
            for (name, expansion) in expanded {
                match expansion {
                    Expansion::Package(def, deps) => {
                        next.extend(deps.into_iter().map(|d| (d, Some(name.clone()))));
                        let versions = order_versions(&def, policy.tie_break);
                        packages.insert(name, PackageFacts { def, versions });
                    }
                    Expansion::Virtual(providers) => {
                        next.extend(providers.iter().map(|p| (p.clone(), Some(name.clone()))));
                        virtuals.insert(name, providers);
                    }
                }
            }
            frontier = next;
        }

        let mut facts = FactBase {
            snapshot: snapshot.clone(),
            packages,
            virtuals,
            referenced: BTreeSet::new(),
            mentioned: BTreeMap::new(),
        };
        facts.index_mentions(policy, request);
        debug!(
            packages = facts.packages.len(),
            virtuals = facts.virtuals.len(),
            revision = snapshot.revision,
            "collected facts"
        );
        Ok(facts)
    }

    fn index_mentions(&mut self, policy: &Policy, request: &[Spec]) {
        let mut specs: Vec<Spec> = Vec::new();
        for spec in request {
            specs.extend(spec.traverse().into_iter().cloned());
        }
        for spec in policy.mentioned_specs() {
            specs.extend(spec.traverse().into_iter().cloned());
        }
        for (_, scope) in policy.scopes() {
            specs.push(Spec {
                variants: scope.variants.clone(),
                ..Spec::default()
            });
        }
        for facts in self.packages.values() {
            let def = &facts.def;
            for dep in &def.dependencies {
                specs.push(dep.spec.clone());
                specs.extend(dep.when.clone());
            }
            for conflict in &def.conflicts {
                specs.extend(conflict.spec.traverse().into_iter().cloned());
            }
            for require in &def.requires {
                specs.extend(require.spec.traverse().into_iter().cloned());
                specs.extend(require.when.clone());
            }
            specs.extend(def.provides.iter().filter_map(|p| p.when.clone()));
        }
        for spec in &specs {
            for (variant, value) in &spec.variants {
                self.referenced.insert(variant.clone());
                self.mentioned
                    .entry(variant.clone())
                    .or_default()
                    .extend(value.values().into_iter().map(str::to_string));
            }
        }
    }

    /// Facts about a reachable concrete package.
    pub fn package(&self, name: &str) -> Option<&PackageFacts> {
        self.packages.get(name)
    }

    /// Every reachable concrete package.
    pub fn packages(&self) -> impl Iterator<Item = (&str, &PackageFacts)> {
        self.packages.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether `name` is a virtual.
    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtuals.contains_key(name) || self.snapshot.repo().is_virtual(name)
    }

    /// Reachable providers of a virtual, sorted by name.
    pub fn providers(&self, name: &str) -> &[String] {
        self.virtuals.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every reachable virtual.
    pub fn virtuals(&self) -> impl Iterator<Item = &str> {
        self.virtuals.keys().map(String::as_str)
    }

    /// Whether the repository knows `name` at all, reachable or not.
    pub fn knows(&self, name: &str) -> bool {
        let repo = self.snapshot.repo();
        repo.package(name).is_some() || repo.is_virtual(name)
    }

    /// Whether any request, policy entry or definition mentions `variant`.
    pub fn is_referenced(&self, variant: &str) -> bool {
        self.referenced.contains(variant)
    }

    /// Values mentioned for `variant`.
    pub fn mentioned_values(&self, variant: &str) -> BTreeSet<String> {
        self.mentioned.get(variant).cloned().unwrap_or_default()
    }

    /// The repository snapshot the facts were read from.
    pub fn snapshot(&self) -> &RepoSnapshot {
        &self.snapshot
    }
}

/// Preferred versions first, then regular ones by the tie-break, then
/// deprecated ones.
fn order_versions(def: &PackageDef, tie_break: TieBreak) -> Vec<VersionDecl> {
    let mut versions = def.versions.clone();
    versions.sort_by(|a, b| {
        let class = |d: &VersionDecl| match (d.preferred, d.deprecated) {
            (_, true) => 2,
            (true, false) => 0,
            (false, false) => 1,
        };
        class(a).cmp(&class(b)).then_with(|| match tie_break {
            TieBreak::Newest => b.version.cmp(&a.version),
            TieBreak::Oldest => a.version.cmp(&b.version),
        })
    });
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn snapshot() -> RepoSnapshot {
        let repo = InMemoryRepository::from_yaml_str(
            r#"
packages:
  app:
    versions: ["1.0"]
    variants: {mpi: {default: false}}
    depends_on: [c, {spec: mpi, when: "+mpi"}]
  gcc:
    versions: ["12.3", "13.2", {version: "11.4", deprecated: true}, {version: "12.1", preferred: true}]
    provides: [c]
  clang:
    versions: ["17"]
    provides: [c]
  openmpi:
    versions: ["5.0"]
    provides: [mpi]
  orphan:
    versions: ["1"]
"#,
        )
        .unwrap();
        RepoSnapshot::new(repo)
    }

    #[test]
    fn closure_follows_dependencies_and_providers() {
        let request = [Spec::parse("app+mpi").unwrap()];
        let facts = FactBase::collect(&snapshot(), &Policy::default(), &request, &ReuseIndex::default()).unwrap();
        let names: Vec<&str> = facts.packages().map(|(n, _)| n).collect();
        assert_eq!(names, ["app", "clang", "gcc", "openmpi"]);
        assert_eq!(facts.providers("c"), ["clang", "gcc"]);
        assert!(facts.is_virtual("mpi"));
        assert!(facts.is_referenced("mpi"));
        assert!(facts.knows("orphan"));
        assert!(facts.package("orphan").is_none());
    }

    #[test]
    fn version_order() {
        let request = [Spec::parse("gcc").unwrap()];
        let facts = FactBase::collect(&snapshot(), &Policy::default(), &request, &ReuseIndex::default()).unwrap();
        let gcc = facts.package("gcc").unwrap();
        let order: Vec<&str> = gcc.versions.iter().map(|d| d.version.as_str()).collect();
        assert_eq!(order, ["12.1", "13.2", "12.3", "11.4"]);
        assert_eq!(gcc.rank(&Version::parse("13.2").unwrap()), 1);
        assert_eq!(gcc.rank(&Version::parse("9").unwrap()), 4);

        let mut oldest = Policy::default();
        oldest.tie_break = TieBreak::Oldest;
        let facts = FactBase::collect(&snapshot(), &oldest, &request, &ReuseIndex::default()).unwrap();
        let order: Vec<&str> = facts.package("gcc").unwrap().versions.iter().map(|d| d.version.as_str()).collect();
        assert_eq!(order, ["12.1", "12.3", "13.2", "11.4"]);
    }

    #[test]
    fn unknown_names_are_reported() {
        let request = [Spec::parse("nonexistent").unwrap()];
        let err = FactBase::collect(&snapshot(), &Policy::default(), &request, &ReuseIndex::default()).unwrap_err();
        assert!(matches!(err, ConcretizeError::UnknownPackage { ref name, needed_by: None } if name == "nonexistent"));
    }
}
