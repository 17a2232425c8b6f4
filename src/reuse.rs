//! Installed, cached and external nodes available for reuse.
//!
//! A [`ReuseSource`] is anything that can list concrete nodes: the local
//! store, a build cache, or the externals configured in policy. At the
//! start of every solve the sources are read once into a [`ReuseIndex`],
//! so concurrent installs never change what a running solve sees.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::materialize::{ConcreteGraph, NodeOrigin, SpecHash};
use crate::package::PackageDef;
use crate::policy::ExternalRule;
use crate::spec::{DepTypes, DependencyKind, Spec, VariantValue};
use crate::version::{Version, VersionRange};

/// Where a reusable node comes from. Ordered from most to least preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Installed outside the store and declared in policy.
    External,
    /// Installed in the local store.
    Installed,
    /// Available as a binary from a build cache.
    BuildCache,
}

impl Provenance {
    /// Cost rank used by the reuse-provenance criterion.
    pub fn rank(self) -> u64 {
        match self {
            Provenance::External => 0,
            Provenance::Installed => 1,
            Provenance::BuildCache => 2,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provenance::External => "external",
            Provenance::Installed => "installed",
            Provenance::BuildCache => "build-cache",
        })
    }
}

/// An edge of a reusable node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordEdge {
    /// Dependency package name.
    pub name: String,
    /// Identity of the exact dependency node.
    pub hash: SpecHash,
    /// Edge types.
    pub types: DepTypes,
    /// Virtuals this edge satisfies.
    #[serde(default)]
    pub virtuals: BTreeSet<String>,
}

/// A concrete node that may be reused instead of built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseRecord {
    /// Structural identity.
    pub hash: SpecHash,
    /// Package name.
    pub name: String,
    /// Version.
    pub version: Version,
    /// Every variant value.
    pub variants: BTreeMap<String, VariantValue>,
    /// Target.
    pub target: String,
    /// Where it comes from.
    pub provenance: Provenance,
    /// Exact dependencies.
    #[serde(default)]
    pub dependencies: Vec<RecordEdge>,
    /// Installation prefix, when known.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl ReuseRecord {
    /// Whether the record satisfies the self part of `spec`.
    pub fn self_matches(&self, spec: &Spec) -> bool {
        spec.self_matches(&self.name, &self.version, &self.variants, &self.target)
    }

    /// Build the record of an external installation. Unspecified variants
    /// take their defaults and the target is the first configured one.
    pub fn external(rule: &ExternalRule, def: &PackageDef, target: &str) -> Option<Self> {
        let version = match rule.spec.versions.ranges() {
            [VersionRange::Exact(v) | VersionRange::Prefix(v)] => v.clone(),
            _ => return None,
        };
        let mut variants = def.default_variants();
        variants.extend(rule.spec.variants.clone());
        let target = rule.spec.target.clone().unwrap_or_else(|| target.to_string());
        let mut record = ReuseRecord {
            hash: SpecHash::default(),
            name: def.name.clone(),
            version,
            variants,
            target,
            provenance: Provenance::External,
            dependencies: Vec::new(),
            prefix: rule.prefix.clone(),
        };
        record.hash = SpecHash::of_record(&record);
        Some(record)
    }

    /// Records for every node of a concrete graph.
    pub fn from_graph(graph: &ConcreteGraph, provenance: Provenance) -> Vec<Self> {
        let hashes: HashMap<&str, &SpecHash> =
            graph.nodes.iter().map(|n| (n.name.as_str(), &n.hash)).collect();
        graph
            .nodes
            .iter()
            .map(|node| ReuseRecord {
                hash: node.hash.clone(),
                name: node.name.clone(),
                version: node.version.clone(),
                variants: node.variants.clone(),
                target: node.target.clone(),
                provenance: match node.origin {
                    NodeOrigin::Reused(Provenance::External) => Provenance::External,
                    _ => provenance,
                },
                dependencies: node
                    .dependencies
                    .iter()
                    .filter_map(|edge| {
                        Some(RecordEdge {
                            name: edge.name.clone(),
                            hash: (*hashes.get(edge.name.as_str())?).clone(),
                            types: edge.types.clone(),
                            virtuals: edge.virtuals.clone(),
                        })
                    })
                    .collect(),
                prefix: None,
            })
            .collect()
    }
}

/// A provider of reusable nodes.
pub trait ReuseSource: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    /// Every record currently available.
    fn records(&self) -> Vec<ReuseRecord>;
}

/// Thread-safe in-memory store, e.g. the local installation database.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    name: String,
    records: RwLock<Vec<ReuseRecord>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::default(),
        }
    }

    /// Add one record, replacing any with the same hash.
    pub fn add(&self, record: ReuseRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.retain(|r| r.hash != record.hash);
        records.push(record);
    }

    /// Record every node of a concrete graph.
    pub fn install(&self, graph: &ConcreteGraph, provenance: Provenance) {
        for record in ReuseRecord::from_graph(graph, provenance) {
            self.add(record);
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReuseSource for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&self) -> Vec<ReuseRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Snapshot of every reusable node, taken when a solve starts.
#[derive(Debug, Clone, Default)]
pub struct ReuseIndex {
    records: Vec<ReuseRecord>,
    by_hash: HashMap<SpecHash, usize>,
    by_name: BTreeMap<String, Vec<usize>>,
}

impl ReuseIndex {
    /// Read every source once. Externals come first. When two sources
    /// hold the same hash the better provenance wins, then the earlier source.
    pub fn snapshot(externals: Vec<ReuseRecord>, sources: &[Arc<dyn ReuseSource>]) -> Self {
        let mut index = Self::default();
        for record in externals {
            index.insert(record);
        }
        for source in sources {
            let records = source.records();
            debug!(source = source.name(), records = records.len(), "reuse source snapshot");
            for record in records {
                index.insert(record);
            }
        }
        index
    }

    fn insert(&mut self, record: ReuseRecord) {
        if let Some(&i) = self.by_hash.get(&record.hash) {
            if record.provenance.rank() < self.records[i].provenance.rank() {
                self.records[i] = record;
            }
            return;
        }
        let i = self.records.len();
        self.by_hash.insert(record.hash.clone(), i);
        self.by_name.entry(record.name.clone()).or_default().push(i);
        self.records.push(record);
    }

    /// Record at a position.
    pub fn get(&self, index: usize) -> Option<&ReuseRecord> {
        self.records.get(index)
    }

    /// Position of the record with `hash`.
    pub fn position(&self, hash: &SpecHash) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    /// Record with `hash`.
    pub fn by_hash(&self, hash: &SpecHash) -> Option<&ReuseRecord> {
        self.position(hash).and_then(|i| self.get(i))
    }

    /// Positions of the records for a package.
    pub fn positions_for(&self, name: &str) -> &[usize] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Records for a package.
    pub fn records_for<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a ReuseRecord> + 'a {
        self.positions_for(name).iter().filter_map(|&i| self.get(i))
    }

    /// Names of every package with records.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether every dependency of the record, recursively, is present.
    pub fn is_complete(&self, record: &ReuseRecord) -> bool {
        let mut stack = vec![record];
        let mut seen = BTreeSet::new();
        while let Some(r) = stack.pop() {
            if !seen.insert(&r.hash) {
                continue;
            }
            for edge in &r.dependencies {
                match self.by_hash(&edge.hash) {
                    Some(dep) => stack.push(dep),
                    None => return false,
                }
            }
        }
        true
    }

    /// Records satisfying `spec`, including its direct dependency
    /// constraints, which are checked against the recorded edges.
    pub fn compatible(&self, spec: &Spec) -> Vec<&ReuseRecord> {
        let Some(name) = spec.name.as_deref() else {
            return Vec::new();
        };
        self.records_for(name)
            .filter(|r| r.self_matches(spec))
            .filter(|r| {
                spec.dependencies.iter().all(|dep| match &dep.kind {
                    DependencyKind::Direct { .. } => r.dependencies.iter().any(|edge| {
                        (edge.name == dep.name() || edge.virtuals.contains(dep.name()))
                            && self.by_hash(&edge.hash).is_some_and(|d| {
                                d.self_matches(&Spec {
                                    name: None,
                                    ..dep.spec.self_part()
                                })
                            })
                    }),
                    DependencyKind::Transitive => true,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, deps: &[&ReuseRecord]) -> ReuseRecord {
        let mut r = ReuseRecord {
            hash: SpecHash::default(),
            name: name.into(),
            version: Version::parse(version).unwrap(),
            variants: BTreeMap::new(),
            target: "x86_64".into(),
            provenance: Provenance::Installed,
            dependencies: deps
                .iter()
                .map(|d| RecordEdge {
                    name: d.name.clone(),
                    hash: d.hash.clone(),
                    types: DepTypes::build_link(),
                    virtuals: BTreeSet::new(),
                })
                .collect(),
            prefix: None,
        };
        r.hash = SpecHash::of_record(&r);
        r
    }

    #[test]
    fn snapshot_is_isolated_from_later_installs() {
        let store = Arc::new(InMemoryStore::new("store"));
        store.add(record("zlib", "1.3", &[]));
        let sources: Vec<Arc<dyn ReuseSource>> = vec![store.clone()];
        let index = ReuseIndex::snapshot(Vec::new(), &sources);
        store.add(record("zlib", "1.2", &[]));
        assert_eq!(index.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn compatible_checks_direct_dependencies() {
        let zlib = record("zlib", "1.3", &[]);
        let libpng = record("libpng", "1.6", &[&zlib]);
        let store = InMemoryStore::new("store");
        store.add(zlib.clone());
        store.add(libpng.clone());
        let sources: Vec<Arc<dyn ReuseSource>> = vec![Arc::new(store)];
        let index = ReuseIndex::snapshot(Vec::new(), &sources);

        assert_eq!(index.compatible(&Spec::parse("libpng %zlib@1.3").unwrap()).len(), 1);
        assert!(index.compatible(&Spec::parse("libpng %zlib@1.2").unwrap()).is_empty());
        assert!(index.compatible(&Spec::parse("libpng@1.5").unwrap()).is_empty());
        assert!(index.is_complete(&libpng));
    }

    #[test]
    fn incomplete_records_are_detected() {
        let zlib = record("zlib", "1.3", &[]);
        let libpng = record("libpng", "1.6", &[&zlib]);
        let index = ReuseIndex::snapshot(vec![libpng.clone()], &[]);
        assert!(!index.is_complete(&libpng));
    }

    #[test]
    fn duplicate_hashes_keep_the_best_provenance() {
        let mut external = record("zlib", "1.3", &[]);
        external.provenance = Provenance::External;
        let store = InMemoryStore::new("store");
        store.add(record("zlib", "1.3", &[]));
        let sources: Vec<Arc<dyn ReuseSource>> = vec![Arc::new(store)];
        let index = ReuseIndex::snapshot(vec![external], &sources);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records_for("zlib").next().unwrap().provenance, Provenance::External);

        let mut cached = record("zlib", "1.3", &[]);
        cached.provenance = Provenance::BuildCache;
        let cache = InMemoryStore::new("cache");
        cache.add(cached);
        let local = InMemoryStore::new("local");
        local.add(record("zlib", "1.3", &[]));
        let sources: Vec<Arc<dyn ReuseSource>> = vec![Arc::new(cache), Arc::new(local)];
        let index = ReuseIndex::snapshot(Vec::new(), &sources);
        assert_eq!(index.len(), 1);
        assert_eq!(index.records_for("zlib").next().unwrap().provenance, Provenance::Installed);
        assert_eq!(index.compatible(&Spec::named("zlib")).len(), 1);
    }
}
