//! Package repository abstraction.
//!
//! [`PackageRepository`] provides read-only access to package definitions.
//! [`InMemoryRepository`] is a simple implementation for tests and small
//! stacks, loadable from YAML. [`RepoSnapshot`] is the immutable, shared
//! view a solve reads from.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;

use crate::config::{ConfigError, Scalar};
use crate::package::{PackageBuilder, PackageDef};
use crate::spec::DepTypes;

/// Read-only package database.
pub trait PackageRepository: Send + Sync {
    /// Names of every concrete package.
    fn all_packages(&self) -> Vec<String>;

    /// Definition of a concrete package.
    fn package(&self, name: &str) -> Option<Arc<PackageDef>>;

    /// Packages that may provide `virtual_name`, sorted by name.
    fn providers(&self, virtual_name: &str) -> Vec<String>;

    /// Whether `name` is a virtual, i.e. provided by some package.
    fn is_virtual(&self, name: &str) -> bool {
        !self.providers(name).is_empty()
    }
}

/// In-memory repository backed by ordered maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    packages: BTreeMap<String, Arc<PackageDef>>,
    providers: BTreeMap<String, BTreeSet<String>>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a package definition.
    pub fn add(&mut self, def: PackageDef) {
        for providers in self.providers.values_mut() {
            providers.remove(&def.name);
        }
        for virtual_name in def.provided_virtuals() {
            self.providers
                .entry(virtual_name.to_string())
                .or_default()
                .insert(def.name.clone());
        }
        self.providers.retain(|_, p| !p.is_empty());
        self.packages.insert(def.name.clone(), Arc::new(def));
    }

    /// Load a repository from the YAML format:
    ///
    /// ```yaml
    /// packages:
    ///   zlib:
    ///     versions: ["1.3", {version: "1.2.13", deprecated: true}]
    ///     variants:
    ///       shared: {default: true}
    ///       level: {values: ["1", "6", "9"], default: "6"}
    ///     depends_on:
    ///       - c
    ///       - {spec: "cmake@3.18:", type: build, when: "+shared"}
    ///     conflicts: [{spec: "%clang", when: "@1.2", message: "needs gcc"}]
    ///     provides: [{virtual: zlib-api}]
    ///     requires: [{spec: "+shared", when: "@1.3:"}]
    /// ```
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let file: RepositoryFile = serde_yaml::from_str(text)?;
        let mut repo = Self::new();
        for (name, entry) in file.packages {
            repo.add(entry.into_definition(&name)?);
        }
        Ok(repo)
    }
}

impl PackageRepository for InMemoryRepository {
    fn all_packages(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }

    fn package(&self, name: &str) -> Option<Arc<PackageDef>> {
        self.packages.get(name).cloned()
    }

    fn providers(&self, virtual_name: &str) -> Vec<String> {
        self.providers
            .get(virtual_name)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Immutable, versioned view of a repository shared by concurrent solves.
#[derive(Clone)]
pub struct RepoSnapshot {
    /// Revision of the package definitions; changes whenever they do.
    pub revision: u64,
    repo: Arc<dyn PackageRepository>,
}

impl RepoSnapshot {
    /// Wrap a repository at revision 0.
    pub fn new(repo: impl PackageRepository + 'static) -> Self {
        Self::at_revision(0, Arc::new(repo))
    }

    /// Wrap a shared repository at a given revision.
    pub fn at_revision(revision: u64, repo: Arc<dyn PackageRepository>) -> Self {
        Self { revision, repo }
    }

    /// The underlying repository.
    pub fn repo(&self) -> &dyn PackageRepository {
        self.repo.as_ref()
    }
}

impl std::fmt::Debug for RepoSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSnapshot")
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

// --- YAML shape ---

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryFile {
    #[serde(default)]
    packages: BTreeMap<String, PackageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageEntry {
    versions: Vec<VersionEntry>,
    #[serde(default)]
    variants: BTreeMap<String, VariantEntry>,
    #[serde(default)]
    depends_on: Vec<DependsEntry>,
    #[serde(default)]
    conflicts: Vec<RuleEntry>,
    #[serde(default)]
    provides: Vec<ProvidesEntry>,
    #[serde(default)]
    requires: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VersionEntry {
    Plain(Scalar),
    Detailed {
        version: Scalar,
        #[serde(default)]
        preferred: bool,
        #[serde(default)]
        deprecated: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariantEntry {
    default: Option<Scalar>,
    values: Option<Vec<Scalar>>,
    #[serde(default)]
    multi: bool,
    #[serde(default)]
    free: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependsEntry {
    Plain(String),
    Detailed {
        spec: String,
        #[serde(rename = "type")]
        types: Option<String>,
        when: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuleEntry {
    Plain(String),
    Detailed {
        spec: String,
        when: Option<String>,
        message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProvidesEntry {
    Plain(String),
    Detailed {
        #[serde(rename = "virtual")]
        name: String,
        when: Option<String>,
    },
}

impl PackageEntry {
    fn into_definition(self, name: &str) -> Result<PackageDef, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            path: format!("packages:{name}"),
            message,
        };
        let mut builder = PackageBuilder::new(name);
        for entry in self.versions {
            builder = match entry {
                VersionEntry::Plain(v) => builder.version(&v.to_string()),
                VersionEntry::Detailed {
                    version,
                    preferred,
                    deprecated,
                } => builder.version_with(&version.to_string(), preferred, deprecated),
            };
        }
        for (variant, entry) in self.variants {
            let values: Vec<String> = entry
                .values
                .unwrap_or_default()
                .iter()
                .map(Scalar::to_string)
                .collect();
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            let default = entry.default.as_ref().map(Scalar::to_string);
            builder = if entry.free {
                builder.free_variant(&variant, default.as_deref().unwrap_or_default())
            } else if values.is_empty() {
                let default = match entry.default {
                    None | Some(Scalar::Bool(false)) => false,
                    Some(Scalar::Bool(true)) => true,
                    Some(other) => {
                        return Err(invalid(format!(
                            "boolean variant '{variant}' has non-boolean default '{other}'"
                        )));
                    }
                };
                builder.bool_variant(&variant, default)
            } else {
                let default = default.unwrap_or_else(|| values[0].to_string());
                if entry.multi {
                    builder.multi_variant(&variant, &values, &default)
                } else {
                    builder.value_variant(&variant, &values, &default)
                }
            };
        }
        for entry in self.depends_on {
            builder = match entry {
                DependsEntry::Plain(spec) => builder.depends_on(&spec),
                DependsEntry::Detailed { spec, types, when } => {
                    let types = match types {
                        Some(text) => DepTypes::parse(&text)
                            .ok_or_else(|| invalid(format!("invalid dependency type '{text}'")))?,
                        None => DepTypes::build_link(),
                    };
                    builder.depends_on_with(&spec, types, when.as_deref())
                }
            };
        }
        for entry in self.conflicts {
            builder = match entry {
                RuleEntry::Plain(spec) => builder.conflicts(&spec),
                RuleEntry::Detailed {
                    spec,
                    when,
                    message,
                } => builder.conflicts_with(&spec, when.as_deref(), message.as_deref()),
            };
        }
        for entry in self.provides {
            builder = match entry {
                ProvidesEntry::Plain(name) => builder.provides(&name),
                ProvidesEntry::Detailed { name, when } => builder.provides_when(&name, when.as_deref()),
            };
        }
        for entry in self.requires {
            builder = match entry {
                RuleEntry::Plain(spec) => builder.requires(&spec, None, None),
                RuleEntry::Detailed {
                    spec,
                    when,
                    message,
                } => builder.requires(&spec, when.as_deref(), message.as_deref()),
            };
        }
        Ok(builder.build()?)
    }
}
