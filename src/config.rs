//! Serde shape of the policy configuration.
//!
//! This module only describes what the YAML looks like; turning it into an
//! immutable [`Policy`](crate::policy::Policy) (parsing every spec string,
//! resolving defaults) happens in [`crate::policy`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::package::DefinitionError;
use crate::parse::ParseError;

/// Error raised while loading policy or repository configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid YAML or does not have the expected shape.
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON document (e.g. an exported graph) is malformed.
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    /// A spec string failed to parse.
    #[error("{path}: {source}")]
    Spec {
        /// Location in the document, e.g. `packages:hdf5:require[1]`.
        path: String,
        /// The parse failure.
        source: ParseError,
    },

    /// A value is well-formed but not acceptable.
    #[error("{path}: {message}")]
    Invalid {
        /// Location in the document.
        path: String,
        /// What is wrong.
        message: String,
    },

    /// A package definition is inconsistent.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// A YAML scalar read as text, so that `version: [1.2]` works unquoted.
///
/// Numbers go through YAML's float reading, so `1.10` becomes `1.1`; quote
/// such versions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar.
    Number(serde_yaml::Number),
    /// String scalar.
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// One value or a list of values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A list of values.
    Many(Vec<T>),
    /// A single value.
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    /// Flatten into a list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Top-level policy document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Per-package blocks; the key `all` applies to every package.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageConfig>,
    /// Solver settings.
    #[serde(default)]
    pub concretizer: ConcretizerConfig,
}

/// Policy for one package (or `all`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    /// Hard requirements.
    #[serde(default)]
    pub require: OneOrMany<RequireEntry>,
    /// Ranked strong preferences.
    #[serde(default)]
    pub prefer: OneOrMany<PreferEntry>,
    /// Hard conflicts.
    #[serde(default)]
    pub conflict: OneOrMany<ConflictEntry>,
    /// Ordered version preferences.
    #[serde(default)]
    pub version: OneOrMany<Scalar>,
    /// Variant preferences, e.g. `"+shared ~debug"`.
    #[serde(default)]
    pub variants: OneOrMany<String>,
    /// Ordered provider preferences per virtual.
    #[serde(default)]
    pub providers: BTreeMap<String, Vec<String>>,
    /// `false` forbids building the package from source.
    pub buildable: Option<bool>,
    /// Installations that exist outside the store.
    #[serde(default)]
    pub externals: Vec<ExternalEntry>,
}

/// Entry of a `require` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RequireEntry {
    /// A single predicate.
    Plain(String),
    /// A predicate group with an optional condition.
    Detailed(RequireDetail),
}

/// Long form of a `require` entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequireDetail {
    /// A single predicate.
    pub spec: Option<String>,
    /// Exactly one of these predicates must hold.
    pub one_of: Option<Vec<String>>,
    /// At least one of these predicates must hold.
    pub any_of: Option<Vec<String>>,
    /// Applies only when the node matches this predicate.
    pub when: Option<String>,
    /// Shown when the requirement rules out a request.
    pub message: Option<String>,
}

/// Entry of a `prefer` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PreferEntry {
    /// A predicate ranked by its position.
    Plain(String),
    /// A predicate with explicit rank and condition.
    Detailed {
        /// The predicate.
        spec: String,
        /// Applies only when the node matches this predicate.
        when: Option<String>,
        /// Explicit rank; equal ranks cost the same.
        rank: Option<u32>,
    },
}

/// Entry of a `conflict` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConflictEntry {
    /// A predicate that must never hold.
    Plain(String),
    /// A conditional conflict.
    Detailed {
        /// The predicate.
        spec: String,
        /// Applies only when the node matches this predicate.
        when: Option<String>,
        /// Shown when the conflict rules out a request.
        message: Option<String>,
    },
}

/// An installation living outside the store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalEntry {
    /// Concrete description, e.g. `openssl@3.0.2 ~docs`.
    pub spec: String,
    /// Installation prefix.
    pub prefix: Option<String>,
}

/// `concretizer:` block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcretizerConfig {
    /// `true`, `false` or `dependencies`.
    pub reuse: Option<Scalar>,
    /// `requested` or `constrained`.
    pub roots: Option<String>,
    /// `newest` or `oldest`.
    pub tie_break: Option<String>,
    /// Targets in preference order.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Allow deprecated versions.
    #[serde(default)]
    pub allow_deprecated: bool,
    /// `best-effort` or `error`.
    pub on_timeout: Option<String>,
    /// Search budget.
    #[serde(default)]
    pub budget: BudgetConfig,
}

/// `concretizer: budget:` block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    /// Maximum branch-and-bound steps.
    pub max_steps: Option<u64>,
    /// Wall-clock limit in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl PolicyConfig {
    /// Parse a YAML policy document.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document() {
        let config = PolicyConfig::from_yaml_str(
            r#"
packages:
  all:
    require: "%gcc"
    providers: {mpi: [openmpi, mpich]}
  hdf5:
    require:
      - "@1.12:"
      - {one_of: ["+mpi", "~mpi"], when: "@1.14", message: "pick one"}
    prefer: ["@1.14", {spec: "+cxx", rank: 0}]
    conflict: [{spec: "%clang", when: "+fortran"}]
    version: [1.14, "1.12:"]
    variants: "+shared ~debug"
    buildable: true
  openssl:
    buildable: false
    externals: [{spec: "openssl@3.0.2", prefix: /usr}]
concretizer:
  reuse: dependencies
  targets: [zen3, x86_64]
  budget: {max_steps: 1000}
"#,
        )
        .unwrap();
        let all = &config.packages["all"];
        assert_eq!(all.require.clone().into_vec(), [RequireEntry::Plain("%gcc".into())]);
        let hdf5 = &config.packages["hdf5"];
        let require = hdf5.require.clone().into_vec();
        assert_eq!(require.len(), 2);
        assert!(matches!(&require[1], RequireEntry::Detailed(d) if d.one_of.as_ref().is_some_and(|v| v.len() == 2)));
        let versions: Vec<String> = hdf5.version.clone().into_vec().iter().map(Scalar::to_string).collect();
        assert_eq!(versions, ["1.14", "1.12:"]);
        assert_eq!(config.packages["openssl"].buildable, Some(false));
        assert_eq!(config.concretizer.reuse, Some(Scalar::Text("dependencies".into())));
        assert_eq!(config.concretizer.budget.max_steps, Some(1000));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PolicyConfig::from_yaml_str("concretizer: {reuse: true, colour: red}").is_err());
    }

    #[test]
    fn empty_document() {
        let config = PolicyConfig::from_yaml_str("{}").unwrap();
        assert!(config.packages.is_empty());
    }
}
