//! Immutable policy and the policy compiler.
//!
//! [`Policy`] is the parsed, validated form of the configuration. It is
//! built once, shared through [`Arc`] and never mutated by a solve.
//! [`PolicyCompiler`] combines it with a request into hard constraints
//! (each traceable to its origin, so infeasibility can be explained) and
//! the tiered cost model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{
    ConfigError, ConflictEntry, OneOrMany, PackageConfig, PolicyConfig, PreferEntry, RequireEntry,
    Scalar,
};
use crate::cost::CostModel;
use crate::error::{ConcretizeError, Result};
use crate::facts::FactBase;
use crate::package::merge_predicates;
use crate::solver::SearchBudget;
use crate::spec::{DependencyKind, Spec, VariantValue};
use crate::version::{VersionConstraint, VersionRange};

/// Which packages may be satisfied by reusing existing installations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReuseMode {
    /// Build everything from source (externals are still used).
    None,
    /// Reuse anything except the roots.
    DependenciesOnly,
    /// Reuse anything.
    All,
}

/// Which packages count as roots for [`ReuseMode::DependenciesOnly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RootScope {
    /// The packages named by the request specs.
    #[default]
    Requested,
    /// Additionally every package named by a `^` constraint of a request.
    Constrained,
}

/// Order among versions that no policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TieBreak {
    /// Newest first.
    #[default]
    Newest,
    /// Oldest first.
    Oldest,
}

/// What to do when the search budget runs out after a feasible graph was
/// found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TimeoutPolicy {
    /// Return the best graph, marked best-effort.
    #[default]
    BestEffort,
    /// Fail with a timeout error carrying the best graph.
    Error,
}

/// A hard requirement: one (or, for groups, one or any) of the
/// alternatives must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireRule {
    /// Alternatives.
    pub alternatives: Vec<Spec>,
    /// `one_of` rather than `any_of`.
    pub exclusive: bool,
    /// Applies only when the node matches.
    pub when: Option<Spec>,
    /// Shown in explanations.
    pub message: Option<String>,
    /// Text as written in the configuration.
    pub text: String,
}

/// A ranked strong preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferRule {
    /// The preferred predicate.
    pub spec: Spec,
    /// Applies only when the node matches.
    pub when: Option<Spec>,
    /// Lower is better; equal ranks cost the same.
    pub rank: u32,
}

/// A hard conflict; its condition is folded into `spec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRule {
    /// The forbidden predicate.
    pub spec: Spec,
    /// Shown in explanations.
    pub message: Option<String>,
    /// Text as written in the configuration.
    pub text: String,
}

/// A configured external installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRule {
    /// Concrete description.
    pub spec: Spec,
    /// Installation prefix.
    pub prefix: Option<String>,
}

/// Policy for one package, or for `all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePolicy {
    /// Hard requirements.
    pub require: Vec<RequireRule>,
    /// Strong preferences.
    pub prefer: Vec<PreferRule>,
    /// Hard conflicts.
    pub conflict: Vec<ConflictRule>,
    /// Version preferences, best first.
    pub versions: Vec<VersionConstraint>,
    /// Preferred variant values.
    pub variants: BTreeMap<String, VariantValue>,
    /// Provider preferences per virtual, best first.
    pub providers: BTreeMap<String, Vec<String>>,
    /// Whether the package may be built from source.
    pub buildable: bool,
    /// External installations.
    pub externals: Vec<ExternalRule>,
}

impl Default for PackagePolicy {
    fn default() -> Self {
        Self {
            require: Vec::new(),
            prefer: Vec::new(),
            conflict: Vec::new(),
            versions: Vec::new(),
            variants: BTreeMap::new(),
            providers: BTreeMap::new(),
            buildable: true,
            externals: Vec::new(),
        }
    }
}

/// Scope key for policy that applies to every package.
pub const ALL: &str = "all";

/// Parsed, immutable policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    all: PackagePolicy,
    packages: BTreeMap<String, PackagePolicy>,
    /// Reuse mode.
    pub reuse: ReuseMode,
    /// Root scope for dependencies-only reuse.
    pub roots: RootScope,
    /// Version tie-break.
    pub tie_break: TieBreak,
    /// Targets, best first.
    pub targets: Vec<String>,
    /// Whether deprecated versions may be chosen.
    pub allow_deprecated: bool,
    /// Timeout behaviour.
    pub on_timeout: TimeoutPolicy,
    /// Default search budget.
    pub budget: SearchBudget,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            all: PackagePolicy::default(),
            packages: BTreeMap::new(),
            reuse: ReuseMode::All,
            roots: RootScope::default(),
            tie_break: TieBreak::default(),
            targets: vec!["x86_64".to_string()],
            allow_deprecated: false,
            on_timeout: TimeoutPolicy::default(),
            budget: SearchBudget::default(),
        }
    }
}

fn spec_at(path: &str, text: &str) -> std::result::Result<Spec, ConfigError> {
    Spec::parse(text).map_err(|source| ConfigError::Spec {
        path: path.to_string(),
        source,
    })
}

fn when_at(path: &str, text: Option<&str>) -> std::result::Result<Option<Spec>, ConfigError> {
    text.map(|t| spec_at(&format!("{path}:when"), t)).transpose()
}

fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_string(),
        message: message.into(),
    }
}

impl PackagePolicy {
    fn from_config(scope: &str, config: PackageConfig) -> std::result::Result<Self, ConfigError> {
        let base = format!("packages:{scope}");
        let mut policy = PackagePolicy::default();

        for (i, entry) in config.require.into_vec().into_iter().enumerate() {
            let path = format!("{base}:require[{i}]");
            let rule = match entry {
                RequireEntry::Plain(text) => RequireRule {
                    alternatives: vec![spec_at(&path, &text)?],
                    exclusive: false,
                    when: None,
                    message: None,
                    text,
                },
                RequireEntry::Detailed(detail) => {
                    let (texts, exclusive) = match (detail.spec, detail.one_of, detail.any_of) {
                        (Some(spec), None, None) => (vec![spec], false),
                        (None, Some(group), None) => (group, true),
                        (None, None, Some(group)) => (group, false),
                        _ => return Err(invalid(&path, "expected exactly one of spec, one_of, any_of")),
                    };
                    if texts.is_empty() {
                        return Err(invalid(&path, "empty requirement group"));
                    }
                    let alternatives = texts
                        .iter()
                        .map(|t| spec_at(&path, t))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    let keyword = if exclusive { "one_of" } else { "any_of" };
                    RequireRule {
                        text: if texts.len() == 1 {
                            texts[0].clone()
                        } else {
                            format!("{keyword}: [{}]", texts.join(", "))
                        },
                        alternatives,
                        exclusive,
                        when: when_at(&path, detail.when.as_deref())?,
                        message: detail.message,
                    }
                }
            };
            policy.require.push(rule);
        }

        for (i, entry) in config.prefer.into_vec().into_iter().enumerate() {
            let path = format!("{base}:prefer[{i}]");
            let default_rank = u32::try_from(i).unwrap_or(u32::MAX);
            let rule = match entry {
                PreferEntry::Plain(text) => PreferRule {
                    spec: spec_at(&path, &text)?,
                    when: None,
                    rank: default_rank,
                },
                PreferEntry::Detailed { spec, when, rank } => PreferRule {
                    spec: spec_at(&path, &spec)?,
                    when: when_at(&path, when.as_deref())?,
                    rank: rank.unwrap_or(default_rank),
                },
            };
            policy.prefer.push(rule);
        }

        for (i, entry) in config.conflict.into_vec().into_iter().enumerate() {
            let path = format!("{base}:conflict[{i}]");
            let (text, when, message) = match entry {
                ConflictEntry::Plain(text) => (text, None, None),
                ConflictEntry::Detailed {
                    spec,
                    when,
                    message,
                } => (spec, when, message),
            };
            let mut spec = spec_at(&path, &text)?;
            if let Some(when) = when_at(&path, when.as_deref())? {
                spec = merge_predicates(spec, when);
            }
            if spec.dependencies.len() > 1 {
                return Err(invalid(&path, "a conflict may constrain at most one dependency"));
            }
            policy.conflict.push(ConflictRule {
                spec,
                message,
                text,
            });
        }

        for (i, entry) in config.version.into_vec().into_iter().enumerate() {
            let path = format!("{base}:version[{i}]");
            let text = entry.to_string();
            let constraint =
                VersionConstraint::parse(&text).map_err(|e| invalid(&path, e.to_string()))?;
            policy.versions.push(constraint);
        }

        for (i, text) in config.variants.into_vec().into_iter().enumerate() {
            let path = format!("{base}:variants[{i}]");
            let spec = spec_at(&path, &text)?;
            if spec.name.is_some() || spec.has_dependency_constraints() {
                return Err(invalid(&path, "variant preferences may only list variants"));
            }
            policy.variants.extend(spec.variants);
        }

        policy.providers = config.providers;
        policy.buildable = config.buildable.unwrap_or(true);

        for (i, entry) in config.externals.into_iter().enumerate() {
            let path = format!("{base}:externals[{i}]");
            let spec = spec_at(&path, &entry.spec)?;
            if spec.name.as_deref() != Some(scope) {
                return Err(invalid(&path, format!("external must describe '{scope}'")));
            }
            if spec.has_dependency_constraints() {
                return Err(invalid(&path, "externals cannot have dependencies"));
            }
            let exact = matches!(
                spec.versions.ranges(),
                [VersionRange::Exact(_) | VersionRange::Prefix(_)]
            );
            if !exact {
                return Err(invalid(&path, "external needs a single version"));
            }
            policy.externals.push(ExternalRule {
                spec,
                prefix: entry.prefix,
            });
        }

        Ok(policy)
    }
}

impl Policy {
    /// Build from a parsed configuration document.
    pub fn from_config(config: PolicyConfig) -> std::result::Result<Self, ConfigError> {
        let mut policy = Policy::default();
        for (scope, package) in config.packages {
            let parsed = PackagePolicy::from_config(&scope, package)?;
            if scope == ALL {
                if !parsed.externals.is_empty() {
                    return Err(invalid("packages:all:externals", "externals must name a package"));
                }
                policy.all = parsed;
            } else {
                policy.packages.insert(scope, parsed);
            }
        }

        let c = config.concretizer;
        policy.reuse = match c.reuse {
            None | Some(Scalar::Bool(true)) => ReuseMode::All,
            Some(Scalar::Bool(false)) => ReuseMode::None,
            Some(Scalar::Text(t)) if t == "dependencies" => ReuseMode::DependenciesOnly,
            Some(other) => {
                return Err(invalid(
                    "concretizer:reuse",
                    format!("expected true, false or dependencies, found '{other}'"),
                ));
            }
        };
        policy.roots = match c.roots.as_deref() {
            None | Some("requested") => RootScope::Requested,
            Some("constrained") => RootScope::Constrained,
            Some(other) => {
                return Err(invalid("concretizer:roots", format!("unknown root scope '{other}'")));
            }
        };
        policy.tie_break = match c.tie_break.as_deref() {
            None | Some("newest") => TieBreak::Newest,
            Some("oldest") => TieBreak::Oldest,
            Some(other) => {
                return Err(invalid("concretizer:tie_break", format!("unknown tie-break '{other}'")));
            }
        };
        policy.on_timeout = match c.on_timeout.as_deref() {
            None | Some("best-effort") => TimeoutPolicy::BestEffort,
            Some("error") => TimeoutPolicy::Error,
            Some(other) => {
                return Err(invalid("concretizer:on_timeout", format!("unknown value '{other}'")));
            }
        };
        if !c.targets.is_empty() {
            policy.targets = c.targets;
        }
        policy.allow_deprecated = c.allow_deprecated;
        if let Some(steps) = c.budget.max_steps {
            policy.budget.max_steps = steps;
        }
        policy.budget.timeout = c.budget.timeout_ms.map(Duration::from_millis);
        Ok(policy)
    }

    /// Parse a YAML policy document.
    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, ConfigError> {
        Self::from_config(PolicyConfig::from_yaml_str(text)?)
    }

    /// Policy applying to every package.
    pub fn all(&self) -> &PackagePolicy {
        &self.all
    }

    /// Policy for one package, if configured.
    pub fn package(&self, name: &str) -> Option<&PackagePolicy> {
        self.packages.get(name)
    }

    /// Every configured scope, `all` first.
    pub fn scopes(&self) -> impl Iterator<Item = (&str, &PackagePolicy)> {
        std::iter::once((ALL, &self.all)).chain(self.packages.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Whether `name` may be built from source.
    pub fn buildable(&self, name: &str) -> bool {
        self.package(name).is_none_or(|p| p.buildable)
    }

    /// Index of `target` in the target preference list.
    pub fn target_rank(&self, target: &str) -> usize {
        self.targets
            .iter()
            .position(|t| t == target)
            .unwrap_or(self.targets.len())
    }

    /// Every spec the policy mentions, for fact collection.
    pub fn mentioned_specs(&self) -> Vec<&Spec> {
        let mut out = Vec::new();
        for (_, p) in self.scopes() {
            for r in &p.require {
                out.extend(r.alternatives.iter());
                out.extend(r.when.iter());
            }
            for r in &p.prefer {
                out.push(&r.spec);
                out.extend(r.when.iter());
            }
            out.extend(p.conflict.iter().map(|c| &c.spec));
            out.extend(p.externals.iter().map(|e| &e.spec));
        }
        out
    }

    /// Names of every package or virtual that policy requirements may pull
    /// into a graph.
    pub fn required_names(&self) -> BTreeSet<&str> {
        self.scopes()
            .flat_map(|(_, p)| p.require.iter())
            .flat_map(|r| r.alternatives.iter())
            .flat_map(|s| s.dependencies.iter())
            .filter_map(|d| d.spec.name.as_deref())
            .collect()
    }
}

/// Identifier of a removable hard constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(pub(crate) usize);

impl ConstraintId {
    /// Position in [`CompiledPolicy::constraints`].
    pub fn index(self) -> usize {
        self.0
    }
}

/// Where a hard constraint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintOrigin {
    /// A command-line or manifest request.
    Request {
        /// The constraint as written.
        spec: String,
    },
    /// A `require` entry of the policy.
    Require {
        /// Scope key.
        package: String,
        /// Position in the list.
        index: usize,
        /// Entry as written.
        spec: String,
        /// Configured message.
        message: Option<String>,
    },
    /// A `conflict` entry of the policy.
    Conflict {
        /// Scope key.
        package: String,
        /// Position in the list.
        index: usize,
        /// Entry as written.
        spec: String,
        /// Configured message.
        message: Option<String>,
    },
}

impl fmt::Display for ConstraintOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ConstraintOrigin::Request { spec } => {
                return write!(f, "request '{spec}'");
            }
            ConstraintOrigin::Require {
                package,
                index,
                spec,
                message,
            } => {
                write!(f, "packages:{package}:require[{index}] '{spec}'")?;
                message
            }
            ConstraintOrigin::Conflict {
                package,
                index,
                spec,
                message,
            } => {
                write!(f, "packages:{package}:conflict[{index}] '{spec}'")?;
                message
            }
        };
        if let Some(message) = message {
            write!(f, " ({message})")?;
        }
        Ok(())
    }
}

/// Packages a hard constraint applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every package; predicates on undeclared variants are vacuous.
    All,
    /// One package.
    Package(String),
    /// Every provider of a virtual.
    Virtual(String),
}

/// What a hard constraint demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// One (`exclusive`) or at least one of the alternatives must hold.
    Require {
        /// Alternatives.
        alternatives: Vec<Spec>,
        /// `one_of` semantics.
        exclusive: bool,
    },
    /// The predicate must never hold.
    Conflict(Spec),
}

/// A removable hard constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardConstraint {
    /// Identifier.
    pub id: ConstraintId,
    /// Where it comes from.
    pub origin: ConstraintOrigin,
    /// Packages it applies to.
    pub scope: Scope,
    /// Applies only to nodes matching this predicate.
    pub when: Option<Spec>,
    /// What it demands.
    pub rule: Rule,
}

/// A package that must be present in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// Package or virtual name.
    pub name: String,
    /// Constraint that introduced it; `None` for request roots.
    pub origin: Option<ConstraintId>,
    /// Whether this is a root of the graph.
    pub root: bool,
}

/// Output of the policy compiler for one request.
pub struct CompiledPolicy {
    /// The policy the request was compiled against.
    pub policy: Arc<Policy>,
    /// Removable hard constraints, indexed by [`ConstraintId`].
    pub constraints: Vec<HardConstraint>,
    /// Packages that must be present.
    pub presence: Vec<Presence>,
    /// Effective reuse mode.
    pub reuse: ReuseMode,
    /// Packages treated as roots for reuse scoping.
    pub roots: BTreeSet<String>,
    /// Tiered cost functions.
    pub costs: CostModel,
}

impl fmt::Debug for CompiledPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPolicy")
            .field("constraints", &self.constraints)
            .field("presence", &self.presence)
            .field("reuse", &self.reuse)
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

/// Translates policy plus request into hard constraints and costs.
pub struct PolicyCompiler<'a> {
    policy: &'a Arc<Policy>,
    facts: &'a FactBase,
}

impl<'a> PolicyCompiler<'a> {
    /// Compiler over a fact base collected for the same request.
    pub fn new(policy: &'a Arc<Policy>, facts: &'a FactBase) -> Self {
        Self { policy, facts }
    }

    /// Compile `request` with the given effective reuse mode.
    pub fn compile(&self, request: &[Spec], reuse: ReuseMode) -> Result<CompiledPolicy> {
        for spec in request {
            self.validate(None, spec)?;
        }

        let mut constraints = Vec::new();
        let mut push = |origin: ConstraintOrigin, scope: Scope, when: Option<Spec>, rule: Rule| {
            let id = ConstraintId(constraints.len());
            constraints.push(HardConstraint {
                id,
                origin,
                scope,
                when,
                rule,
            });
            id
        };

        for (key, package) in self.policy.scopes() {
            let Some(scope) = self.scope(key) else {
                continue;
            };
            let owner = (key != ALL).then_some(key);
            for (index, rule) in package.require.iter().enumerate() {
                for alternative in &rule.alternatives {
                    self.validate(owner, alternative)?;
                }
                push(
                    ConstraintOrigin::Require {
                        package: key.to_string(),
                        index,
                        spec: rule.text.clone(),
                        message: rule.message.clone(),
                    },
                    scope.clone(),
                    rule.when.clone(),
                    Rule::Require {
                        alternatives: rule.alternatives.clone(),
                        exclusive: rule.exclusive,
                    },
                );
            }
            for (index, rule) in package.conflict.iter().enumerate() {
                self.validate(owner, &rule.spec)?;
                push(
                    ConstraintOrigin::Conflict {
                        package: key.to_string(),
                        index,
                        spec: rule.text.clone(),
                        message: rule.message.clone(),
                    },
                    scope.clone(),
                    None,
                    Rule::Conflict(rule.spec.clone()),
                );
            }
        }

        let mut presence = Vec::new();
        let mut roots = BTreeSet::new();
        for spec in request {
            let Some(name) = spec.name.clone() else {
                continue;
            };
            roots.extend(self.expand(&name));
            presence.push(Presence {
                name: name.clone(),
                origin: None,
                root: true,
            });
            let own = Spec {
                dependencies: spec.direct_dependencies().cloned().collect(),
                ..spec.self_part()
            };
            if !own.is_unconstrained() {
                push(
                    ConstraintOrigin::Request {
                        spec: own.to_string(),
                    },
                    self.scope(&name).unwrap_or(Scope::Package(name.clone())),
                    None,
                    Rule::Require {
                        alternatives: vec![own],
                        exclusive: false,
                    },
                );
            }
            for nested in spec.transitive_dependencies() {
                let dep = nested.name().to_string();
                if self.policy.roots == RootScope::Constrained {
                    roots.extend(self.expand(&dep));
                }
                let id = push(
                    ConstraintOrigin::Request {
                        spec: format!("^{}", nested.spec),
                    },
                    self.scope(&dep).unwrap_or(Scope::Package(dep.clone())),
                    None,
                    Rule::Require {
                        alternatives: vec![nested.spec.clone()],
                        exclusive: false,
                    },
                );
                presence.push(Presence {
                    name: dep,
                    origin: Some(id),
                    root: false,
                });
            }
        }

        debug!(
            constraints = constraints.len(),
            roots = roots.len(),
            ?reuse,
            "compiled policy"
        );
        Ok(CompiledPolicy {
            policy: Arc::clone(self.policy),
            constraints,
            presence,
            reuse,
            roots,
            costs: CostModel::standard(),
        })
    }

    fn scope(&self, key: &str) -> Option<Scope> {
        if key == ALL {
            Some(Scope::All)
        } else if self.facts.package(key).is_some() {
            Some(Scope::Package(key.to_string()))
        } else if self.facts.is_virtual(key) {
            Some(Scope::Virtual(key.to_string()))
        } else {
            if !self.facts.knows(key) {
                warn!(package = key, "ignoring policy for unknown package");
            }
            None
        }
    }

    /// Concrete package names behind `name`.
    fn expand(&self, name: &str) -> Vec<String> {
        if self.facts.is_virtual(name) {
            self.facts.providers(name).to_vec()
        } else {
            vec![name.to_string()]
        }
    }

    /// Check that variants mentioned by `spec` exist and take valid values.
    fn validate(&self, owner: Option<&str>, spec: &Spec) -> Result<()> {
        if let Some(name) = spec.name.as_deref().or(owner) {
            self.validate_variants(name, &spec.variants)?;
        }
        for dep in &spec.dependencies {
            if let DependencyKind::Direct { languages } = &dep.kind {
                for lang in languages {
                    if !self.facts.is_virtual(lang) {
                        return Err(ConcretizeError::UnknownPackage {
                            name: lang.clone(),
                            needed_by: spec.name.clone(),
                        });
                    }
                }
            }
            self.validate(None, &dep.spec)?;
        }
        Ok(())
    }

    fn validate_variants(&self, name: &str, variants: &BTreeMap<String, VariantValue>) -> Result<()> {
        let defs: Vec<_> = match self.facts.package(name) {
            Some(facts) => vec![Arc::clone(&facts.def)],
            None => self
                .facts
                .providers(name)
                .iter()
                .filter_map(|p| self.facts.package(p).map(|f| Arc::clone(&f.def)))
                .collect(),
        };
        if defs.is_empty() {
            return Ok(());
        }
        for (variant, value) in variants {
            let declaring: Vec<_> = defs.iter().filter_map(|d| d.variant(variant)).collect();
            let Some(first) = declaring.first() else {
                return Err(ConcretizeError::UnknownVariant {
                    package: name.to_string(),
                    variant: variant.clone(),
                });
            };
            if let Err(e) = first.domain.validate(value) {
                if declaring.iter().all(|d| d.domain.validate(value).is_err()) {
                    return Err(ConcretizeError::InvalidVariantValue {
                        package: name.to_string(),
                        variant: variant.clone(),
                        value: value.to_string(),
                        allowed: e.allowed,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_policy_document() {
        let policy = Policy::from_yaml_str(
            r#"
packages:
  all:
    require: "%gcc"
    variants: "+shared"
  hdf5:
    require:
      - {any_of: ["+mpi", "+threads"], when: "@1.14:"}
    prefer: ["@1.12", {spec: "+cxx", rank: 0}]
    conflict: [{spec: "%clang", when: "+fortran", message: "no flang"}]
    version: ["1.12", "1.14:"]
    providers: {mpi: [mpich, openmpi]}
  openssl:
    buildable: false
    externals: [{spec: "openssl@3.0.2", prefix: /usr}]
concretizer:
  reuse: dependencies
  roots: constrained
  tie_break: oldest
  targets: [zen3, x86_64]
  budget: {max_steps: 500, timeout_ms: 2000}
"#,
        )
        .unwrap();
        assert_eq!(policy.reuse, ReuseMode::DependenciesOnly);
        assert_eq!(policy.roots, RootScope::Constrained);
        assert_eq!(policy.tie_break, TieBreak::Oldest);
        assert_eq!(policy.target_rank("x86_64"), 1);
        assert_eq!(policy.target_rank("aarch64"), 2);
        assert_eq!(policy.budget.max_steps, 500);
        assert_eq!(policy.budget.timeout, Some(Duration::from_millis(2000)));
        assert_eq!(policy.all().variants["shared"], VariantValue::Bool(true));

        let hdf5 = policy.package("hdf5").unwrap();
        assert_eq!(hdf5.require[0].alternatives.len(), 2);
        assert!(!hdf5.require[0].exclusive);
        assert!(hdf5.require[0].when.is_some());
        assert_eq!(hdf5.prefer[0].rank, 0);
        assert_eq!(hdf5.prefer[1].rank, 0);
        let conflict = &hdf5.conflict[0];
        assert!(conflict.spec.variants.contains_key("fortran"));
        assert_eq!(conflict.spec.direct_dependencies().count(), 1);
        assert_eq!(hdf5.versions.len(), 2);
        assert!(!policy.buildable("openssl"));
        assert!(policy.buildable("zlib"));
        assert_eq!(policy.required_names(), ["gcc"].into_iter().collect());
    }

    #[test]
    fn config_errors_carry_their_path() {
        let err = Policy::from_yaml_str("packages:\n  zlib:\n    require: [\"@1.2\", \"@@\"]\n").unwrap_err();
        assert!(err.to_string().starts_with("packages:zlib:require[1]"), "{err}");

        let err = Policy::from_yaml_str("concretizer: {reuse: sometimes}").unwrap_err();
        assert!(err.to_string().contains("concretizer:reuse"));

        let err = Policy::from_yaml_str(
            "packages:\n  zlib:\n    externals: [{spec: \"zlib@1.2:1.3\"}]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("single version"));
    }

    #[test]
    fn origin_display() {
        let origin = ConstraintOrigin::Conflict {
            package: "foo".into(),
            index: 0,
            spec: "@1.4".into(),
            message: Some("broken".into()),
        };
        assert_eq!(origin.to_string(), "packages:foo:conflict[0] '@1.4' (broken)");
        let request = ConstraintOrigin::Request { spec: "foo@1.4".into() };
        assert_eq!(request.to_string(), "request 'foo@1.4'");
    }
}
