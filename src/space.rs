//! The finite search space of a request.
//!
//! Every package in the closure is expanded into [`Configuration`]s: one per
//! combination of version, values of the variants anything mentions, and
//! target, plus one per compatible reusable record. Hard constraints are
//! applied while expanding, so each configuration carries the exact
//! requirements its dependencies must meet, the nodes it forbids anywhere
//! in the graph, and the reasons (if any) it cannot be chosen.
//!
//! Everything a removable constraint contributes is tagged with its
//! [`ConstraintId`]; a [`ConstraintMask`] switches those contributions on
//! and off without rebuilding the space, which is how infeasibility is
//! narrowed down to a minimal set of constraints.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cost::CostVector;
use crate::facts::FactBase;
use crate::materialize::SpecHash;
use crate::package::PackageDef;
use crate::policy::{CompiledPolicy, ConstraintId, HardConstraint, ReuseMode, Rule, Scope};
use crate::reuse::{Provenance, ReuseIndex, ReuseRecord};
use crate::spec::{DepTypes, DependencyConstraint, DependencyKind, Spec, VariantValue};
use crate::version::Version;

/// Index of a configuration in the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(u32);

impl ConfigId {
    /// Position in [`SearchSpace::configs`].
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Which removable constraints are in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintMask {
    active: Vec<bool>,
}

impl ConstraintMask {
    /// Every constraint active.
    pub fn all(len: usize) -> Self {
        Self {
            active: vec![true; len],
        }
    }

    /// Whether something tagged with `origin` is in force. Untagged
    /// contributions always are.
    pub fn is_active(&self, origin: Option<ConstraintId>) -> bool {
        origin.is_none_or(|id| self.active.get(id.index()).copied().unwrap_or(true))
    }

    /// Switch one constraint on or off.
    pub fn set(&mut self, id: ConstraintId, active: bool) {
        if let Some(slot) = self.active.get_mut(id.index()) {
            *slot = active;
        }
    }

    /// The active constraints.
    pub fn active(&self) -> impl Iterator<Item = ConstraintId> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| ConstraintId(i))
    }
}

/// How a configuration would be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Built from source.
    Build,
    /// An existing node.
    Reuse {
        /// Position in the reuse index.
        record: usize,
        /// Identity of the node.
        hash: SpecHash,
        /// Where it comes from.
        provenance: Provenance,
    },
}

/// Why a configuration cannot be chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// Package metadata or non-removable policy rules it out.
    Always(String),
    /// A removable constraint rules it out.
    Constraint(ConstraintId),
}

/// A predicate a candidate node must (or must not) satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Clause {
    /// Anonymous predicate over the node's own attributes.
    pub spec: Spec,
    /// The node must not match.
    pub negated: bool,
    /// Constraint that contributed the clause.
    pub origin: Option<ConstraintId>,
}

impl Clause {
    /// Clause that rules out every node while its origin is active.
    pub fn disabled(origin: Option<ConstraintId>) -> Self {
        Self {
            spec: Spec::default(),
            negated: true,
            origin,
        }
    }
}

/// Selects the configurations that may fill a dependency slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeMatcher {
    /// Package name.
    pub name: String,
    /// The node must provide this virtual.
    pub provides: Option<String>,
    /// The node must be this exact reused node.
    pub hash: Option<SpecHash>,
    /// Further predicates.
    pub clauses: Vec<Clause>,
}

impl NodeMatcher {
    /// Matcher for any configuration of `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provides: None,
            hash: None,
            clauses: Vec::new(),
        }
    }

    /// Matcher for configurations of `name` that provide `virtual_name`.
    pub fn providing(name: impl Into<String>, virtual_name: impl Into<String>) -> Self {
        Self {
            provides: Some(virtual_name.into()),
            ..Self::named(name)
        }
    }

    fn with_clause(mut self, clause: Clause) -> Self {
        self.add_clause(clause);
        self
    }

    /// Add a clause; positive clauses without constraints are dropped.
    fn add_clause(&mut self, clause: Clause) {
        if clause.negated || !clause.spec.is_unconstrained() {
            self.clauses.push(clause);
        }
    }

    /// Whether `config` fills the slot under `mask`.
    pub fn matches(&self, config: &Configuration, mask: &ConstraintMask) -> bool {
        if config.name != self.name {
            return false;
        }
        if self.provides.as_ref().is_some_and(|v| !config.provides.contains(v)) {
            return false;
        }
        if self.hash.as_ref().is_some_and(|h| config.hash() != Some(h)) {
            return false;
        }
        self.clauses
            .iter()
            .all(|c| !mask.is_active(c.origin) || config.matches_self(&c.spec) != c.negated)
    }
}

impl fmt::Display for NodeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for clause in &self.clauses {
            if clause.negated {
                if clause.spec.is_unconstrained() {
                    f.write_str(" (disabled)")?;
                } else {
                    write!(f, " !({})", clause.spec)?;
                }
            } else {
                write!(f, " {}", clause.spec)?;
            }
        }
        if let Some(hash) = &self.hash {
            write!(f, " /{}", hash.short())?;
        }
        if let Some(v) = &self.provides {
            write!(f, " (as {v})")?;
        }
        Ok(())
    }
}

/// Edge metadata of a dependency requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeInfo {
    /// Edge types.
    pub types: DepTypes,
    /// Virtuals the edge satisfies.
    pub virtuals: BTreeSet<String>,
}

/// One of the alternatives must be present in the graph.
///
/// With edge metadata the chosen node becomes a direct dependency;
/// without, it only has to be reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Candidate matchers.
    pub alternatives: Vec<NodeMatcher>,
    /// Edge metadata for direct dependencies.
    pub edge: Option<EdgeInfo>,
    /// Constraint that contributed the requirement.
    pub origin: Option<ConstraintId>,
}

impl Requirement {
    /// Whether `config` satisfies the requirement under `mask`.
    pub fn matches(&self, config: &Configuration, mask: &ConstraintMask) -> bool {
        self.alternatives.iter().any(|a| a.matches(config, mask))
    }
}

/// No node matching this may appear anywhere in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constrain {
    /// Forbidden nodes.
    pub matcher: NodeMatcher,
    /// Constraint that contributed it.
    pub origin: Option<ConstraintId>,
}

/// A fully determined candidate node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Identifier.
    pub id: ConfigId,
    /// Package name.
    pub name: String,
    /// Version.
    pub version: Version,
    /// Position of the version in preference order.
    pub version_rank: usize,
    /// Every declared variant with its value.
    pub variants: BTreeMap<String, VariantValue>,
    /// Target.
    pub target: String,
    /// Position of the target in preference order.
    pub target_rank: usize,
    /// Built or reused.
    pub source: Source,
    /// Virtuals provided.
    pub provides: BTreeSet<String>,
    /// What the dependencies must satisfy.
    pub requirements: Vec<Requirement>,
    /// What may not appear anywhere in the graph.
    pub constrains: Vec<Constrain>,
    /// Why the configuration may not be chosen.
    pub exclusions: Vec<Exclusion>,
}

impl Configuration {
    fn new(
        def: &PackageDef,
        version: Version,
        version_rank: usize,
        variants: BTreeMap<String, VariantValue>,
        target: String,
        target_rank: usize,
        source: Source,
    ) -> Self {
        let mut config = Self {
            id: ConfigId(0),
            name: def.name.clone(),
            version,
            version_rank,
            variants,
            target,
            target_rank,
            source,
            provides: BTreeSet::new(),
            requirements: Vec::new(),
            constrains: Vec::new(),
            exclusions: Vec::new(),
        };
        config.provides = def
            .provides
            .iter()
            .filter(|p| p.when.as_ref().is_none_or(|w| config.matches_self(w)))
            .map(|p| p.virtual_name.clone())
            .collect();
        config
    }

    /// Whether the node's own attributes satisfy the self part of `spec`.
    /// A virtual name matches when the node provides it.
    pub fn matches_self(&self, spec: &Spec) -> bool {
        let name = match spec.name.as_deref() {
            Some(n) if n != self.name && self.provides.contains(n) => n,
            _ => self.name.as_str(),
        };
        spec.self_matches(name, &self.version, &self.variants, &self.target)
    }

    /// Whether the node is reused.
    pub fn is_reused(&self) -> bool {
        matches!(self.source, Source::Reuse { .. })
    }

    /// Hash of a reused node.
    pub fn hash(&self) -> Option<&SpecHash> {
        match &self.source {
            Source::Reuse { hash, .. } => Some(hash),
            Source::Build => None,
        }
    }

    /// Provenance of a reused node.
    pub fn provenance(&self) -> Option<Provenance> {
        match &self.source {
            Source::Reuse { provenance, .. } => Some(*provenance),
            Source::Build => None,
        }
    }

    /// Whether no active exclusion applies.
    pub fn is_usable(&self, mask: &ConstraintMask) -> bool {
        self.exclusions.iter().all(|e| match e {
            Exclusion::Always(_) => false,
            Exclusion::Constraint(id) => !mask.is_active(Some(*id)),
        })
    }

    /// Requirements in force under `mask`.
    pub fn active_requirements<'a>(
        &'a self,
        mask: &'a ConstraintMask,
    ) -> impl Iterator<Item = &'a Requirement> + 'a {
        self.requirements.iter().filter(|r| mask.is_active(r.origin))
    }

    /// Constrains in force under `mask`.
    pub fn active_constrains<'a>(
        &'a self,
        mask: &'a ConstraintMask,
    ) -> impl Iterator<Item = &'a Constrain> + 'a {
        self.constrains.iter().filter(|c| mask.is_active(c.origin))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        for (name, value) in &self.variants {
            match value {
                VariantValue::Bool(true) => write!(f, "+{name}")?,
                VariantValue::Bool(false) => write!(f, "~{name}")?,
                other => write!(f, " {name}={other}")?,
            }
        }
        write!(f, " target={}", self.target)?;
        if let Some(hash) = self.hash() {
            write!(f, " /{}", hash.short())?;
        }
        Ok(())
    }
}

/// A package that must be present in every solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopRequirement {
    /// The requirement; never carries edge metadata.
    pub requirement: Requirement,
    /// Whether the chosen node is a root of the graph.
    pub root: bool,
}

/// Every configuration of every reachable package, with hard constraints
/// applied.
pub struct SearchSpace {
    facts: FactBase,
    compiled: CompiledPolicy,
    reuse: ReuseIndex,
    configs: Vec<Configuration>,
    by_name: BTreeMap<String, Vec<ConfigId>>,
    top: Vec<TopRequirement>,
    /// Packages with at least one reusable node in scope.
    reusable: BTreeSet<String>,
    node_costs: Vec<CostVector>,
    preference: Vec<usize>,
}

impl fmt::Debug for SearchSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchSpace")
            .field("configs", &self.configs.len())
            .field("packages", &self.by_name.len())
            .field("top", &self.top)
            .finish_non_exhaustive()
    }
}

impl SearchSpace {
    /// Expand every reachable package. Packages are enumerated in parallel
    /// and numbered in name order, so the result is deterministic.
    pub fn build(facts: FactBase, compiled: CompiledPolicy, reuse: ReuseIndex) -> Self {
        let builder = SpaceBuilder {
            facts: &facts,
            compiled: &compiled,
            reuse: &reuse,
        };
        let names: Vec<&str> = facts.packages().map(|(n, _)| n).collect();
        let expanded: Vec<Vec<Configuration>> =
            names.par_iter().map(|name| builder.enumerate(name)).collect();

        let mut configs = Vec::new();
        let mut by_name: BTreeMap<String, Vec<ConfigId>> = BTreeMap::new();
        for (name, list) in names.iter().zip(expanded) {
            let ids = by_name.entry(name.to_string()).or_default();
            for mut config in list {
                config.id = ConfigId::from_index(configs.len());
                ids.push(config.id);
                configs.push(config);
            }
        }

        let top = compiled
            .presence
            .iter()
            .map(|p| TopRequirement {
                requirement: Requirement {
                    alternatives: builder.targets(&p.name),
                    edge: None,
                    origin: p.origin,
                },
                root: p.root,
            })
            .collect();

        let reusable: BTreeSet<String> = configs
            .iter()
            .filter(|c| c.is_reused() && !c.exclusions.iter().any(|e| matches!(e, Exclusion::Always(_))))
            .map(|c| c.name.clone())
            .collect();

        debug!(
            packages = by_name.len(),
            configurations = configs.len(),
            reusable = reusable.len(),
            constraints = compiled.constraints.len(),
            "search space built"
        );
        let mut space = Self {
            facts,
            compiled,
            reuse,
            configs,
            by_name,
            top,
            reusable,
            node_costs: Vec::new(),
            preference: Vec::new(),
        };
        space.rank_configurations();
        space
    }

    /// Cache every node's cost vector and its position among the
    /// configurations of its package, cheapest first.
    fn rank_configurations(&mut self) {
        let costs: Vec<CostVector> = self
            .configs
            .par_iter()
            .map(|c| self.compiled.costs.node_vector(self, c))
            .collect();
        let mut preference = vec![0; self.configs.len()];
        for ids in self.by_name.values() {
            let mut sorted = ids.clone();
            sorted.sort_by(|a, b| costs[a.index()].cmp(&costs[b.index()]).then(a.cmp(b)));
            for (rank, id) in sorted.into_iter().enumerate() {
                preference[id.index()] = rank;
            }
        }
        self.node_costs = costs;
        self.preference = preference;
    }

    /// Lower bound one node contributes to any graph containing it.
    pub fn node_cost(&self, id: ConfigId) -> &CostVector {
        &self.node_costs[id.index()]
    }

    /// Position of a configuration among those of its package, cheapest
    /// first.
    pub fn preference_rank(&self, id: ConfigId) -> usize {
        self.preference[id.index()]
    }

    /// Every configuration, indexed by [`ConfigId`].
    pub fn configs(&self) -> &[Configuration] {
        &self.configs
    }

    /// One configuration.
    pub fn config(&self, id: ConfigId) -> &Configuration {
        &self.configs[id.index()]
    }

    #[cfg(test)]
    pub(crate) fn config_mut(&mut self, id: ConfigId) -> &mut Configuration {
        &mut self.configs[id.index()]
    }

    /// Configurations of a package, in enumeration order.
    pub fn configs_of(&self, name: &str) -> &[ConfigId] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Package names with configurations.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Configurations matching `matcher` that are usable under `mask`.
    pub fn matching<'a>(
        &'a self,
        matcher: &'a NodeMatcher,
        mask: &'a ConstraintMask,
    ) -> impl Iterator<Item = ConfigId> + 'a {
        self.configs_of(&matcher.name)
            .iter()
            .copied()
            .filter(move |&id| {
                let config = self.config(id);
                config.is_usable(mask) && matcher.matches(config, mask)
            })
    }

    /// Packages every solution must contain.
    pub fn top(&self) -> &[TopRequirement] {
        &self.top
    }

    /// Whether `name` has a reusable node that the reuse mode lets the
    /// solver pick.
    pub fn has_reuse_candidate(&self, name: &str) -> bool {
        self.reusable.contains(name)
    }

    /// Facts the space was built from.
    pub fn facts(&self) -> &FactBase {
        &self.facts
    }

    /// The compiled policy.
    pub fn compiled(&self) -> &CompiledPolicy {
        &self.compiled
    }

    /// One hard constraint.
    pub fn constraint(&self, id: ConstraintId) -> &HardConstraint {
        &self.compiled.constraints[id.index()]
    }

    /// Mask with every constraint active.
    pub fn full_mask(&self) -> ConstraintMask {
        ConstraintMask::all(self.compiled.constraints.len())
    }

    /// The reuse snapshot.
    pub fn reuse(&self) -> &ReuseIndex {
        &self.reuse
    }

    /// Record behind a reused configuration.
    pub fn record(&self, id: ConfigId) -> Option<&ReuseRecord> {
        match &self.config(id).source {
            Source::Reuse { record, .. } => self.reuse.get(*record),
            Source::Build => None,
        }
    }

    /// First active reason the configuration cannot be chosen.
    pub fn exclusion_reason(&self, id: ConfigId, mask: &ConstraintMask) -> Option<String> {
        self.config(id).exclusions.iter().find_map(|e| match e {
            Exclusion::Always(reason) => Some(reason.clone()),
            Exclusion::Constraint(c) if mask.is_active(Some(*c)) => {
                Some(format!("ruled out by {}", self.constraint(*c).origin))
            }
            Exclusion::Constraint(_) => None,
        })
    }
}

/// Context of one rule application.
struct RuleCtx<'r> {
    when: Option<&'r Spec>,
    origin: Option<ConstraintId>,
    all_scope: bool,
    reason: String,
}

impl RuleCtx<'_> {
    fn exclude(&self, config: &mut Configuration) {
        let exclusion = match self.origin {
            Some(id) => Exclusion::Constraint(id),
            None => Exclusion::Always(self.reason.clone()),
        };
        if !config.exclusions.contains(&exclusion) {
            config.exclusions.push(exclusion);
        }
    }
}

fn anonymous(spec: &Spec) -> Spec {
    Spec {
        name: None,
        dependencies: Vec::new(),
        ..spec.clone()
    }
}

struct SpaceBuilder<'a> {
    facts: &'a FactBase,
    compiled: &'a CompiledPolicy,
    reuse: &'a ReuseIndex,
}

impl SpaceBuilder<'_> {
    /// Matchers for every concrete package behind `name`.
    fn targets(&self, name: &str) -> Vec<NodeMatcher> {
        if self.facts.package(name).is_some() {
            vec![NodeMatcher::named(name)]
        } else {
            self.facts
                .providers(name)
                .iter()
                .map(|p| NodeMatcher::providing(p.as_str(), name))
                .collect()
        }
    }

    fn is_virtual(&self, name: &str) -> bool {
        self.facts.package(name).is_none() && self.facts.is_virtual(name)
    }

    fn enumerate(&self, name: &str) -> Vec<Configuration> {
        let Some(facts) = self.facts.package(name) else {
            return Vec::new();
        };
        let def = facts.def.as_ref();
        let policy = &self.compiled.policy;

        let axes: Vec<(&String, Vec<VariantValue>)> = def
            .variants
            .iter()
            .map(|(variant, decl)| {
                let values = if self.facts.is_referenced(variant) {
                    decl.domain
                        .candidates(&decl.default, &self.facts.mentioned_values(variant))
                } else {
                    vec![decl.default.clone()]
                };
                (variant, values)
            })
            .collect();
        let mut combos = vec![BTreeMap::new()];
        for (variant, values) in &axes {
            combos = combos
                .into_iter()
                .flat_map(|partial: BTreeMap<String, VariantValue>| {
                    values.iter().map(move |v| {
                        let mut next = partial.clone();
                        next.insert((*variant).clone(), v.clone());
                        next
                    })
                })
                .collect();
        }

        let mut out = Vec::new();
        for (rank, decl) in facts.versions.iter().enumerate() {
            for variants in &combos {
                for (target_rank, target) in policy.targets.iter().enumerate() {
                    let mut config = Configuration::new(
                        def,
                        decl.version.clone(),
                        rank,
                        variants.clone(),
                        target.clone(),
                        target_rank,
                        Source::Build,
                    );
                    if decl.deprecated && !policy.allow_deprecated {
                        config
                            .exclusions
                            .push(Exclusion::Always(format!("{name}@{} is deprecated", decl.version)));
                    }
                    if !policy.buildable(name) {
                        config
                            .exclusions
                            .push(Exclusion::Always(format!("{name} may not be built from source")));
                    }
                    self.declare_dependencies(def, &mut config);
                    out.extend(self.apply_rules(def, config));
                }
            }
        }

        for record in self.reuse.compatible(&Spec::named(name)) {
            let Some(position) = self.reuse.position(&record.hash) else {
                continue;
            };
            if self.compiled.reuse == ReuseMode::None && record.provenance != Provenance::External {
                continue;
            }
            if !fits_domain(def, record) {
                warn!(package = name, hash = %record.hash, "skipping reusable node outside the variant domain");
                continue;
            }
            if !self.reuse.is_complete(record) {
                warn!(package = name, hash = %record.hash, "skipping reusable node with missing dependencies");
                continue;
            }
            let mut config = Configuration::new(
                def,
                record.version.clone(),
                facts.rank(&record.version),
                record.variants.clone(),
                record.target.clone(),
                policy.target_rank(&record.target),
                Source::Reuse {
                    record: position,
                    hash: record.hash.clone(),
                    provenance: record.provenance,
                },
            );
            if self.compiled.reuse == ReuseMode::DependenciesOnly
                && self.compiled.roots.contains(name)
                && record.provenance != Provenance::External
            {
                config.exclusions.push(Exclusion::Always(format!(
                    "{name} is a root and roots are built from source"
                )));
            }
            for edge in &record.dependencies {
                config.requirements.push(Requirement {
                    alternatives: vec![NodeMatcher {
                        hash: Some(edge.hash.clone()),
                        ..NodeMatcher::named(edge.name.as_str())
                    }],
                    edge: Some(EdgeInfo {
                        types: edge.types.clone(),
                        virtuals: edge.virtuals.clone(),
                    }),
                    origin: None,
                });
            }
            out.extend(self.apply_rules(def, config));
        }
        out
    }

    /// Turn the active dependency declarations into requirements; several
    /// declarations of the same name are merged into one edge.
    fn declare_dependencies(&self, def: &PackageDef, config: &mut Configuration) {
        let mut merged: BTreeMap<&str, (Vec<Spec>, DepTypes)> = BTreeMap::new();
        for decl in &def.dependencies {
            if decl.when.as_ref().is_some_and(|w| !config.matches_self(w)) {
                continue;
            }
            let entry = merged.entry(decl.name()).or_default();
            entry.0.push(anonymous(&decl.spec));
            entry.1.merge(&decl.types);
        }
        for (dep, (specs, types)) in merged {
            let mut alternatives: Vec<NodeMatcher> = self
                .targets(dep)
                .into_iter()
                .filter(|m| m.name != config.name)
                .collect();
            for alternative in &mut alternatives {
                for spec in &specs {
                    alternative.add_clause(Clause {
                        spec: spec.clone(),
                        negated: false,
                        origin: None,
                    });
                }
            }
            if alternatives.is_empty() {
                config
                    .exclusions
                    .push(Exclusion::Always(format!("nothing can satisfy dependency '{dep}'")));
                continue;
            }
            let virtuals = if self.is_virtual(dep) {
                BTreeSet::from([dep.to_string()])
            } else {
                BTreeSet::new()
            };
            config.requirements.push(Requirement {
                alternatives,
                edge: Some(EdgeInfo { types, virtuals }),
                origin: None,
            });
        }
    }

    /// Apply metadata rules, then policy requirements, then policy
    /// conflicts. A rule may split one configuration into several.
    fn apply_rules(&self, def: &PackageDef, config: Configuration) -> Vec<Configuration> {
        let mut configs = vec![config];
        for require in &def.requires {
            let ctx = RuleCtx {
                when: require.when.as_ref(),
                origin: None,
                all_scope: false,
                reason: require
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} requires '{}'", def.name, require.spec)),
            };
            let alternatives = std::slice::from_ref(&require.spec);
            configs = configs
                .into_iter()
                .flat_map(|c| self.apply_require(def, c, alternatives, false, &ctx))
                .collect();
        }
        for conflict in &def.conflicts {
            let ctx = RuleCtx {
                when: None,
                origin: None,
                all_scope: false,
                reason: conflict
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} conflicts with '{}'", def.name, conflict.spec)),
            };
            for config in &mut configs {
                self.apply_conflict(def, config, &conflict.spec, &ctx);
            }
        }

        let constraints = &self.compiled.constraints;
        let requires = constraints.iter().filter(|c| matches!(c.rule, Rule::Require { .. }));
        let conflicts = constraints.iter().filter(|c| matches!(c.rule, Rule::Conflict(_)));
        for constraint in requires.chain(conflicts) {
            let ctx = RuleCtx {
                when: constraint.when.as_ref(),
                origin: Some(constraint.id),
                all_scope: constraint.scope == Scope::All,
                reason: constraint.origin.to_string(),
            };
            configs = configs
                .into_iter()
                .flat_map(|mut c| {
                    if !in_scope(&constraint.scope, &c) {
                        return vec![c];
                    }
                    match &constraint.rule {
                        Rule::Require {
                            alternatives,
                            exclusive,
                        } => self.apply_require(def, c, alternatives, *exclusive, &ctx),
                        Rule::Conflict(spec) => {
                            self.apply_conflict(def, &mut c, spec, &ctx);
                            vec![c]
                        }
                    }
                })
                .collect();
        }
        configs
    }

    fn vacuous_for(&self, def: &PackageDef, ctx: &RuleCtx<'_>, specs: &[Spec]) -> bool {
        ctx.all_scope
            && !(ctx.when.is_none_or(|w| def.declares_variants_of(w))
                && specs.iter().all(|s| def.declares_variants_of(s)))
    }

    fn apply_require(
        &self,
        def: &PackageDef,
        config: Configuration,
        alternatives: &[Spec],
        exclusive: bool,
        ctx: &RuleCtx<'_>,
    ) -> Vec<Configuration> {
        if self.vacuous_for(def, ctx, alternatives) {
            return vec![config];
        }
        if ctx.when.is_some_and(|w| !config.matches_self(w)) {
            return vec![config];
        }
        let self_ok: Vec<bool> = alternatives
            .iter()
            .map(|a| config.matches_self(&a.self_part()))
            .collect();
        let valid: Vec<&Spec> = alternatives
            .iter()
            .enumerate()
            .filter(|&(i, _)| self_ok[i])
            .filter(|&(i, _)| {
                !exclusive
                    || !alternatives
                        .iter()
                        .enumerate()
                        .any(|(j, b)| j != i && self_ok[j] && !b.has_dependency_constraints())
            })
            .map(|(_, a)| a)
            .collect();

        let mut config = config;
        if valid.is_empty() {
            ctx.exclude(&mut config);
            return vec![config];
        }
        let mut out: Vec<Configuration> = Vec::with_capacity(valid.len());
        for alternative in valid {
            let mut split = config.clone();
            for dep in &alternative.dependencies {
                self.impose(&mut split, dep, ctx);
            }
            if !out.contains(&split) {
                out.push(split);
            }
        }
        out
    }

    /// Make `config` satisfy one dependency part of a requirement.
    fn impose(&self, config: &mut Configuration, dep: &DependencyConstraint, ctx: &RuleCtx<'_>) {
        let clause = Clause {
            spec: anonymous(&dep.spec),
            negated: false,
            origin: ctx.origin,
        };
        let languages = match &dep.kind {
            DependencyKind::Transitive => {
                let alternatives: Vec<NodeMatcher> = self
                    .targets(dep.name())
                    .into_iter()
                    .map(|m| m.with_clause(clause.clone()))
                    .collect();
                if alternatives.is_empty() {
                    ctx.exclude(config);
                } else {
                    config.requirements.push(Requirement {
                        alternatives,
                        edge: None,
                        origin: ctx.origin,
                    });
                }
                return;
            }
            DependencyKind::Direct { languages } => languages,
        };

        let targets = self.targets(dep.name());
        let names: BTreeSet<&str> = targets.iter().map(|m| m.name.as_str()).collect();
        let mut found = false;
        for requirement in self.edges_to(config, dep.name(), languages, &names) {
            let requirement = &mut config.requirements[requirement];
            found = true;
            for alternative in &mut requirement.alternatives {
                if names.contains(alternative.name.as_str()) {
                    alternative.add_clause(clause.clone());
                } else {
                    alternative.clauses.push(Clause::disabled(ctx.origin));
                }
            }
        }
        if found || ctx.all_scope {
            return;
        }
        if config.is_reused() {
            ctx.exclude(config);
            return;
        }

        let own = config.name.clone();
        let forced: Vec<(BTreeSet<String>, Vec<NodeMatcher>)> = if languages.is_empty() {
            let virtuals = if self.is_virtual(dep.name()) {
                BTreeSet::from([dep.name().to_string()])
            } else {
                BTreeSet::new()
            };
            vec![(virtuals, targets)]
        } else {
            languages
                .iter()
                .map(|lang| {
                    let matchers = targets
                        .iter()
                        .map(|m| NodeMatcher::providing(m.name.as_str(), lang.as_str()))
                        .collect();
                    (BTreeSet::from([lang.clone()]), matchers)
                })
                .collect()
        };
        for (virtuals, matchers) in forced {
            let alternatives: Vec<NodeMatcher> = matchers
                .into_iter()
                .filter(|m| m.name != own)
                .map(|m| m.with_clause(clause.clone()))
                .collect();
            if alternatives.is_empty() {
                ctx.exclude(config);
                continue;
            }
            config.requirements.push(Requirement {
                alternatives,
                edge: Some(EdgeInfo {
                    types: DepTypes::build_link(),
                    virtuals,
                }),
                origin: ctx.origin,
            });
        }
    }

    /// Requirements of `config` whose edge may lead to `dep`.
    fn edges_to(
        &self,
        config: &Configuration,
        dep: &str,
        languages: &[String],
        names: &BTreeSet<&str>,
    ) -> Vec<usize> {
        let dep_is_virtual = self.is_virtual(dep);
        config
            .requirements
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                let Some(edge) = &r.edge else {
                    return false;
                };
                if !languages.is_empty() && !languages.iter().any(|l| edge.virtuals.contains(l)) {
                    return false;
                }
                if dep_is_virtual && !edge.virtuals.contains(dep) {
                    return false;
                }
                r.alternatives.iter().any(|a| names.contains(a.name.as_str()))
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn apply_conflict(
        &self,
        def: &PackageDef,
        config: &mut Configuration,
        spec: &Spec,
        ctx: &RuleCtx<'_>,
    ) {
        if self.vacuous_for(def, ctx, std::slice::from_ref(spec)) {
            return;
        }
        if !config.matches_self(&spec.self_part()) {
            return;
        }
        let Some(dep) = spec.dependencies.first() else {
            ctx.exclude(config);
            return;
        };
        let clause = Clause {
            spec: anonymous(&dep.spec),
            negated: true,
            origin: ctx.origin,
        };
        match &dep.kind {
            DependencyKind::Direct { languages } => {
                let targets = self.targets(dep.name());
                let names: BTreeSet<&str> = targets.iter().map(|m| m.name.as_str()).collect();
                for requirement in self.edges_to(config, dep.name(), languages, &names) {
                    for alternative in &mut config.requirements[requirement].alternatives {
                        if names.contains(alternative.name.as_str()) {
                            alternative.clauses.push(clause.clone());
                        }
                    }
                }
            }
            DependencyKind::Transitive => {
                for target in self.targets(dep.name()) {
                    config.constrains.push(Constrain {
                        matcher: target.with_clause(Clause {
                            negated: false,
                            ..clause.clone()
                        }),
                        origin: ctx.origin,
                    });
                }
            }
        }
    }
}

fn in_scope(scope: &Scope, config: &Configuration) -> bool {
    match scope {
        Scope::All => true,
        Scope::Package(name) => &config.name == name,
        Scope::Virtual(name) => config.provides.contains(name),
    }
}

/// Whether a record assigns every declared variant a valid value and
/// nothing else.
fn fits_domain(def: &PackageDef, record: &ReuseRecord) -> bool {
    record.variants.len() == def.variants.len()
        && record.variants.iter().all(|(name, value)| {
            def.variant(name)
                .is_some_and(|decl| decl.domain.validate(value).is_ok())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, PolicyCompiler};
    use crate::repository::{InMemoryRepository, RepoSnapshot};
    use std::sync::Arc;

    fn space(repo: &str, policy: &str, request: &str) -> SearchSpace {
        let snapshot = RepoSnapshot::new(InMemoryRepository::from_yaml_str(repo).unwrap());
        let policy = Arc::new(Policy::from_yaml_str(policy).unwrap());
        let request = crate::parse::parse_specs(request).unwrap();
        let reuse = ReuseIndex::default();
        let facts = FactBase::collect(&snapshot, &policy, &request, &reuse).unwrap();
        let compiled = PolicyCompiler::new(&policy, &facts)
            .compile(&request, policy.reuse)
            .unwrap();
        SearchSpace::build(facts, compiled, reuse)
    }

    const REPO: &str = r#"
packages:
  app:
    versions: ["2.0", "1.0"]
    variants: {x: {default: false}, docs: {default: false}}
    depends_on: [c, {spec: "zlib@1.2:", when: "+x"}]
  zlib:
    versions: ["1.3", "1.2", "1.1"]
  gcc:
    versions: ["13"]
    provides: [c]
  clang:
    versions: ["17"]
    provides: [c]
"#;

    #[test]
    fn only_referenced_variants_vary() {
        let space = space(REPO, "{}", "app");
        let apps = space.configs_of("app");
        // 2 versions x (x on/off) x docs pinned to its default
        assert_eq!(apps.len(), 4);
        assert!(apps.iter().all(|&id| space.config(id).variants["docs"] == VariantValue::Bool(false)));
    }

    #[test]
    fn conditional_dependencies_follow_variants() {
        let space = space(REPO, "{}", "app");
        let mask = space.full_mask();
        for &id in space.configs_of("app") {
            let config = space.config(id);
            let deps: Vec<&str> = config
                .active_requirements(&mask)
                .flat_map(|r| r.alternatives.iter().map(|a| a.name.as_str()))
                .collect();
            if config.variants["x"] == VariantValue::Bool(true) {
                assert_eq!(deps, ["clang", "gcc", "zlib"]);
            } else {
                assert_eq!(deps, ["clang", "gcc"]);
            }
        }
        let old_zlib = space
            .configs_of("zlib")
            .iter()
            .find(|&&id| space.config(id).version.as_str() == "1.1")
            .copied()
            .unwrap();
        let app_x = space
            .configs_of("app")
            .iter()
            .map(|&id| space.config(id))
            .find(|c| c.variants["x"] == VariantValue::Bool(true))
            .unwrap();
        assert!(!app_x.requirements[1].matches(space.config(old_zlib), &mask));
    }

    #[test]
    fn request_constraints_are_masked_not_baked_in() {
        let space = space(REPO, "{}", "app@1.0 %clang");
        let mut mask = space.full_mask();
        let usable = |mask: &ConstraintMask| {
            space
                .configs_of("app")
                .iter()
                .filter(|&&id| space.config(id).is_usable(mask))
                .count()
        };
        assert_eq!(usable(&mask), 2);
        let gcc = space.configs_of("gcc")[0];
        let app = space
            .configs_of("app")
            .iter()
            .copied()
            .find(|&id| space.config(id).is_usable(&mask))
            .unwrap();
        let compiler = &space.config(app).requirements[0];
        assert!(!compiler.matches(space.config(gcc), &mask));

        mask.set(ConstraintId(0), false);
        assert_eq!(usable(&mask), 4);
        assert!(compiler.matches(space.config(gcc), &mask));
    }

    #[test]
    fn require_groups_split_configurations() {
        let space = space(
            REPO,
            "packages:\n  app:\n    require: [{one_of: [\"%gcc\", \"%clang\"]}]\n",
            "app@2.0~x",
        );
        let mask = space.full_mask();
        let usable: Vec<&Configuration> = space
            .configs_of("app")
            .iter()
            .map(|&id| space.config(id))
            .filter(|c| c.is_usable(&mask))
            .collect();
        assert_eq!(usable.len(), 2);
        assert_ne!(usable[0].requirements, usable[1].requirements);
    }

    #[test]
    fn conflicts_exclude_or_constrain() {
        let space = space(
            REPO,
            "packages:\n  app:\n    conflict: [\"@1.0\", \"^zlib@1.3\"]\n",
            "app",
        );
        let mask = space.full_mask();
        for &id in space.configs_of("app") {
            let config = space.config(id);
            assert_eq!(config.is_usable(&mask), config.version.as_str() == "2.0");
            assert_eq!(config.constrains.len(), 1);
        }
        let reason = space.exclusion_reason(space.configs_of("app")[3], &mask).unwrap();
        assert!(reason.contains("packages:app:conflict[0]"), "{reason}");
    }

    #[test]
    fn deprecated_and_unbuildable_are_excluded() {
        let repo = "packages:\n  zlib:\n    versions: [\"1.3\", {version: \"1.2\", deprecated: true}]\n";
        let space = space(repo, "packages:\n  zlib:\n    buildable: false\n", "zlib");
        let mask = space.full_mask();
        assert!(space.configs_of("zlib").iter().all(|&id| !space.config(id).is_usable(&mask)));
        let reasons: Vec<String> = space
            .configs_of("zlib")
            .iter()
            .filter_map(|&id| space.exclusion_reason(id, &mask))
            .collect();
        assert!(reasons[0].contains("may not be built"));
        assert!(reasons[1].contains("deprecated"));
    }
}
