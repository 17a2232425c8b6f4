//! Tiered, lexicographic optimization criteria.
//!
//! Every criterion is a [`CostFunction`] belonging to a [`Tier`]. A graph's
//! cost is the vector of all criteria ordered by tier and then by position
//! in the [`CostModel`]; graphs are compared lexicographically, so any
//! improvement in a higher tier beats every loss in lower ones.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Add;

use crate::package::VariantDomain;
use crate::policy::{PackagePolicy, PreferRule};
use crate::solver::Assignment;
use crate::space::{Configuration, SearchSpace};

/// Priority class of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Ranked `prefer` entries.
    StrongPreference,
    /// Reuse of existing nodes over fresh builds.
    Reuse,
    /// Configured version, variant and provider preferences.
    Preference,
    /// Package defaults and orderings.
    Default,
}

/// Lexicographically ordered cost of a graph or node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CostVector(pub Vec<u64>);

impl CostVector {
    /// All-zero vector of length `len`.
    pub fn zero(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// Components.
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

impl Ord for CostVector {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for CostVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for &CostVector {
    type Output = CostVector;

    fn add(self, other: &CostVector) -> CostVector {
        let len = self.0.len().max(other.0.len());
        CostVector(
            (0..len)
                .map(|i| {
                    let a = self.0.get(i).copied().unwrap_or(0);
                    let b = other.0.get(i).copied().unwrap_or(0);
                    a.saturating_add(b)
                })
                .collect(),
        )
    }
}

impl fmt::Display for CostVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// One optimization criterion.
pub trait CostFunction: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Priority class.
    fn tier(&self) -> Tier;

    /// Cost attributable to one node, looking only at the node itself.
    /// Must never exceed the node's share of [`CostFunction::graph_cost`].
    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64;

    /// Exact cost of a complete graph.
    fn graph_cost(&self, space: &SearchSpace, assignment: &Assignment) -> u64 {
        assignment
            .nodes()
            .map(|id| self.node_cost(space, space.config(id)))
            .sum()
    }

    /// Cost of a partial graph beyond the sum of its node costs that no
    /// extension can take back.
    fn partial_extra(&self, _space: &SearchSpace, _assignment: &Assignment) -> u64 {
        0
    }
}

/// The ordered list of criteria.
pub struct CostModel {
    functions: Vec<Box<dyn CostFunction>>,
}

impl fmt::Debug for CostModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl CostModel {
    /// Criteria from explicit functions, sorted by tier (stable).
    pub fn new(mut functions: Vec<Box<dyn CostFunction>>) -> Self {
        functions.sort_by_key(|f| f.tier());
        Self { functions }
    }

    /// The standard criteria.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(StrongPreferences),
            Box::new(FreshBuilds),
            Box::new(ReuseProvenance),
            Box::new(VersionPreferences),
            Box::new(VariantPreferences),
            Box::new(ProviderPreferences),
            Box::new(ProviderUnification),
            Box::new(VariantDefaults),
            Box::new(VersionOrder),
            Box::new(TargetOrder),
        ])
    }

    /// Number of criteria.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether there are no criteria.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Criterion names in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.iter().map(|f| f.name())
    }

    /// Lower bound contributed by one node.
    pub fn node_vector(&self, space: &SearchSpace, config: &Configuration) -> CostVector {
        CostVector(self.functions.iter().map(|f| f.node_cost(space, config)).collect())
    }

    /// Exact cost of a complete graph.
    pub fn graph_vector(&self, space: &SearchSpace, assignment: &Assignment) -> CostVector {
        CostVector(
            self.functions
                .iter()
                .map(|f| f.graph_cost(space, assignment))
                .collect(),
        )
    }

    /// Irrevocable non-node cost of a partial graph.
    pub fn extra_vector(&self, space: &SearchSpace, assignment: &Assignment) -> CostVector {
        CostVector(
            self.functions
                .iter()
                .map(|f| f.partial_extra(space, assignment))
                .collect(),
        )
    }
}

/// Policy scopes that apply to a node: `all`, the package, and every
/// virtual it provides.
fn scopes<'a>(space: &'a SearchSpace, config: &Configuration) -> Vec<(bool, &'a PackagePolicy)> {
    let policy = &space.compiled().policy;
    let mut out = vec![(true, policy.all())];
    out.extend(policy.package(&config.name).map(|p| (false, p)));
    for v in &config.provides {
        out.extend(policy.package(v).map(|p| (false, p)));
    }
    out
}

fn declares(space: &SearchSpace, config: &Configuration, rule: &PreferRule) -> bool {
    space
        .facts()
        .package(&config.name)
        .is_some_and(|f| {
            f.def.declares_variants_of(&rule.spec)
                && rule.when.as_ref().is_none_or(|w| f.def.declares_variants_of(w))
        })
}

/// Ranked `prefer` entries: per applicable list, the rank of the best
/// satisfied entry, or one past the worst rank when none is.
pub struct StrongPreferences;

impl StrongPreferences {
    fn cost(
        space: &SearchSpace,
        config: &Configuration,
        holds: impl Fn(&crate::spec::Spec) -> bool,
    ) -> u64 {
        let mut total = 0;
        for (is_all, scope) in scopes(space, config) {
            let rules: Vec<&PreferRule> = scope
                .prefer
                .iter()
                .filter(|r| !is_all || declares(space, config, r))
                .filter(|r| r.when.as_ref().is_none_or(|w| config.matches_self(w)))
                .collect();
            let Some(worst) = rules.iter().map(|r| r.rank).max() else {
                continue;
            };
            let best = rules
                .iter()
                .filter(|r| holds(&r.spec))
                .map(|r| r.rank)
                .min()
                .unwrap_or(worst.saturating_add(1));
            total += u64::from(best);
        }
        total
    }
}

impl CostFunction for StrongPreferences {
    fn name(&self) -> &'static str {
        "strong-preferences"
    }

    fn tier(&self) -> Tier {
        Tier::StrongPreference
    }

    /// Dependency parts are assumed to hold.
    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64 {
        Self::cost(space, config, |spec| config.matches_self(&spec.self_part()))
    }

    fn graph_cost(&self, space: &SearchSpace, assignment: &Assignment) -> u64 {
        assignment
            .nodes()
            .map(|id| {
                let config = space.config(id);
                Self::cost(space, config, |spec| assignment.satisfies(space, id, spec))
            })
            .sum()
    }
}

/// Number of nodes built from source although a reusable node of the same
/// package is in scope. Packages without such a node cost nothing, so the
/// criterion never favors smaller graphs for their own sake.
pub struct FreshBuilds;

impl CostFunction for FreshBuilds {
    fn name(&self) -> &'static str {
        "fresh-builds"
    }

    fn tier(&self) -> Tier {
        Tier::Reuse
    }

    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64 {
        u64::from(!config.is_reused() && space.has_reuse_candidate(&config.name))
    }
}

/// Externals before installed nodes before build caches.
pub struct ReuseProvenance;

impl CostFunction for ReuseProvenance {
    fn name(&self) -> &'static str {
        "reuse-provenance"
    }

    fn tier(&self) -> Tier {
        Tier::Reuse
    }

    fn node_cost(&self, _space: &SearchSpace, config: &Configuration) -> u64 {
        config.provenance().map_or(0, |p| p.rank())
    }
}

/// Position of the first matching entry of the version preference list;
/// the package list replaces the `all` list.
pub struct VersionPreferences;

impl CostFunction for VersionPreferences {
    fn name(&self) -> &'static str {
        "version-preferences"
    }

    fn tier(&self) -> Tier {
        Tier::Preference
    }

    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64 {
        let policy = &space.compiled().policy;
        let list = policy
            .package(&config.name)
            .map(|p| &p.versions)
            .filter(|v| !v.is_empty())
            .unwrap_or(&policy.all().versions);
        list.iter()
            .position(|c| c.matches(&config.version))
            .unwrap_or(list.len()) as u64
    }
}

/// Number of preferred variant values the node does not have.
pub struct VariantPreferences;

impl CostFunction for VariantPreferences {
    fn name(&self) -> &'static str {
        "variant-preferences"
    }

    fn tier(&self) -> Tier {
        Tier::Preference
    }

    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64 {
        let policy = &space.compiled().policy;
        let mut wanted = policy.all().variants.clone();
        if let Some(package) = policy.package(&config.name) {
            wanted.extend(package.variants.clone());
        }
        wanted
            .iter()
            .filter_map(|(name, value)| config.variants.get(name).map(|have| (value, have)))
            .filter(|(value, have)| !value.satisfied_by(have))
            .count() as u64
    }
}

/// For every virtual edge, the provider's position in the preference list
/// of the depending package (or of `all`).
pub struct ProviderPreferences;

impl CostFunction for ProviderPreferences {
    fn name(&self) -> &'static str {
        "provider-preferences"
    }

    fn tier(&self) -> Tier {
        Tier::Preference
    }

    fn node_cost(&self, _space: &SearchSpace, _config: &Configuration) -> u64 {
        0
    }

    fn graph_cost(&self, space: &SearchSpace, assignment: &Assignment) -> u64 {
        let policy = &space.compiled().policy;
        let mut total = 0;
        for ((from, to), edge) in assignment.edges() {
            let parent = space.config(*from);
            let provider = &space.config(*to).name;
            for v in &edge.virtuals {
                let list = policy
                    .package(&parent.name)
                    .and_then(|p| p.providers.get(v))
                    .or_else(|| policy.all().providers.get(v));
                if let Some(list) = list {
                    total += list.iter().position(|p| p == provider).unwrap_or(list.len()) as u64;
                }
            }
        }
        total
    }
}

/// For every virtual used in the graph, the providers of it present in the
/// graph beyond the first. Providers count when they serve any virtual edge,
/// so a compiler already in the graph for one language is preferred for the
/// others it provides.
pub struct ProviderUnification;

impl ProviderUnification {
    fn count(space: &SearchSpace, assignment: &Assignment) -> u64 {
        let mut used: BTreeSet<&str> = BTreeSet::new();
        let mut providers = BTreeSet::new();
        for ((_, to), edge) in assignment.edges() {
            if !edge.virtuals.is_empty() {
                providers.insert(*to);
                used.extend(edge.virtuals.iter().map(String::as_str));
            }
        }
        used.iter()
            .map(|v| {
                let present = providers
                    .iter()
                    .filter(|&&p| space.config(p).provides.contains(*v))
                    .count() as u64;
                present.saturating_sub(1)
            })
            .sum()
    }
}

impl CostFunction for ProviderUnification {
    fn name(&self) -> &'static str {
        "provider-unification"
    }

    fn tier(&self) -> Tier {
        Tier::Default
    }

    fn node_cost(&self, _space: &SearchSpace, _config: &Configuration) -> u64 {
        0
    }

    fn graph_cost(&self, space: &SearchSpace, assignment: &Assignment) -> u64 {
        Self::count(space, assignment)
    }

    fn partial_extra(&self, space: &SearchSpace, assignment: &Assignment) -> u64 {
        Self::count(space, assignment)
    }
}

/// Number of variants not at their default. For a multi-valued variant
/// every value added to or missing from the default set counts.
pub struct VariantDefaults;

impl CostFunction for VariantDefaults {
    fn name(&self) -> &'static str {
        "variant-defaults"
    }

    fn tier(&self) -> Tier {
        Tier::Default
    }

    fn node_cost(&self, space: &SearchSpace, config: &Configuration) -> u64 {
        let Some(facts) = space.facts().package(&config.name) else {
            return 0;
        };
        config
            .variants
            .iter()
            .map(|(name, value)| match facts.def.variant(name) {
                Some(decl) if matches!(decl.domain, VariantDomain::Multi(_)) => {
                    let default: BTreeSet<&str> = decl.default.values().into_iter().collect();
                    let chosen: BTreeSet<&str> = value.values().into_iter().collect();
                    default.symmetric_difference(&chosen).count() as u64
                }
                Some(decl) => u64::from(&decl.default != value),
                None => 0,
            })
            .sum()
    }
}

/// Position of the version in the package's preference order.
pub struct VersionOrder;

impl CostFunction for VersionOrder {
    fn name(&self) -> &'static str {
        "version-order"
    }

    fn tier(&self) -> Tier {
        Tier::Default
    }

    fn node_cost(&self, _space: &SearchSpace, config: &Configuration) -> u64 {
        config.version_rank as u64
    }
}

/// Position of the target in the configured order.
pub struct TargetOrder;

impl CostFunction for TargetOrder {
    fn name(&self) -> &'static str {
        "target-order"
    }

    fn tier(&self) -> Tier {
        Tier::Default
    }

    fn node_cost(&self, _space: &SearchSpace, config: &Configuration) -> u64 {
        config.target_rank as u64
    }
}
