//! Bridge between the search space and resolvo's [`DependencyProvider`].
//!
//! [`SpaceProvider`] exposes one solvable per configuration and one
//! version set per node matcher, under a given [`ConstraintMask`].
//! resolvo answers feasibility questions with it: whether a request can be
//! satisfied at all, a first feasible assignment that seeds the optimizer,
//! and the probes that narrow an infeasible request down to a minimal set
//! of constraints.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use resolvo::{
    Candidates, Condition, ConditionId, ConditionalRequirement, Dependencies,
    HintDependenciesAvailable, KnownDependencies, NameId, Problem, Requirement, SolvableId, Solver,
    SolverCache, StringId, UnsolvableOrCancelled, VersionSetId, VersionSetUnionId,
};
use tracing::trace;

use crate::pool::{MatcherSet, SpacePool, config_of, solvable_of};
use crate::solver::CancellationToken;
use crate::space::{ConfigId, ConstraintMask, NodeMatcher, SearchSpace};

/// Dependency provider over a search space and a constraint mask.
///
/// Construction interns every configuration and pre-computes its
/// dependencies under the mask. The provider is read-only afterwards and
/// suitable for passing to [`resolvo::Solver::new`].
pub struct SpaceProvider<'a> {
    space: &'a SearchSpace,
    mask: &'a ConstraintMask,
    pub(crate) pool: SpacePool,
    /// Candidates per name, usable or not.
    candidates: HashMap<NameId, Vec<SolvableId>>,
    /// Unusable candidates per name, with the reason.
    excluded: HashMap<NameId, Vec<(SolvableId, StringId)>>,
    /// Pre-computed dependencies per solvable.
    dependencies: Vec<KnownDependencies>,
    /// Requirements of the problem itself.
    top: Vec<ConditionalRequirement>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl<'a> SpaceProvider<'a> {
    /// Build a provider for `space` with the constraints of `mask` active.
    pub fn new(space: &'a SearchSpace, mask: &'a ConstraintMask) -> Self {
        let mut pool = SpacePool::new();
        let mut candidates: HashMap<NameId, Vec<SolvableId>> = HashMap::new();
        let mut excluded: HashMap<NameId, Vec<(SolvableId, StringId)>> = HashMap::new();

        for config in space.configs() {
            let name_id = pool.intern_name(&config.name);
            let solvable = pool.intern_solvable(name_id);
            debug_assert_eq!(solvable, solvable_of(config.id));
            candidates.entry(name_id).or_default().push(solvable);
            if let Some(reason) = space.exclusion_reason(config.id, mask) {
                let reason = pool.intern_string(reason);
                excluded.entry(name_id).or_default().push((solvable, reason));
            }
        }

        let mut dependencies = Vec::with_capacity(space.configs().len());
        for config in space.configs() {
            let mut requirements = Vec::new();
            for requirement in config.active_requirements(mask) {
                requirements.push(intern_requirement(&mut pool, &requirement.alternatives));
            }
            let constrains = config
                .active_constrains(mask)
                .map(|c| {
                    let name_id = pool.intern_name(&c.matcher.name);
                    pool.intern_version_set(
                        name_id,
                        MatcherSet {
                            matcher: c.matcher.clone(),
                            inverted: true,
                        },
                    )
                })
                .collect();
            dependencies.push(KnownDependencies {
                requirements,
                constrains,
            });
        }

        let top = space
            .top()
            .iter()
            .filter(|t| mask.is_active(t.requirement.origin))
            .map(|t| intern_requirement(&mut pool, &t.requirement.alternatives))
            .collect();

        Self {
            space,
            mask,
            pool,
            candidates,
            excluded,
            dependencies,
            top,
            cancel: None,
            deadline: None,
        }
    }

    /// Stop when `cancel` fires or `deadline` passes.
    pub fn with_limits(mut self, cancel: Option<CancellationToken>, deadline: Option<Instant>) -> Self {
        self.cancel = cancel;
        self.deadline = deadline;
        self
    }

    /// Requirements to pass to [`resolvo::Problem::requirements`].
    pub fn top_requirements(&self) -> Vec<ConditionalRequirement> {
        self.top.clone()
    }

    /// The search space.
    pub fn space(&self) -> &'a SearchSpace {
        self.space
    }
}

/// Requirement on any of `alternatives`, never conditional.
fn intern_requirement(pool: &mut SpacePool, alternatives: &[NodeMatcher]) -> ConditionalRequirement {
    let mut sets: Vec<VersionSetId> = alternatives
        .iter()
        .map(|matcher| {
            let name_id = pool.intern_name(&matcher.name);
            pool.intern_version_set(
                name_id,
                MatcherSet {
                    matcher: matcher.clone(),
                    inverted: false,
                },
            )
        })
        .collect();
    let requirement = if sets.len() == 1 {
        Requirement::Single(sets.remove(0))
    } else {
        Requirement::Union(pool.intern_version_set_union(sets))
    };
    ConditionalRequirement {
        condition: None,
        requirement,
    }
}

/// Outcome of one feasibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// A feasible selection, one configuration per package.
    Satisfiable(Vec<ConfigId>),
    /// No selection exists; the SAT engine's derivation.
    Unsatisfiable(String),
    /// Cancelled or out of time.
    Cancelled,
}

/// Ask resolvo whether the space admits a solution under `mask`.
pub fn probe(
    space: &SearchSpace,
    mask: &ConstraintMask,
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Probe {
    let provider = SpaceProvider::new(space, mask).with_limits(cancel.cloned(), deadline);
    let problem = Problem::new().requirements(provider.top_requirements());
    let mut solver = Solver::new(provider);
    match solver.solve(problem) {
        Ok(solution) => {
            let mut configs: Vec<ConfigId> = solution.into_iter().map(config_of).collect();
            configs.sort();
            Probe::Satisfiable(configs)
        }
        Err(UnsolvableOrCancelled::Unsolvable(conflict)) => {
            Probe::Unsatisfiable(conflict.display_user_friendly(&solver).to_string())
        }
        Err(UnsolvableOrCancelled::Cancelled(_)) => Probe::Cancelled,
    }
}

// --- Display wrappers ---

struct DisplaySolvable<'a>(&'a SearchSpace, SolvableId);

impl fmt::Display for DisplaySolvable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.config(config_of(self.1)))
    }
}

struct DisplayName<'a>(&'a SpacePool, NameId);

impl fmt::Display for DisplayName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.resolve_name(self.1))
    }
}

struct DisplayVersionSet<'a>(&'a SpacePool, VersionSetId);

impl fmt::Display for DisplayVersionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.resolve_version_set(self.1))
    }
}

struct DisplayString<'a>(&'a SpacePool, StringId);

impl fmt::Display for DisplayString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.resolve_string(self.1))
    }
}

// --- Interner ---

impl resolvo::Interner for SpaceProvider<'_> {
    fn display_solvable(&self, solvable: SolvableId) -> impl fmt::Display + '_ {
        DisplaySolvable(self.space, solvable)
    }

    fn display_name(&self, name: NameId) -> impl fmt::Display + '_ {
        DisplayName(&self.pool, name)
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl fmt::Display + '_ {
        DisplayVersionSet(&self.pool, version_set)
    }

    fn display_string(&self, string_id: StringId) -> impl fmt::Display + '_ {
        DisplayString(&self.pool, string_id)
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.pool.version_set_name(version_set)
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.pool.solvable_name(solvable)
    }

    fn version_sets_in_union(
        &self,
        version_set_union: VersionSetUnionId,
    ) -> impl Iterator<Item = VersionSetId> {
        self.pool
            .resolve_version_set_union(version_set_union)
            .iter()
            .copied()
    }

    /// resolvo asks for a condition only when a requirement carries one.
    /// `intern_requirement` is the only place requirements are built and it
    /// always sets `condition: None`: `when` clauses are evaluated per
    /// configuration while the space is built, so the SAT encoding never
    /// needs conditional edges. No `ConditionId` is ever handed to resolvo,
    /// which makes this call impossible rather than merely unlikely.
    fn resolve_condition(&self, condition: ConditionId) -> Condition {
        unreachable!("no conditions are interned, got {condition:?}")
    }
}

// --- DependencyProvider ---

impl resolvo::DependencyProvider for SpaceProvider<'_> {
    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        let solvables = self.candidates.get(&name)?;
        Some(Candidates {
            candidates: solvables.clone(),
            favored: None,
            locked: None,
            hint_dependencies_available: HintDependenciesAvailable::All,
            excluded: self.excluded.get(&name).cloned().unwrap_or_default(),
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        // Cheapest first, so the first solution found is already a good
        // incumbent for the optimizer.
        solvables.sort_by_key(|&s| self.space.preference_rank(config_of(s)));
    }

    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let set = self.pool.resolve_version_set(version_set);
        candidates
            .iter()
            .copied()
            .filter(|&s| {
                let config = self.space.config(config_of(s));
                let mut matches = set.matcher.matches(config, self.mask);
                if set.inverted {
                    matches = !matches;
                }
                matches != inverse
            })
            .collect()
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> Dependencies {
        let deps = self
            .dependencies
            .get(config_of(solvable).index())
            .cloned()
            .unwrap_or(KnownDependencies {
                requirements: Vec::new(),
                constrains: Vec::new(),
            });
        trace!(
            solvable = %self.space.config(config_of(solvable)),
            requirements = deps.requirements.len(),
            constrains = deps.constrains.len(),
            "dependencies"
        );
        Dependencies::Known(deps)
    }

    fn should_cancel_with_value(&self) -> Option<Box<dyn std::any::Any>> {
        let cancelled = self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
            || self.deadline.is_some_and(|d| Instant::now() >= d);
        cancelled.then(|| Box::new(()) as Box<dyn std::any::Any>)
    }
}
