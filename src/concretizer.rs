//! Orchestration of one concretization.
//!
//! [`Concretizer`] owns the shared, read-only inputs: a repository
//! snapshot, the immutable [`Policy`] and the reuse sources. Each call to
//! [`Concretizer::concretize`] snapshots the reuse sources, extracts facts,
//! compiles the policy, builds the search space, optimizes, and
//! materializes the winner. Nothing is shared between calls, so any number
//! of solves may run concurrently against the same concretizer.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, warn};

use crate::cost::CostVector;
use crate::error::{ConcretizeError, Result, UnsatisfiableRequest};
use crate::explain::minimal_conflict;
use crate::facts::FactBase;
use crate::materialize::{ConcreteGraph, materialize};
use crate::parse::parse_specs;
use crate::policy::{ALL, Policy, PolicyCompiler, ReuseMode, TimeoutPolicy};
use crate::repository::RepoSnapshot;
use crate::reuse::{InMemoryStore, Provenance, ReuseIndex, ReuseRecord, ReuseSource};
use crate::solver::{CancellationToken, Optimality, Optimizer, SolveFailure};
use crate::space::SearchSpace;
use crate::spec::Spec;

/// Per-call flags.
#[derive(Debug, Clone, Default)]
pub struct ConcretizeOptions {
    /// Build everything from source; only externals are reused.
    pub fresh: bool,
    /// Build the roots from source, reuse dependencies.
    pub fresh_roots: bool,
    /// Replace a previous solution of the same roots.
    pub force: bool,
    /// Stops the solve when fired.
    pub cancel: Option<CancellationToken>,
}

impl ConcretizeOptions {
    fn reuse(&self, configured: ReuseMode) -> ReuseMode {
        if self.fresh {
            ReuseMode::None
        } else if self.fresh_roots {
            ReuseMode::DependenciesOnly
        } else {
            configured
        }
    }
}

/// A successful concretization.
#[derive(Debug, Clone)]
pub struct Concretization {
    /// The concrete graph.
    pub graph: ConcreteGraph,
    /// Whether the graph is known to be optimal.
    pub optimality: Optimality,
    /// Cost of the graph, one entry per criterion.
    pub cost: CostVector,
    /// Branch nodes the search expanded.
    pub steps: u64,
}

/// Concretizes requests against a repository snapshot and a policy.
pub struct Concretizer {
    snapshot: RepoSnapshot,
    policy: Arc<Policy>,
    sources: Vec<Arc<dyn ReuseSource>>,
}

impl Concretizer {
    /// Concretizer without reuse sources; externals from policy are still
    /// reused.
    pub fn new(snapshot: RepoSnapshot, policy: Policy) -> Self {
        Self {
            snapshot,
            policy: Arc::new(policy),
            sources: Vec::new(),
        }
    }

    /// Add a source of reusable nodes, e.g. the local store.
    pub fn with_reuse_source(mut self, source: Arc<dyn ReuseSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// The policy every solve uses.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The repository snapshot every solve uses.
    pub fn snapshot(&self) -> &RepoSnapshot {
        &self.snapshot
    }

    /// Parse `request` and concretize it.
    pub fn concretize_str(&self, request: &str, options: &ConcretizeOptions) -> Result<Concretization> {
        let specs = parse_specs(request)?;
        self.concretize(&specs, options)
    }

    /// Concretize again on top of a previous solution, whose nodes become
    /// reuse candidates. Without `force`, re-solving roots that were all
    /// solved before is refused.
    pub fn reconcretize(
        &self,
        request: &[Spec],
        previous: &ConcreteGraph,
        options: &ConcretizeOptions,
    ) -> Result<Concretization> {
        let solved_before = request
            .iter()
            .all(|s| s.name.as_ref().is_some_and(|n| previous.roots.contains(n)));
        if solved_before && !options.force {
            return Err(ConcretizeError::AlreadyConcretized {
                roots: previous.roots.clone(),
            });
        }
        let store = InMemoryStore::new("previous solution");
        store.install(previous, Provenance::Installed);
        let mut sources = self.sources.clone();
        sources.push(Arc::new(store));
        self.run(request, options, &sources)
    }

    /// Concretize `request` into a single concrete graph.
    pub fn concretize(&self, request: &[Spec], options: &ConcretizeOptions) -> Result<Concretization> {
        self.run(request, options, &self.sources)
    }

    fn run(
        &self,
        request: &[Spec],
        options: &ConcretizeOptions,
        sources: &[Arc<dyn ReuseSource>],
    ) -> Result<Concretization> {
        let text: Vec<String> = request.iter().map(Spec::to_string).collect();
        let span = info_span!("concretize", request = %text.join(" "));
        let _enter = span.enter();

        // One wall-clock budget covers the search and any explanation.
        let deadline = self.policy.budget.timeout.map(|t| Instant::now() + t);
        let reuse = options.reuse(self.policy.reuse);
        let index = ReuseIndex::snapshot(self.externals(), sources);
        let facts = FactBase::collect(&self.snapshot, &self.policy, request, &index)?;
        let compiled = PolicyCompiler::new(&self.policy, &facts).compile(request, reuse)?;
        let space = SearchSpace::build(facts, compiled, index);

        let optimizer = Optimizer::new(&space, self.policy.budget.clone())
            .with_deadline(deadline)
            .with_cancellation(options.cancel.clone());
        match optimizer.solve() {
            Ok(solution) => {
                let graph = materialize(&space, &solution.assignment)?;
                if solution.optimality == Optimality::BestEffort {
                    if self.policy.on_timeout == TimeoutPolicy::Error {
                        return Err(ConcretizeError::SolveTimeout {
                            steps: solution.steps,
                            best_effort: Some(Box::new(graph)),
                        });
                    }
                    warn!(steps = solution.steps, "search budget exhausted, returning best graph found");
                }
                Ok(Concretization {
                    graph,
                    optimality: solution.optimality,
                    cost: solution.cost,
                    steps: solution.steps,
                })
            }
            Err(SolveFailure::Infeasible { details }) => Err(self.explain(&space, details, options, deadline)),
            Err(SolveFailure::Exhausted { steps }) => Err(ConcretizeError::SolveTimeout {
                steps,
                best_effort: None,
            }),
        }
    }

    fn explain(
        &self,
        space: &SearchSpace,
        details: String,
        options: &ConcretizeOptions,
        deadline: Option<Instant>,
    ) -> ConcretizeError {
        let explanation = minimal_conflict(space, options.cancel.as_ref(), deadline);
        if !explanation.minimal {
            warn!("conflict explanation was cut short and may not be minimal");
        }
        let conflicts = explanation
            .constraints
            .iter()
            .map(|&id| space.constraint(id).origin.clone())
            .collect();
        ConcretizeError::Unsatisfiable(Box::new(UnsatisfiableRequest { conflicts, details }))
    }

    /// Records for the externals declared in policy.
    fn externals(&self) -> Vec<ReuseRecord> {
        let repo = self.snapshot.repo();
        let target = self.policy.targets.first().map(String::as_str).unwrap_or_default();
        let mut records = Vec::new();
        for (scope, package) in self.policy.scopes().filter(|(s, _)| *s != ALL) {
            let Some(def) = repo.package(scope) else {
                if !package.externals.is_empty() {
                    warn!(package = scope, "ignoring externals of an unknown package");
                }
                continue;
            };
            for rule in &package.externals {
                match ReuseRecord::external(rule, &def, target) {
                    Some(record) => records.push(record),
                    None => warn!(package = scope, spec = %rule.spec, "external without a single version"),
                }
            }
        }
        debug!(externals = records.len(), "externals from policy");
        records
    }
}
