//! Lexicographic branch-and-bound over the search space.
//!
//! The SAT engine first decides feasibility and hands back one feasible
//! selection. A dive restricted to that selection turns it into the first
//! incumbent; the unrestricted search then explores open requirements in
//! discovery order, pruning every branch whose lower bound is no better
//! than the incumbent. Candidates are tried cheapest first, so the first
//! optimum found in that order is the one returned.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cost::CostVector;
use crate::provider::{Probe, probe};
use crate::space::{ConfigId, ConstraintMask, EdgeInfo, Requirement, SearchSpace};
use crate::spec::{DependencyKind, Spec};

/// Limits on the optimization search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchBudget {
    /// Branch nodes the search may expand.
    pub max_steps: u64,
    /// Wall-clock limit, covering the SAT probe and the search.
    pub timeout: Option<Duration>,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            timeout: None,
        }
    }
}

/// Cooperative cancellation shared between a caller and a running solve.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every solve holding a clone of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`CancellationToken::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether a result is known to be optimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Optimality {
    /// The search space was exhausted.
    Optimal,
    /// The budget ran out first; a better graph may exist.
    BestEffort,
}

impl fmt::Display for Optimality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Optimality::Optimal => "optimal",
            Optimality::BestEffort => "best-effort",
        })
    }
}

/// A (partial) graph: one configuration per package name, typed edges and
/// roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    nodes: BTreeMap<String, ConfigId>,
    edges: BTreeMap<(ConfigId, ConfigId), EdgeInfo>,
    roots: BTreeSet<ConfigId>,
}

impl Assignment {
    /// Chosen configurations, in package name order.
    pub fn nodes(&self) -> impl Iterator<Item = ConfigId> + '_ {
        self.nodes.values().copied()
    }

    /// The configuration chosen for `name`.
    pub fn node(&self, name: &str) -> Option<ConfigId> {
        self.nodes.get(name).copied()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node was chosen.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every edge with its metadata.
    pub fn edges(&self) -> impl Iterator<Item = (&(ConfigId, ConfigId), &EdgeInfo)> {
        self.edges.iter()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: ConfigId) -> impl Iterator<Item = (ConfigId, &EdgeInfo)> + '_ {
        self.edges
            .iter()
            .filter(move |((from, _), _)| *from == id)
            .map(|((_, to), edge)| (*to, edge))
    }

    /// Nodes chosen for root requirements.
    pub fn roots(&self) -> impl Iterator<Item = ConfigId> + '_ {
        self.roots.iter().copied()
    }

    /// Nodes reachable from `id` through at least one edge.
    pub fn reachable_from(&self, id: ConfigId) -> BTreeSet<ConfigId> {
        let mut reached = BTreeSet::new();
        let mut stack: Vec<ConfigId> = self.dependencies(id).map(|(to, _)| to).collect();
        while let Some(next) = stack.pop() {
            if reached.insert(next) {
                stack.extend(self.dependencies(next).map(|(to, _)| to));
            }
        }
        reached
    }

    /// Whether `to` is `from` or reachable from it.
    pub fn reaches(&self, from: ConfigId, to: ConfigId) -> bool {
        from == to || self.reachable_from(from).contains(&to)
    }

    /// Whether node `id` satisfies `spec` in this graph: its own attributes
    /// match, `%` parts hold on direct edges and `^` parts somewhere below.
    pub fn satisfies(&self, space: &SearchSpace, id: ConfigId, spec: &Spec) -> bool {
        if !space.config(id).matches_self(&spec.self_part()) {
            return false;
        }
        spec.dependencies.iter().all(|dep| match &dep.kind {
            DependencyKind::Direct { languages } if languages.is_empty() => self
                .dependencies(id)
                .any(|(to, _)| self.satisfies(space, to, &dep.spec)),
            DependencyKind::Direct { languages } => languages.iter().all(|lang| {
                self.dependencies(id)
                    .any(|(to, edge)| edge.virtuals.contains(lang) && self.satisfies(space, to, &dep.spec))
            }),
            DependencyKind::Transitive => self
                .reachable_from(id)
                .into_iter()
                .any(|to| self.satisfies(space, to, &dep.spec)),
        })
    }

    fn insert_edge(&mut self, from: ConfigId, to: ConfigId, edge: &EdgeInfo) {
        let slot = self.edges.entry((from, to)).or_default();
        slot.types.merge(&edge.types);
        slot.virtuals.extend(edge.virtuals.iter().cloned());
    }

    /// Every node hangs below a root and every `^` requirement of a node is
    /// met somewhere below it.
    fn is_connected(&self, space: &SearchSpace, mask: &ConstraintMask) -> bool {
        let mut reached = BTreeSet::new();
        let mut stack: Vec<ConfigId> = self.roots.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if reached.insert(id) {
                stack.extend(self.dependencies(id).map(|(to, _)| to));
            }
        }
        if reached.len() != self.nodes.len() {
            return false;
        }
        self.nodes().all(|id| {
            let mut transitive = space
                .config(id)
                .active_requirements(mask)
                .filter(|r| r.edge.is_none())
                .peekable();
            if transitive.peek().is_none() {
                return true;
            }
            let below = self.reachable_from(id);
            transitive.all(|r| below.iter().any(|&n| r.matches(space.config(n), mask)))
        })
    }
}

/// An optimized graph.
#[derive(Debug, Clone)]
pub struct Solution {
    /// The graph.
    pub assignment: Assignment,
    /// Its cost, one entry per criterion.
    pub cost: CostVector,
    /// Whether the search finished.
    pub optimality: Optimality,
    /// Branch nodes expanded.
    pub steps: u64,
}

/// Why no graph was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveFailure {
    /// No graph satisfies the hard constraints.
    Infeasible {
        /// Derivation of the conflict.
        details: String,
    },
    /// The budget ran out, or the solve was cancelled, before any graph
    /// was found.
    Exhausted {
        /// Branch nodes expanded.
        steps: u64,
    },
}

/// Finds the cheapest graph of a search space.
pub struct Optimizer<'s> {
    space: &'s SearchSpace,
    budget: SearchBudget,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl<'s> Optimizer<'s> {
    /// Optimizer for `space` within `budget`. The wall-clock limit starts
    /// running now.
    pub fn new(space: &'s SearchSpace, budget: SearchBudget) -> Self {
        let deadline = budget.timeout.map(|t| Instant::now() + t);
        Self {
            space,
            budget,
            deadline,
            cancel: None,
        }
    }

    /// Replace the wall-clock limit with an absolute deadline, e.g. one
    /// shared with the rest of a concretization.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Stop when `token` fires.
    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Search for the cheapest graph satisfying every hard constraint.
    pub fn solve(&self) -> Result<Solution, SolveFailure> {
        let deadline = self.deadline;
        let mask = self.space.full_mask();
        let seed = match probe(self.space, &mask, self.cancel.as_ref(), deadline) {
            Probe::Satisfiable(selection) => selection,
            Probe::Unsatisfiable(details) => return Err(SolveFailure::Infeasible { details }),
            Probe::Cancelled => return Err(SolveFailure::Exhausted { steps: 0 }),
        };

        let mut search = Search {
            space: self.space,
            mask,
            steps: 0,
            max_steps: self.budget.max_steps,
            deadline,
            cancel: self.cancel.clone(),
            stopped: false,
            best: None,
            restrict: Some(seed.into_iter().collect()),
            first_only: true,
        };
        search.run();
        if let Some((cost, _)) = &search.best {
            debug!(cost = %cost, steps = search.steps, "seeded from SAT solution");
        }
        search.restrict = None;
        search.first_only = false;
        search.run();

        let optimality = if search.stopped {
            Optimality::BestEffort
        } else {
            Optimality::Optimal
        };
        match search.best {
            Some((cost, assignment)) => {
                debug!(cost = %cost, steps = search.steps, %optimality, "search finished");
                Ok(Solution {
                    assignment,
                    cost,
                    optimality,
                    steps: search.steps,
                })
            }
            None if search.stopped => Err(SolveFailure::Exhausted {
                steps: search.steps,
            }),
            None => Err(SolveFailure::Infeasible {
                details: "every selection leaves a required package unreachable from the roots \
                          or forms a dependency cycle"
                    .to_string(),
            }),
        }
    }
}

/// A requirement waiting to be satisfied.
#[derive(Clone)]
struct Open<'s> {
    owner: Option<ConfigId>,
    requirement: &'s Requirement,
    root: bool,
}

#[derive(Clone)]
struct Partial<'s> {
    assignment: Assignment,
    open: VecDeque<Open<'s>>,
    cost: CostVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Existing(ConfigId),
    Fresh(ConfigId),
}

struct Search<'s> {
    space: &'s SearchSpace,
    mask: ConstraintMask,
    steps: u64,
    max_steps: u64,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    stopped: bool,
    best: Option<(CostVector, Assignment)>,
    /// Only these configurations may be added.
    restrict: Option<BTreeSet<ConfigId>>,
    /// Stop at the first complete graph.
    first_only: bool,
}

impl<'s> Search<'s> {
    fn run(&mut self) {
        let space: &'s SearchSpace = self.space;
        let open = space
            .top()
            .iter()
            .filter(|t| self.mask.is_active(t.requirement.origin))
            .map(|t| Open {
                owner: None,
                requirement: &t.requirement,
                root: t.root,
            })
            .collect();
        self.descend(Partial {
            assignment: Assignment::default(),
            open,
            cost: CostVector::zero(space.compiled().costs.len()),
        });
    }

    fn exhausted(&self) -> bool {
        self.steps > self.max_steps
            || self.deadline.is_some_and(|d| Instant::now() >= d)
            || self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn bound(&self, partial: &Partial<'s>) -> CostVector {
        let extra = self
            .space
            .compiled()
            .costs
            .extra_vector(self.space, &partial.assignment);
        &partial.cost + &extra
    }

    fn descend(&mut self, mut partial: Partial<'s>) {
        if self.stopped || (self.first_only && self.best.is_some()) {
            return;
        }
        self.steps += 1;
        if self.exhausted() {
            self.stopped = true;
            return;
        }
        if let Some((best, _)) = &self.best {
            if &self.bound(&partial) >= best {
                return;
            }
        }
        let Some(open) = partial.open.pop_front() else {
            self.leaf(partial.assignment);
            return;
        };

        let mut options: Vec<(CostVector, bool, usize, ConfigId, Partial<'s>)> = Vec::new();
        for choice in self.choices(&partial.assignment, &open) {
            let Some(next) = self.apply(&partial, &open, choice) else {
                continue;
            };
            let (fresh, id) = match choice {
                Choice::Existing(id) => (false, id),
                Choice::Fresh(id) => (true, id),
            };
            let rank = if fresh { self.space.preference_rank(id) } else { 0 };
            options.push((self.bound(&next), fresh, rank, id, next));
        }
        options.sort_by(|a, b| (&a.0, a.1, a.2, a.3).cmp(&(&b.0, b.1, b.2, b.3)));
        trace!(
            owner = ?open.owner.map(|id| self.space.config(id).to_string()),
            alternatives = open.requirement.alternatives.len(),
            options = options.len(),
            "branch"
        );
        for (_, _, _, _, next) in options {
            self.descend(next);
            if self.stopped {
                return;
            }
        }
    }

    fn choices(&self, assignment: &Assignment, open: &Open<'s>) -> Vec<Choice> {
        let mut out = Vec::new();
        for alternative in &open.requirement.alternatives {
            match assignment.node(&alternative.name) {
                Some(id) => {
                    let choice = Choice::Existing(id);
                    if alternative.matches(self.space.config(id), &self.mask) && !out.contains(&choice) {
                        out.push(choice);
                    }
                }
                None => {
                    for id in self.space.matching(alternative, &self.mask) {
                        let choice = Choice::Fresh(id);
                        if self.restrict.as_ref().is_none_or(|r| r.contains(&id))
                            && !out.contains(&choice)
                            && self.compatible(assignment, id)
                        {
                            out.push(choice);
                        }
                    }
                }
            }
        }
        out
    }

    /// Whether adding `id` violates no constrain of the graph, nor the
    /// graph any constrain of `id`.
    fn compatible(&self, assignment: &Assignment, id: ConfigId) -> bool {
        let candidate = self.space.config(id);
        assignment.nodes().all(|n| {
            let node = self.space.config(n);
            node.active_constrains(&self.mask)
                .all(|c| !c.matcher.matches(candidate, &self.mask))
                && candidate
                    .active_constrains(&self.mask)
                    .all(|c| !c.matcher.matches(node, &self.mask))
        })
    }

    fn apply(&self, partial: &Partial<'s>, open: &Open<'s>, choice: Choice) -> Option<Partial<'s>> {
        let space: &'s SearchSpace = self.space;
        let mut next = partial.clone();
        let id = match choice {
            Choice::Existing(id) => id,
            Choice::Fresh(id) => {
                let config = space.config(id);
                next.assignment.nodes.insert(config.name.clone(), id);
                next.cost = &next.cost + space.node_cost(id);
                next.open.extend(
                    config
                        .requirements
                        .iter()
                        .filter(|r| self.mask.is_active(r.origin))
                        .map(|requirement| Open {
                            owner: Some(id),
                            requirement,
                            root: false,
                        }),
                );
                id
            }
        };
        if open.root {
            next.assignment.roots.insert(id);
        }
        if let (Some(owner), Some(edge)) = (open.owner, &open.requirement.edge) {
            if next.assignment.reaches(id, owner) {
                return None;
            }
            next.assignment.insert_edge(owner, id, edge);
        }
        Some(next)
    }

    fn leaf(&mut self, assignment: Assignment) {
        if !assignment.is_connected(self.space, &self.mask) {
            trace!(nodes = assignment.len(), "rejected disconnected graph");
            return;
        }
        let cost = self.space.compiled().costs.graph_vector(self.space, &assignment);
        if self.best.as_ref().is_none_or(|(best, _)| &cost < best) {
            debug!(cost = %cost, steps = self.steps, "improved incumbent");
            self.best = Some((cost, assignment));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactBase;
    use crate::policy::{Policy, PolicyCompiler};
    use crate::repository::{InMemoryRepository, RepoSnapshot};
    use crate::reuse::ReuseIndex;

    const REPO: &str = r#"
packages:
  app:
    versions: ["2.0", "1.0"]
    depends_on: ["zlib@1.3:"]
  zlib:
    versions: ["1.3", "1.2"]
  tool:
    versions: ["1.0"]
    depends_on: [c, cxx]
  gcc:
    versions: ["13"]
    provides: [c, cxx]
  clang:
    versions: ["17"]
    provides: [c, cxx]
"#;

    fn space(policy: &str, request: &str) -> SearchSpace {
        let snapshot = RepoSnapshot::new(InMemoryRepository::from_yaml_str(REPO).unwrap());
        let policy = Arc::new(Policy::from_yaml_str(policy).unwrap());
        let request = crate::parse::parse_specs(request).unwrap();
        let reuse = ReuseIndex::default();
        let facts = FactBase::collect(&snapshot, &policy, &request, &reuse).unwrap();
        let compiled = PolicyCompiler::new(&policy, &facts)
            .compile(&request, policy.reuse)
            .unwrap();
        SearchSpace::build(facts, compiled, reuse)
    }

    fn describe(space: &SearchSpace, assignment: &Assignment) -> Vec<String> {
        assignment.nodes().map(|id| space.config(id).to_string()).collect()
    }

    #[test]
    fn cheapest_graph_is_optimal() {
        let space = space("{}", "app");
        let solution = Optimizer::new(&space, SearchBudget::default()).solve().unwrap();
        assert_eq!(solution.optimality, Optimality::Optimal);
        assert_eq!(
            describe(&space, &solution.assignment),
            ["app@2.0 target=x86_64", "zlib@1.3 target=x86_64"]
        );
        let app = solution.assignment.node("app").unwrap();
        assert_eq!(solution.assignment.roots().collect::<Vec<_>>(), [app]);
        let deps: Vec<ConfigId> = solution.assignment.dependencies(app).map(|(to, _)| to).collect();
        assert_eq!(deps, [solution.assignment.node("zlib").unwrap()]);
    }

    #[test]
    fn shared_provider_serves_both_languages() {
        let space = space("packages:\n  all:\n    providers: {c: [clang]}\n", "tool");
        let solution = Optimizer::new(&space, SearchBudget::default()).solve().unwrap();
        assert_eq!(solution.assignment.len(), 2);
        assert!(solution.assignment.node("clang").is_some());
        let tool = solution.assignment.node("tool").unwrap();
        assert!(solution.assignment.satisfies(&space, tool, &Spec::parse("tool%clang").unwrap()));
        assert!(solution.assignment.satisfies(&space, tool, &Spec::parse("tool%cxx=clang").unwrap()));
        assert!(!solution.assignment.satisfies(&space, tool, &Spec::parse("tool%gcc").unwrap()));
    }

    #[test]
    fn infeasible_requests_fail_before_searching() {
        let space = space("{}", "app ^zlib@1.2");
        let failure = Optimizer::new(&space, SearchBudget::default()).solve().unwrap_err();
        assert!(matches!(failure, SolveFailure::Infeasible { .. }), "{failure:?}");
    }

    #[test]
    fn exhausted_budget_keeps_the_seed() {
        let space = space("{}", "app");
        let budget = SearchBudget {
            max_steps: 3,
            timeout: None,
        };
        let solution = Optimizer::new(&space, budget).solve().unwrap();
        assert_eq!(solution.optimality, Optimality::BestEffort);
        assert_eq!(solution.assignment.len(), 2);

        let budget = SearchBudget {
            max_steps: 1,
            timeout: None,
        };
        let failure = Optimizer::new(&space, budget).solve().unwrap_err();
        assert!(matches!(failure, SolveFailure::Exhausted { .. }));
    }

    #[test]
    fn cancellation_stops_the_solve() {
        let space = space("{}", "app");
        let token = CancellationToken::new();
        token.cancel();
        let failure = Optimizer::new(&space, SearchBudget::default())
            .with_cancellation(Some(token))
            .solve()
            .unwrap_err();
        assert_eq!(failure, SolveFailure::Exhausted { steps: 0 });
    }

    #[test]
    fn shared_deadline_overrides_the_budget() {
        let space = space("{}", "app");
        let budget = SearchBudget {
            timeout: Some(Duration::from_secs(3600)),
            ..SearchBudget::default()
        };
        let failure = Optimizer::new(&space, budget.clone())
            .with_deadline(Some(Instant::now()))
            .solve()
            .unwrap_err();
        assert_eq!(failure, SolveFailure::Exhausted { steps: 0 });

        let solution = Optimizer::new(&space, budget).solve().unwrap();
        assert_eq!(solution.optimality, Optimality::Optimal);
    }
}
