//! Narrowing an infeasible request down to the constraints responsible.
//!
//! Every request and policy constraint is removable: dropping it from the
//! [`ConstraintMask`] restores exactly the candidates it ruled out. A
//! deletion filter walks the constraints once, dropping each one that is
//! not needed to keep the problem infeasible. What remains is minimal:
//! removing any single member makes the request feasible.

use std::time::Instant;

use tracing::debug;

use crate::policy::ConstraintId;
use crate::provider::{Probe, probe};
use crate::solver::CancellationToken;
use crate::space::{ConstraintMask, SearchSpace};

/// Constraints that cannot hold together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Explanation {
    /// The conflicting constraints, in compilation order.
    pub constraints: Vec<ConstraintId>,
    /// Whether the filter ran to completion. A cut-short filter still
    /// returns an infeasible set, just not necessarily a minimal one.
    pub minimal: bool,
}

/// Find a minimal set of constraints that, together with the package
/// definitions, admits no solution. Empty when the definitions alone are
/// infeasible.
pub fn minimal_conflict(
    space: &SearchSpace,
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> Explanation {
    let len = space.compiled().constraints.len();
    let mut none = ConstraintMask::all(len);
    for i in 0..len {
        none.set(ConstraintId(i), false);
    }
    match probe(space, &none, cancel, deadline) {
        Probe::Unsatisfiable(_) => {
            debug!("package definitions alone are infeasible");
            return Explanation {
                constraints: Vec::new(),
                minimal: true,
            };
        }
        Probe::Cancelled => {
            return Explanation {
                constraints: (0..len).map(ConstraintId).collect(),
                minimal: false,
            };
        }
        Probe::Satisfiable(_) => {}
    }

    let mut mask = space.full_mask();
    let mut minimal = true;
    for i in 0..len {
        let id = ConstraintId(i);
        mask.set(id, false);
        match probe(space, &mask, cancel, deadline) {
            Probe::Unsatisfiable(_) => {
                debug!(constraint = %space.constraint(id).origin, "not needed for the conflict");
            }
            Probe::Satisfiable(_) => mask.set(id, true),
            Probe::Cancelled => {
                mask.set(id, true);
                minimal = false;
                break;
            }
        }
    }
    let constraints: Vec<ConstraintId> = mask.active().collect();
    debug!(constraints = constraints.len(), minimal, "conflict narrowed");
    Explanation {
        constraints,
        minimal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactBase;
    use crate::policy::{ConstraintOrigin, Policy, PolicyCompiler};
    use crate::repository::{InMemoryRepository, RepoSnapshot};
    use crate::reuse::ReuseIndex;
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
  foo:
    versions: ["1.5", "1.4", "1.2", "1.0"]
  bar:
    versions: ["1.0"]
"#;

    #[test]
    fn irrelevant_constraints_are_dropped() {
        let space = space(
            REPO,
            r#"
packages:
  bar:
    require: "@1.0"
  foo:
    require: "@1.2:"
    conflict: "@1.4"
"#,
            "foo@1.4 bar",
        );
        let explanation = minimal_conflict(&space, None, None);
        assert!(explanation.minimal);
        let origins: Vec<String> = explanation
            .constraints
            .iter()
            .map(|&id| space.constraint(id).origin.to_string())
            .collect();
        assert_eq!(origins.len(), 2, "{origins:?}");
        assert!(origins[0].starts_with("packages:foo:conflict[0]"), "{origins:?}");
        assert!(matches!(
            space.constraint(explanation.constraints[1]).origin,
            ConstraintOrigin::Request { .. }
        ));
    }

    #[test]
    fn definitions_alone() {
        let repo = "packages:\n  foo:\n    versions: [\"1.0\"]\n    depends_on: [\"bar@2:\"]\n  bar:\n    versions: [\"1.0\"]\n";
        let space = space(repo, "{}", "foo");
        let explanation = minimal_conflict(&space, None, None);
        assert_eq!(explanation.constraints, []);
        assert!(explanation.minimal);
    }
}
