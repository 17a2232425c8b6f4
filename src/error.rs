//! Error taxonomy of a concretization.

use std::fmt;

use crate::config::ConfigError;
use crate::materialize::ConcreteGraph;
use crate::parse::ParseError;
use crate::policy::ConstraintOrigin;

/// Result alias used throughout the crate.
pub type Result<T, E = ConcretizeError> = std::result::Result<T, E>;

/// Explanation attached to an infeasible request.
#[derive(Debug, Clone)]
pub struct UnsatisfiableRequest {
    /// A minimal set of request and policy constraints that cannot hold
    /// together. Removing any one of them makes the request feasible.
    /// Empty when the package definitions alone admit no solution.
    pub conflicts: Vec<ConstraintOrigin>,
    /// Derivation produced by the SAT engine for the full request.
    pub details: String,
}

impl fmt::Display for UnsatisfiableRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflicts.is_empty() {
            writeln!(f, "the package definitions admit no solution")?;
        } else {
            writeln!(f, "these constraints cannot be satisfied together:")?;
            for origin in &self.conflicts {
                writeln!(f, "  - {origin}")?;
            }
        }
        write!(f, "{}", self.details)
    }
}

fn needed_by(parent: &Option<String>) -> String {
    parent
        .as_ref()
        .map(|p| format!(" (needed by '{p}')"))
        .unwrap_or_default()
}

fn join(names: &[String]) -> String {
    names.join(", ")
}

fn best_effort_note(graph: &Option<Box<ConcreteGraph>>) -> &'static str {
    if graph.is_some() {
        " (a best-effort graph is available)"
    } else {
        ""
    }
}

/// Everything that can go wrong while concretizing.
#[derive(Debug, thiserror::Error)]
pub enum ConcretizeError {
    /// Malformed request string.
    #[error("invalid spec: {0}")]
    Parse(#[from] ParseError),

    /// A name that is neither a package nor a virtual.
    #[error("unknown package '{name}'{}", self::needed_by(.needed_by))]
    UnknownPackage {
        /// The unknown name.
        name: String,
        /// Package whose definition mentions it, if any.
        needed_by: Option<String>,
    },

    /// A variant the package does not declare.
    #[error("package '{package}' has no variant '{variant}'")]
    UnknownVariant {
        /// Package (or virtual) the variant was requested on.
        package: String,
        /// The undeclared variant.
        variant: String,
    },

    /// A variant value outside the declared domain.
    #[error("invalid value '{value}' for variant '{variant}' of '{package}' (allowed: {allowed})")]
    InvalidVariantValue {
        /// Package the variant belongs to.
        package: String,
        /// Variant name.
        variant: String,
        /// Rejected value.
        value: String,
        /// Description of the domain.
        allowed: String,
    },

    /// A node ended up with more than one provider for a virtual.
    #[error("virtual '{virtual_name}' of '{package}' resolved to several providers: {}", join(.providers))]
    AmbiguousVirtualProvider {
        /// Depending package.
        package: String,
        /// The virtual.
        virtual_name: String,
        /// Providers found.
        providers: Vec<String>,
    },

    /// Hard constraints admit no assignment.
    #[error("unsatisfiable request: {0}")]
    Unsatisfiable(Box<UnsatisfiableRequest>),

    /// The search budget ran out.
    #[error("search budget exhausted after {steps} steps{}", best_effort_note(.best_effort))]
    SolveTimeout {
        /// Search steps performed.
        steps: u64,
        /// Best feasible graph found, if any.
        best_effort: Option<Box<ConcreteGraph>>,
    },

    /// The solver produced an assignment violating a graph invariant.
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    /// Malformed policy or repository configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The request was already concretized and `force` was not given.
    #[error("already concretized: {} (use force to re-solve)", join(.roots))]
    AlreadyConcretized {
        /// Roots of the previous solution.
        roots: Vec<String>,
    },
}

impl ConcretizeError {
    /// Process exit status for this error: `1` for problems the caller can
    /// fix by changing the request or policy, `2` for solver defects.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConcretizeError::InternalConsistency(_)
            | ConcretizeError::AmbiguousVirtualProvider { .. } => 2,
            _ => 1,
        }
    }

    /// The explanation, when the request is infeasible.
    pub fn unsatisfiable(&self) -> Option<&UnsatisfiableRequest> {
        match self {
            ConcretizeError::Unsatisfiable(request) => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let unknown = ConcretizeError::UnknownPackage {
            name: "nope".into(),
            needed_by: Some("app".into()),
        };
        assert_eq!(unknown.exit_code(), 1);
        assert_eq!(unknown.to_string(), "unknown package 'nope' (needed by 'app')");
        assert_eq!(ConcretizeError::InternalConsistency("cycle".into()).exit_code(), 2);
        let timeout = ConcretizeError::SolveTimeout {
            steps: 10,
            best_effort: None,
        };
        assert_eq!(timeout.exit_code(), 1);
        assert_eq!(timeout.to_string(), "search budget exhausted after 10 steps");
    }
}
