//! Abstract package specifications.
//!
//! A [`Spec`] is a possibly partial description of one package node: a
//! name (absent for anonymous predicates such as `@1.2:` or `+mpi` used in
//! policy files), a version constraint, variant constraints, a target, and
//! constraints on dependencies. Direct dependency constraints are written
//! `%name` (or `%lang=name` for a language provider), transitive ones
//! `^name`.
//!
//! Concrete, fully resolved nodes live in [`crate::materialize`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::parse::{ParseError, parse_spec};
use crate::version::{Version, VersionConstraint};

/// Value of a variant, either requested (abstract) or assigned (concrete).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    /// Boolean variant, written `+name` / `~name`.
    Bool(bool),
    /// Single value, written `name=value`.
    Value(String),
    /// Set of values of a multi-valued variant, written `name=a,b`.
    Set(BTreeSet<String>),
}

impl VariantValue {
    /// Build a value from the right-hand side of `name=value`.
    pub fn from_assignment(text: &str) -> Self {
        match text {
            "true" => VariantValue::Bool(true),
            "false" => VariantValue::Bool(false),
            _ if text.contains(',') => VariantValue::Set(
                text.split(',')
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => VariantValue::Value(text.to_string()),
        }
    }

    /// Whether a concrete assignment satisfies this requested value.
    ///
    /// A requested value of a multi-valued variant is satisfied when every
    /// requested element is part of the concrete set.
    pub fn satisfied_by(&self, concrete: &VariantValue) -> bool {
        use VariantValue::*;
        match (self, concrete) {
            (Bool(a), Bool(b)) => a == b,
            (Value(a), Value(b)) => a == b,
            (Value(a), Set(b)) => b.contains(a),
            (Set(a), Set(b)) => a.is_subset(b),
            (Set(a), Value(b)) => a.len() == 1 && a.contains(b),
            _ => false,
        }
    }

    /// Every individual value mentioned (booleans yield nothing).
    pub fn values(&self) -> Vec<&str> {
        match self {
            VariantValue::Bool(_) => Vec::new(),
            VariantValue::Value(v) => vec![v.as_str()],
            VariantValue::Set(set) => set.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantValue::Bool(b) => write!(f, "{b}"),
            VariantValue::Value(v) => f.write_str(v),
            VariantValue::Set(set) => {
                let joined: Vec<&str> = set.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

/// Dependency type of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepType {
    /// Needed while building the dependent.
    Build,
    /// Linked into the dependent.
    Link,
    /// Needed at run time.
    Run,
    /// Needed only while compiling (headers, code generators).
    CompileTime,
}

impl DepType {
    /// All dependency types, in canonical order.
    pub const ALL: [DepType; 4] = [
        DepType::Build,
        DepType::Link,
        DepType::Run,
        DepType::CompileTime,
    ];

    fn as_str(self) -> &'static str {
        match self {
            DepType::Build => "build",
            DepType::Link => "link",
            DepType::Run => "run",
            DepType::CompileTime => "compile-time",
        }
    }
}

impl fmt::Display for DepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`DepType`]s carried by one edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepTypes(BTreeSet<DepType>);

impl DepTypes {
    /// `build` and `link`, the usual type of a library dependency.
    pub fn build_link() -> Self {
        Self([DepType::Build, DepType::Link].into_iter().collect())
    }

    /// Only `build`.
    pub fn build() -> Self {
        Self([DepType::Build].into_iter().collect())
    }

    /// Parse a comma separated list such as `build,link`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut set = BTreeSet::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let ty = DepType::ALL.into_iter().find(|t| t.as_str() == part)?;
            set.insert(ty);
        }
        (!set.is_empty()).then_some(Self(set))
    }

    /// Add every type of `other`.
    pub fn merge(&mut self, other: &DepTypes) {
        self.0.extend(other.0.iter().copied());
    }

    /// Whether `ty` is part of the set.
    pub fn contains(&self, ty: DepType) -> bool {
        self.0.contains(&ty)
    }

    /// Iterate in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = DepType> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for DepTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|t| t.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

/// How a dependency constraint relates to the spec carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// `%name` — a direct dependency. A non-empty language list
    /// (`%c,cxx=gcc`) restricts the constraint to the providers of those
    /// languages.
    Direct {
        /// Languages the dependency must provide for this node.
        languages: Vec<String>,
    },
    /// `^name` — anywhere below this node.
    Transitive,
}

/// A constraint on a dependency of a [`Spec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyConstraint {
    /// Direct or transitive.
    pub kind: DependencyKind,
    /// The constrained dependency; always named.
    pub spec: Spec,
}

impl DependencyConstraint {
    /// The dependency's package name.
    pub fn name(&self) -> &str {
        self.spec.name.as_deref().unwrap_or_default()
    }
}

/// An abstract (possibly partial) package specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Spec {
    /// Package or virtual name; `None` for anonymous predicates.
    pub name: Option<String>,
    /// Version constraint (any when empty).
    pub versions: VersionConstraint,
    /// Requested variant values.
    pub variants: BTreeMap<String, VariantValue>,
    /// Requested target architecture.
    pub target: Option<String>,
    /// Constraints on dependencies, in the order they were written.
    pub dependencies: Vec<DependencyConstraint>,
}

impl Spec {
    /// A spec that only names a package.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Parse a single spec from the request grammar.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        parse_spec(text)
    }

    /// The spec without dependency constraints.
    pub fn self_part(&self) -> Spec {
        Spec {
            dependencies: Vec::new(),
            ..self.clone()
        }
    }

    /// Whether the spec constrains anything besides the name.
    pub fn is_unconstrained(&self) -> bool {
        self.versions.is_any()
            && self.variants.is_empty()
            && self.target.is_none()
            && self.dependencies.is_empty()
    }

    /// Whether any dependency constraint is present.
    pub fn has_dependency_constraints(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Direct (`%`) dependency constraints.
    pub fn direct_dependencies(&self) -> impl Iterator<Item = &DependencyConstraint> {
        self.dependencies
            .iter()
            .filter(|d| matches!(d.kind, DependencyKind::Direct { .. }))
    }

    /// Transitive (`^`) dependency constraints.
    pub fn transitive_dependencies(&self) -> impl Iterator<Item = &DependencyConstraint> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Transitive)
    }

    /// Depth-first traversal of this spec and every nested dependency spec,
    /// starting with `self`.
    pub fn traverse(&self) -> Vec<&Spec> {
        let mut out = vec![self];
        let mut stack: Vec<&Spec> = self.dependencies.iter().rev().map(|d| &d.spec).collect();
        while let Some(spec) = stack.pop() {
            out.push(spec);
            stack.extend(spec.dependencies.iter().rev().map(|d| &d.spec));
        }
        out
    }

    /// Whether the node attributes satisfy the self part of this spec
    /// (name, versions, variants, target). Dependency constraints are not
    /// checked here.
    pub fn self_matches(
        &self,
        name: &str,
        version: &Version,
        variants: &BTreeMap<String, VariantValue>,
        target: &str,
    ) -> bool {
        if self.name.as_deref().is_some_and(|n| n != name) {
            return false;
        }
        if !self.versions.matches(version) {
            return false;
        }
        if self.target.as_deref().is_some_and(|t| t != target) {
            return false;
        }
        self.variants.iter().all(|(variant, wanted)| {
            variants
                .get(variant)
                .is_some_and(|have| wanted.satisfied_by(have))
        })
    }

    fn fmt_self(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut head = String::new();
        if let Some(name) = &self.name {
            head.push_str(name);
        }
        if !self.versions.is_any() {
            head.push_str(&format!("@{}", self.versions));
        }
        for (name, value) in &self.variants {
            if let VariantValue::Bool(on) = value {
                head.push(if *on { '+' } else { '~' });
                head.push_str(name);
            }
        }
        let mut words = Vec::new();
        if !head.is_empty() {
            words.push(head);
        }
        for (name, value) in &self.variants {
            if !matches!(value, VariantValue::Bool(_)) {
                words.push(format!("{name}={value}"));
            }
        }
        if let Some(target) = &self.target {
            words.push(format!("target={target}"));
        }
        for dep in self.direct_dependencies() {
            let langs = match &dep.kind {
                DependencyKind::Direct { languages } if !languages.is_empty() => {
                    format!("{}=", languages.join(","))
                }
                _ => String::new(),
            };
            words.push(format!("%{langs}{}", SelfPart(&dep.spec)));
        }
        f.write_str(&words.join(" "))
    }

    fn fmt_transitive(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dep in &self.dependencies {
            if dep.kind == DependencyKind::Transitive {
                write!(f, " ^{}", SelfPart(&dep.spec))?;
            }
            dep.spec.fmt_transitive(f)?;
        }
        Ok(())
    }
}

struct SelfPart<'a>(&'a Spec);

impl fmt::Display for SelfPart<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_self(f)
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Nested transitive constraints are written flat, like the grammar.
        self.fmt_self(f)?;
        self.fmt_transitive(f)
    }
}

impl FromStr for Spec {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_spec(s)
    }
}

impl Serialize for Spec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Spec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_spec(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Spec {
        Spec::parse(text).unwrap()
    }

    fn variants(pairs: &[(&str, VariantValue)]) -> BTreeMap<String, VariantValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn multi_valued_request_is_subset() {
        let want = VariantValue::from_assignment("sm_70,sm_80");
        let have = VariantValue::from_assignment("sm_70,sm_80,sm_90");
        assert!(want.satisfied_by(&have));
        assert!(!have.satisfied_by(&want));
    }

    #[test]
    fn boolean_request_needs_boolean_value() {
        assert!(!VariantValue::Bool(true).satisfied_by(&VariantValue::Value("true".into())));
    }

    #[test]
    fn self_matches_checks_every_attribute() {
        let spec = s("zlib@1.2: +shared target=x86_64");
        let version = Version::parse("1.3").unwrap();
        let vars = variants(&[("shared", VariantValue::Bool(true))]);
        assert!(spec.self_matches("zlib", &version, &vars, "x86_64"));
        assert!(!spec.self_matches("zlib", &version, &vars, "aarch64"));
        assert!(!spec.self_matches("bzip2", &version, &vars, "x86_64"));
        let off = variants(&[("shared", VariantValue::Bool(false))]);
        assert!(!spec.self_matches("zlib", &version, &off, "x86_64"));
    }

    #[test]
    fn anonymous_spec_matches_any_name() {
        let spec = s("@2:");
        let version = Version::parse("2.1").unwrap();
        assert!(spec.self_matches("anything", &version, &BTreeMap::new(), "x86_64"));
    }

    #[test]
    fn traverse_visits_nested_specs() {
        let spec = s("hdf5 %gcc@12 ^mpich@4 %clang ^zlib");
        let names: Vec<_> = spec
            .traverse()
            .iter()
            .map(|s| s.name.clone().unwrap())
            .collect();
        assert_eq!(names, ["hdf5", "gcc", "mpich", "clang", "zlib"]);
    }

    #[test]
    fn dep_types_parse() {
        let types = DepTypes::parse("build, link").unwrap();
        assert!(types.contains(DepType::Build));
        assert!(types.contains(DepType::Link));
        assert!(!types.contains(DepType::Run));
        assert!(DepTypes::parse("bogus").is_none());
    }
}
