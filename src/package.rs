//! Static package definitions.
//!
//! A [`PackageDef`] is what a package recipe declares about itself: the
//! versions it knows, its variants with their domains and defaults,
//! conditional dependencies, conflicts, the virtuals it provides and any
//! requirements it places on its own configuration. Definitions are built
//! with [`PackageBuilder`], which validates them.

use std::collections::{BTreeMap, BTreeSet};

use crate::spec::{DepTypes, Spec, VariantValue};
use crate::version::Version;

/// One known version of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDecl {
    /// The version.
    pub version: Version,
    /// Ordered before every non-preferred version.
    pub preferred: bool,
    /// Ordered last and only used when deprecated versions are allowed.
    pub deprecated: bool,
}

/// Allowed values of a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDomain {
    /// `true` or `false`.
    Bool,
    /// Exactly one of the listed values.
    Single(Vec<String>),
    /// Any non-empty subset of the listed values.
    Multi(Vec<String>),
    /// Any string.
    Free,
}

/// Why a variant value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValue {
    /// Human readable description of the domain.
    pub allowed: String,
}

/// Subsets of a multi-valued variant are enumerated exhaustively up to this
/// many values.
const MAX_EXHAUSTIVE_MULTI: usize = 6;

impl VariantDomain {
    /// Check that `value` lies in the domain.
    pub fn validate(&self, value: &VariantValue) -> Result<(), InvalidValue> {
        let ok = match (self, value) {
            (VariantDomain::Bool, VariantValue::Bool(_)) => true,
            (VariantDomain::Single(values), VariantValue::Value(v)) => values.contains(v),
            (VariantDomain::Multi(values), VariantValue::Value(v)) => values.contains(v),
            (VariantDomain::Multi(values), VariantValue::Set(set)) => {
                !set.is_empty() && set.iter().all(|v| values.contains(v))
            }
            (VariantDomain::Free, VariantValue::Value(_)) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(InvalidValue {
                allowed: self.describe(),
            })
        }
    }

    fn describe(&self) -> String {
        match self {
            VariantDomain::Bool => "true, false".to_string(),
            VariantDomain::Single(values) => values.join(", "),
            VariantDomain::Multi(values) => format!("any non-empty subset of {}", values.join(", ")),
            VariantDomain::Free => "any value".to_string(),
        }
    }

    /// Values a solver may assign, given the default and the values that
    /// requests and policies mention for this variant. The default comes
    /// first.
    pub fn candidates(&self, default: &VariantValue, mentioned: &BTreeSet<String>) -> Vec<VariantValue> {
        let mut out = vec![default.clone()];
        let mut push = |value: VariantValue| {
            if !out.contains(&value) {
                out.push(value);
            }
        };
        match self {
            VariantDomain::Bool => {
                push(VariantValue::Bool(false));
                push(VariantValue::Bool(true));
            }
            VariantDomain::Single(values) => {
                for v in values {
                    push(VariantValue::Value(v.clone()));
                }
            }
            VariantDomain::Multi(values) if values.len() <= MAX_EXHAUSTIVE_MULTI => {
                for mask in 1u32..(1 << values.len()) {
                    let subset: BTreeSet<String> = values
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(_, v)| v.clone())
                        .collect();
                    push(multi_value(subset));
                }
            }
            VariantDomain::Multi(values) => {
                for v in values {
                    push(VariantValue::Value(v.clone()));
                }
                let wanted: BTreeSet<String> = mentioned
                    .iter()
                    .filter(|v| values.contains(v))
                    .cloned()
                    .collect();
                if !wanted.is_empty() {
                    push(multi_value(wanted));
                }
            }
            VariantDomain::Free => {
                for v in mentioned {
                    push(VariantValue::Value(v.clone()));
                }
            }
        }
        out
    }
}

/// Canonical form of a multi-valued assignment: a single value is stored
/// as [`VariantValue::Value`].
pub fn multi_value(mut set: BTreeSet<String>) -> VariantValue {
    if set.len() == 1 {
        if let Some(only) = set.pop_first() {
            return VariantValue::Value(only);
        }
    }
    VariantValue::Set(set)
}

/// A declared variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDecl {
    /// Allowed values.
    pub domain: VariantDomain,
    /// Value used when nothing asks for another one.
    pub default: VariantValue,
}

/// A conditional dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDecl {
    /// The dependency (package or virtual) and the constraints on it.
    pub spec: Spec,
    /// Edge types.
    pub types: DepTypes,
    /// Active only when the depending node matches this predicate.
    pub when: Option<Spec>,
}

impl DependencyDecl {
    /// Name of the dependency.
    pub fn name(&self) -> &str {
        self.spec.name.as_deref().unwrap_or_default()
    }
}

/// A configuration that must never occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDecl {
    /// Predicate over the node and at most one of its dependencies.
    pub spec: Spec,
    /// Explanation shown when the conflict rules something out.
    pub message: Option<String>,
}

/// A virtual provided by the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideDecl {
    /// Virtual name, for example `c` or `mpi`.
    pub virtual_name: String,
    /// Provided only when the node matches this predicate.
    pub when: Option<Spec>,
}

/// A requirement the package places on its own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequireDecl {
    /// Predicate that must hold.
    pub spec: Spec,
    /// Applies only when the node matches this predicate.
    pub when: Option<Spec>,
    /// Explanation shown when the requirement rules something out.
    pub message: Option<String>,
}

/// Everything a package recipe declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDef {
    /// Package name.
    pub name: String,
    /// Known versions, in declaration order.
    pub versions: Vec<VersionDecl>,
    /// Declared variants by name.
    pub variants: BTreeMap<String, VariantDecl>,
    /// Conditional dependencies.
    pub dependencies: Vec<DependencyDecl>,
    /// Conflicts.
    pub conflicts: Vec<ConflictDecl>,
    /// Provided virtuals.
    pub provides: Vec<ProvideDecl>,
    /// Requirements on the package's own configuration.
    pub requires: Vec<RequireDecl>,
}

impl PackageDef {
    /// Start building a definition.
    pub fn builder(name: impl Into<String>) -> PackageBuilder {
        PackageBuilder::new(name)
    }

    /// Look up a declared variant.
    pub fn variant(&self, name: &str) -> Option<&VariantDecl> {
        self.variants.get(name)
    }

    /// Whether every variant the spec mentions is declared here.
    pub fn declares_variants_of(&self, spec: &Spec) -> bool {
        spec.variants.keys().all(|v| self.variants.contains_key(v))
    }

    /// Default value of every variant.
    pub fn default_variants(&self) -> BTreeMap<String, VariantValue> {
        self.variants
            .iter()
            .map(|(name, decl)| (name.clone(), decl.default.clone()))
            .collect()
    }

    /// Virtual names this package may provide under some configuration.
    pub fn provided_virtuals(&self) -> impl Iterator<Item = &str> {
        self.provides.iter().map(|p| p.virtual_name.as_str())
    }

    /// Names of every package or virtual this definition may depend on.
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.dependencies.iter().map(|d| d.name()).collect();
        for require in &self.requires {
            names.extend(require.spec.traverse().into_iter().skip(1).filter_map(|s| s.name.as_deref()));
        }
        names
    }
}

/// Error raised for an inconsistent package definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("package '{package}': {message}")]
pub struct DefinitionError {
    /// Offending package.
    pub package: String,
    /// What is wrong.
    pub message: String,
}

/// Incremental builder for [`PackageDef`].
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    def: PackageDef,
    errors: Vec<String>,
}

impl PackageBuilder {
    /// Start a definition for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: PackageDef {
                name: name.into(),
                versions: Vec::new(),
                variants: BTreeMap::new(),
                dependencies: Vec::new(),
                conflicts: Vec::new(),
                provides: Vec::new(),
                requires: Vec::new(),
            },
            errors: Vec::new(),
        }
    }

    fn spec(&mut self, text: &str) -> Option<Spec> {
        match Spec::parse(text) {
            Ok(spec) => Some(spec),
            Err(e) => {
                self.errors.push(format!("'{text}': {e}"));
                None
            }
        }
    }

    fn when(&mut self, text: Option<&str>) -> Option<Spec> {
        let spec = self.spec(text?)?;
        if spec.has_dependency_constraints() {
            self.errors
                .push(format!("condition '{spec}' may only constrain the package itself"));
        }
        Some(spec)
    }

    fn push_version(&mut self, text: &str, preferred: bool, deprecated: bool) -> &mut Self {
        match Version::parse(text) {
            Ok(version) => self.def.versions.push(VersionDecl {
                version,
                preferred,
                deprecated,
            }),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Declare a version.
    pub fn version(mut self, text: &str) -> Self {
        self.push_version(text, false, false);
        self
    }

    /// Declare a version ordered before all others.
    pub fn preferred_version(mut self, text: &str) -> Self {
        self.push_version(text, true, false);
        self
    }

    /// Declare a deprecated version.
    pub fn deprecated_version(mut self, text: &str) -> Self {
        self.push_version(text, false, true);
        self
    }

    /// Declare a version with explicit flags.
    pub fn version_with(mut self, text: &str, preferred: bool, deprecated: bool) -> Self {
        self.push_version(text, preferred, deprecated);
        self
    }

    /// Declare a boolean variant.
    pub fn bool_variant(mut self, name: &str, default: bool) -> Self {
        self.def.variants.insert(
            name.to_string(),
            VariantDecl {
                domain: VariantDomain::Bool,
                default: VariantValue::Bool(default),
            },
        );
        self
    }

    /// Declare a single-valued variant.
    pub fn value_variant(mut self, name: &str, values: &[&str], default: &str) -> Self {
        let domain = VariantDomain::Single(values.iter().map(|v| v.to_string()).collect());
        self.insert_variant(name, domain, VariantValue::Value(default.to_string()));
        self
    }

    /// Declare a multi-valued variant; `default` is a comma separated list.
    pub fn multi_variant(mut self, name: &str, values: &[&str], default: &str) -> Self {
        let domain = VariantDomain::Multi(values.iter().map(|v| v.to_string()).collect());
        let default = multi_value(default.split(',').filter(|v| !v.is_empty()).map(str::to_string).collect());
        self.insert_variant(name, domain, default);
        self
    }

    /// Declare a free-form variant.
    pub fn free_variant(mut self, name: &str, default: &str) -> Self {
        self.insert_variant(name, VariantDomain::Free, VariantValue::Value(default.to_string()));
        self
    }

    fn insert_variant(&mut self, name: &str, domain: VariantDomain, default: VariantValue) {
        if let Err(e) = domain.validate(&default) {
            self.errors.push(format!(
                "default '{default}' of variant '{name}' is not one of: {}",
                e.allowed
            ));
        }
        self.def
            .variants
            .insert(name.to_string(), VariantDecl { domain, default });
    }

    /// Declare an unconditional `build,link` dependency.
    pub fn depends_on(self, spec: &str) -> Self {
        self.depends_on_with(spec, DepTypes::build_link(), None)
    }

    /// Declare a `build,link` dependency active when `when` holds.
    pub fn depends_on_when(self, spec: &str, when: &str) -> Self {
        self.depends_on_with(spec, DepTypes::build_link(), Some(when))
    }

    /// Declare a dependency with explicit types and condition.
    pub fn depends_on_with(mut self, spec: &str, types: DepTypes, when: Option<&str>) -> Self {
        let when = self.when(when);
        if let Some(spec) = self.spec(spec) {
            if spec.name.is_none() {
                self.errors.push(format!("dependency '{spec}' has no name"));
            } else if spec.has_dependency_constraints() {
                self.errors
                    .push(format!("dependency '{spec}' may not constrain its own dependencies"));
            } else {
                self.def.dependencies.push(DependencyDecl { spec, types, when });
            }
        }
        self
    }

    /// Declare a conflict.
    pub fn conflicts(self, spec: &str) -> Self {
        self.conflicts_with(spec, None, None)
    }

    /// Declare a conditional conflict with an optional message. The
    /// condition is folded into the conflict predicate.
    pub fn conflicts_with(mut self, spec: &str, when: Option<&str>, message: Option<&str>) -> Self {
        let Some(mut spec) = self.spec(spec) else {
            return self;
        };
        if let Some(when) = when.and_then(|w| self.spec(w)) {
            spec = merge_predicates(spec, when);
        }
        if spec.name.as_deref().is_some_and(|n| n != self.def.name) {
            self.errors
                .push(format!("conflict '{spec}' must describe the package itself"));
        }
        if spec.dependencies.len() > 1 {
            self.errors
                .push(format!("conflict '{spec}' may constrain at most one dependency"));
        }
        self.def.conflicts.push(ConflictDecl {
            spec,
            message: message.map(str::to_string),
        });
        self
    }

    /// Declare a provided virtual.
    pub fn provides(self, virtual_name: &str) -> Self {
        self.provides_when(virtual_name, None)
    }

    /// Declare a virtual provided under a condition.
    pub fn provides_when(mut self, virtual_name: &str, when: Option<&str>) -> Self {
        let when = self.when(when);
        self.def.provides.push(ProvideDecl {
            virtual_name: virtual_name.to_string(),
            when,
        });
        self
    }

    /// Declare a requirement on the package's own configuration.
    pub fn requires(mut self, spec: &str, when: Option<&str>, message: Option<&str>) -> Self {
        let when = self.when(when);
        if let Some(spec) = self.spec(spec) {
            self.def.requires.push(RequireDecl {
                spec,
                when,
                message: message.map(str::to_string),
            });
        }
        self
    }

    /// Finish the definition, reporting the first problem found.
    pub fn build(self) -> Result<PackageDef, DefinitionError> {
        let package = self.def.name.clone();
        let fail = |message: String| DefinitionError {
            package: package.clone(),
            message,
        };
        if let Some(first) = self.errors.into_iter().next() {
            return Err(fail(first));
        }
        if self.def.versions.is_empty() {
            return Err(fail("no versions declared".to_string()));
        }
        let mut seen = BTreeSet::new();
        for decl in &self.def.versions {
            if !seen.insert(&decl.version) {
                return Err(fail(format!("version {} declared twice", decl.version)));
            }
        }
        for spec in self.def.referenced_self_specs() {
            for (variant, value) in &spec.variants {
                let Some(decl) = self.def.variants.get(variant) else {
                    return Err(fail(format!("'{spec}' refers to undeclared variant '{variant}'")));
                };
                if let Err(e) = decl.domain.validate(value) {
                    return Err(fail(format!(
                        "'{spec}': value '{value}' of '{variant}' is not one of: {}",
                        e.allowed
                    )));
                }
            }
        }
        Ok(self.def)
    }
}

impl PackageDef {
    /// Predicates evaluated against this package's own attributes.
    fn referenced_self_specs(&self) -> Vec<Spec> {
        let mut out = Vec::new();
        out.extend(self.dependencies.iter().filter_map(|d| d.when.clone()));
        out.extend(self.provides.iter().filter_map(|p| p.when.clone()));
        out.extend(self.conflicts.iter().map(|c| c.spec.self_part()));
        for require in &self.requires {
            out.push(require.spec.self_part());
            out.extend(require.when.clone());
        }
        out
    }
}

/// Combine two predicates over the same node into their conjunction.
///
/// Version constraints are intersected only when one side is unconstrained;
/// otherwise `extra`'s versions win over `base`'s, which callers avoid by
/// keeping version ranges on a single side.
pub fn merge_predicates(mut base: Spec, extra: Spec) -> Spec {
    if base.name.is_none() {
        base.name = extra.name;
    }
    if base.versions.is_any() {
        base.versions = extra.versions;
    }
    for (k, v) in extra.variants {
        base.variants.entry(k).or_insert(v);
    }
    if base.target.is_none() {
        base.target = extra.target;
    }
    base.dependencies.extend(extra.dependencies);
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_declarations() {
        let def = PackageDef::builder("hdf5")
            .version("1.14.3")
            .preferred_version("1.12.2")
            .deprecated_version("1.8.0")
            .bool_variant("mpi", true)
            .value_variant("api", &["default", "v18", "v110"], "default")
            .depends_on_when("mpi", "+mpi")
            .depends_on_with("cmake@3.18:", DepTypes::build(), None)
            .conflicts_with("%clang", Some("@1.8"), Some("old releases need gcc"))
            .build()
            .unwrap();
        assert_eq!(def.versions.len(), 3);
        assert!(def.versions[1].preferred);
        assert!(def.versions[2].deprecated);
        assert_eq!(def.dependency_names(), ["cmake", "mpi"].into_iter().collect());
        let conflict = &def.conflicts[0];
        assert_eq!(conflict.spec.direct_dependencies().count(), 1);
        assert!(!conflict.spec.versions.is_any());
    }

    #[test]
    fn builder_rejects_bad_definitions() {
        let no_versions = PackageDef::builder("zlib").build();
        assert!(no_versions.is_err());

        let undeclared = PackageDef::builder("zlib")
            .version("1.3")
            .depends_on_when("cmake", "+shared")
            .build()
            .unwrap_err();
        assert!(undeclared.message.contains("undeclared variant 'shared'"));

        let bad_default = PackageDef::builder("zlib")
            .version("1.3")
            .value_variant("level", &["1", "9"], "5")
            .build();
        assert!(bad_default.is_err());

        let unnamed = PackageDef::builder("zlib").version("1.3").depends_on("@1.2").build();
        assert!(unnamed.is_err());
    }

    #[test]
    fn domain_validation() {
        let multi = VariantDomain::Multi(vec!["70".into(), "80".into(), "90".into()]);
        assert!(multi.validate(&VariantValue::from_assignment("70,90")).is_ok());
        assert!(multi.validate(&VariantValue::from_assignment("70,75")).is_err());
        assert!(VariantDomain::Bool.validate(&VariantValue::Value("on".into())).is_err());
        assert!(VariantDomain::Free.validate(&VariantValue::Value("/opt".into())).is_ok());
    }

    #[test]
    fn candidates_start_with_default() {
        let none = BTreeSet::new();
        let bools = VariantDomain::Bool.candidates(&VariantValue::Bool(true), &none);
        assert_eq!(bools, [VariantValue::Bool(true), VariantValue::Bool(false)]);

        let multi = VariantDomain::Multi(vec!["a".into(), "b".into()]);
        let subsets = multi.candidates(&VariantValue::Value("a".into()), &none);
        assert_eq!(subsets.len(), 3);
        assert_eq!(subsets[0], VariantValue::Value("a".into()));

        let mentioned: BTreeSet<String> = ["/opt".to_string()].into();
        let free = VariantDomain::Free.candidates(&VariantValue::Value(String::new()), &mentioned);
        assert_eq!(free.len(), 2);
    }
}
