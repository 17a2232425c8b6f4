//! Arena-based pool mapping resolvo IDs to search-space values.
//!
//! [`SpacePool`] provides the storage that backs every resolvo identifier
//! ([`NameId`], [`SolvableId`], [`VersionSetId`], etc.). Solvables are the
//! configurations of the search space, numbered identically, and version
//! sets are node matchers, optionally inverted.

use std::collections::HashMap;
use std::fmt;

use resolvo::{ArenaId, NameId, SolvableId, StringId, VersionSetId, VersionSetUnionId};

use crate::space::{ConfigId, NodeMatcher};

/// A version set: the configurations a matcher selects, or (inverted)
/// every configuration it does not.
///
/// Forbidding nodes goes through resolvo's `constrains`, which keeps
/// candidates matching the set. An inverted set therefore keeps exactly
/// the nodes the matcher does not select.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatcherSet {
    /// The matcher.
    pub matcher: NodeMatcher,
    /// Select the complement.
    pub inverted: bool,
}

impl fmt::Display for MatcherSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "not {}", self.matcher)
        } else {
            write!(f, "{}", self.matcher)
        }
    }
}

/// Arena-based storage for all resolvo-interned objects.
///
/// Every resolvo ID type is backed by a `Vec` here, indexed by the ID's
/// inner `usize`. Reverse-lookup `HashMap`s prevent duplicate interning.
#[derive(Default)]
pub struct SpacePool {
    // NameId arena
    pub(crate) names: Vec<String>,
    pub(crate) names_rev: HashMap<String, NameId>,

    // SolvableId arena
    pub(crate) solvable_names: Vec<NameId>,

    // VersionSetId arena
    pub(crate) version_sets: Vec<MatcherSet>,
    pub(crate) version_set_names: Vec<NameId>,
    pub(crate) version_sets_rev: HashMap<MatcherSet, VersionSetId>,

    // VersionSetUnionId arena
    pub(crate) version_set_unions: Vec<Vec<VersionSetId>>,

    // StringId arena
    pub(crate) strings: Vec<String>,
    pub(crate) strings_rev: HashMap<String, StringId>,
}

impl SpacePool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    // --- NameId ---

    /// Intern a package name, returning the existing ID if already interned.
    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.names_rev.get(name) {
            return id;
        }
        let id = NameId::from_usize(self.names.len());
        self.names_rev.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }

    /// Look up the package name for a [`NameId`].
    pub fn resolve_name(&self, id: NameId) -> &str {
        &self.names[id.to_usize()]
    }

    /// Look up an already interned name.
    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.names_rev.get(name).copied()
    }

    // --- SolvableId ---

    /// Add the solvable for the next configuration.
    pub fn intern_solvable(&mut self, name_id: NameId) -> SolvableId {
        let id = SolvableId::from_usize(self.solvable_names.len());
        self.solvable_names.push(name_id);
        id
    }

    /// Look up the [`NameId`] for a [`SolvableId`].
    pub fn solvable_name(&self, id: SolvableId) -> NameId {
        self.solvable_names[id.to_usize()]
    }

    /// Number of solvables.
    pub fn solvable_count(&self) -> usize {
        self.solvable_names.len()
    }

    // --- VersionSetId ---

    /// Intern a matcher set, deduplicating by value.
    pub fn intern_version_set(&mut self, name_id: NameId, set: MatcherSet) -> VersionSetId {
        if let Some(&id) = self.version_sets_rev.get(&set) {
            return id;
        }
        let id = VersionSetId::from_usize(self.version_sets.len());
        self.version_sets_rev.insert(set.clone(), id);
        self.version_sets.push(set);
        self.version_set_names.push(name_id);
        id
    }

    /// Look up the matcher set for a [`VersionSetId`].
    pub fn resolve_version_set(&self, id: VersionSetId) -> &MatcherSet {
        &self.version_sets[id.to_usize()]
    }

    /// Look up the [`NameId`] for a [`VersionSetId`].
    pub fn version_set_name(&self, id: VersionSetId) -> NameId {
        self.version_set_names[id.to_usize()]
    }

    /// Return the number of interned version sets.
    pub fn version_set_count(&self) -> usize {
        self.version_sets.len()
    }

    // --- VersionSetUnionId ---

    /// Intern a union (OR) of version sets.
    pub fn intern_version_set_union(&mut self, sets: Vec<VersionSetId>) -> VersionSetUnionId {
        let id = VersionSetUnionId::from_usize(self.version_set_unions.len());
        self.version_set_unions.push(sets);
        id
    }

    /// Look up the version sets in a union.
    pub fn resolve_version_set_union(&self, id: VersionSetUnionId) -> &[VersionSetId] {
        &self.version_set_unions[id.to_usize()]
    }

    // --- StringId ---

    /// Intern a string (used for exclusion reasons in solver messages).
    pub fn intern_string(&mut self, s: String) -> StringId {
        if let Some(&id) = self.strings_rev.get(&s) {
            return id;
        }
        let id = StringId::from_usize(self.strings.len());
        self.strings_rev.insert(s.clone(), id);
        self.strings.push(s);
        id
    }

    /// Look up an interned string.
    pub fn resolve_string(&self, id: StringId) -> &str {
        &self.strings[id.to_usize()]
    }
}

/// Solvable of a configuration; both are numbered identically.
pub fn solvable_of(id: ConfigId) -> SolvableId {
    SolvableId::from_usize(id.index())
}

/// Configuration of a solvable.
pub fn config_of(id: SolvableId) -> ConfigId {
    ConfigId::from_index(id.to_usize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_name_roundtrip() {
        let mut pool = SpacePool::new();
        let id = pool.intern_name("zlib");
        assert_eq!(pool.resolve_name(id), "zlib");
        assert_eq!(pool.lookup_name("zlib"), Some(id));
        assert_eq!(pool.lookup_name("cmake"), None);
    }

    #[test]
    fn intern_name_dedup() {
        let mut pool = SpacePool::new();
        let id1 = pool.intern_name("zlib");
        let id2 = pool.intern_name("zlib");
        assert_eq!(id1, id2);
        assert_ne!(id1, pool.intern_name("cmake"));
    }

    #[test]
    fn solvables_follow_configurations() {
        let mut pool = SpacePool::new();
        let name = pool.intern_name("zlib");
        let first = pool.intern_solvable(name);
        let second = pool.intern_solvable(name);
        assert_eq!(config_of(second), ConfigId::from_index(1));
        assert_eq!(solvable_of(ConfigId::from_index(0)), first);
        assert_eq!(pool.solvable_name(second), name);
        assert_eq!(pool.solvable_count(), 2);
    }

    #[test]
    fn intern_version_set_dedup() {
        let mut pool = SpacePool::new();
        let name = pool.intern_name("zlib");
        let set = MatcherSet {
            matcher: NodeMatcher::named("zlib"),
            inverted: false,
        };
        let id1 = pool.intern_version_set(name, set.clone());
        let id2 = pool.intern_version_set(name, set.clone());
        assert_eq!(id1, id2);
        let inverted = pool.intern_version_set(
            name,
            MatcherSet {
                inverted: true,
                ..set
            },
        );
        assert_ne!(id1, inverted);
        assert_eq!(pool.version_set_count(), 2);
        assert_eq!(pool.resolve_version_set(inverted).to_string(), "not zlib");
    }

    #[test]
    fn intern_string_roundtrip() {
        let mut pool = SpacePool::new();
        let id = pool.intern_string("deprecated".into());
        assert_eq!(pool.resolve_string(id), "deprecated");
        assert_eq!(pool.intern_string("deprecated".into()), id);
    }
}
