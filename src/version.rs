//! Version literals, their total order, and version constraints.
//!
//! A [`Version`] is split into components on `.`, `-` and `_`, and at every
//! boundary between digits and letters (`1.2rc3` is `1 . 2 . rc . 3`).
//! Components compare as follows:
//!
//! | Left | Right | Result |
//! |------|-------|--------|
//! | number | number | numeric comparison |
//! | word | number | word is older |
//! | word | word | lexical comparison |
//! | `develop`, `main`, ... | anything else | the branch name is newer |
//!
//! When one version is a component prefix of the other, the shorter one is
//! older (`1.2 < 1.2.1`).
//!
//! A [`VersionConstraint`] is a union of [`VersionRange`]s written
//! `1.2`, `=1.2`, `1.2:1.4`, `1.2:`, `:1.4` or a comma separated list of
//! those. An empty constraint matches any version.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Branch-like version names that sort after every numbered release,
/// newest first.
const INFINITY_VERSIONS: &[&str] = &["develop", "main", "master", "head", "trunk", "stable"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Component {
    Number(u64),
    Word(String),
    Branch(usize),
}

impl Component {
    fn class(&self) -> u8 {
        match self {
            Component::Word(_) => 0,
            Component::Number(_) => 1,
            Component::Branch(_) => 2,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Number(a), Component::Number(b)) => a.cmp(b),
            (Component::Word(a), Component::Word(b)) => a.cmp(b),
            // Lower index in INFINITY_VERSIONS is newer.
            (Component::Branch(a), Component::Branch(b)) => b.cmp(a),
            _ => self.class().cmp(&other.class()),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A concrete version literal such as `1.2.3`, `2.0rc1` or `develop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    text: String,
    components: Vec<Component>,
}

/// Error produced when a version or version constraint cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{text}': {reason}")]
pub struct VersionError {
    /// The rejected input.
    pub text: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl Version {
    /// Parse a version literal.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let err = |reason| VersionError {
            text: text.to_string(),
            reason,
        };
        if text.is_empty() {
            return Err(err("empty version"));
        }
        let mut components = Vec::new();
        for segment in text.split(['.', '-', '_']) {
            if segment.is_empty() {
                return Err(err("empty version component"));
            }
            if let Some(idx) = INFINITY_VERSIONS.iter().position(|b| *b == segment) {
                components.push(Component::Branch(idx));
                continue;
            }
            let mut rest = segment;
            while !rest.is_empty() {
                let digits = rest.starts_with(|c: char| c.is_ascii_digit());
                let end = rest
                    .find(|c: char| c.is_ascii_digit() != digits)
                    .unwrap_or(rest.len());
                let (run, tail) = rest.split_at(end);
                if digits {
                    let n = run.parse::<u64>().map_err(|_| err("numeric component overflows"))?;
                    components.push(Component::Number(n));
                } else if run.chars().all(|c| c.is_ascii_alphabetic()) {
                    components.push(Component::Word(run.to_ascii_lowercase()));
                } else {
                    return Err(err("unexpected character"));
                }
                rest = tail;
            }
        }
        Ok(Self {
            text: text.to_string(),
            components,
        })
    }

    /// The literal as it was written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether every component of `self` is a leading component of `other`.
    ///
    /// `1.2` is a prefix of `1.2` and `1.2.7`, but not of `1.20`.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.text
    }
}

/// One alternative of a [`VersionConstraint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionRange {
    /// `=1.2` — exactly this version.
    Exact(Version),
    /// `1.2` — this version or any version it is a component prefix of.
    Prefix(Version),
    /// `1.2:1.4`, `1.2:`, `:1.4` — inclusive bounds; the upper bound also
    /// admits every version it is a prefix of (`:1.4` admits `1.4.9`).
    Between {
        /// Inclusive lower bound.
        low: Option<Version>,
        /// Inclusive, prefix-extended upper bound.
        high: Option<Version>,
    },
}

impl VersionRange {
    fn parse(text: &str) -> Result<Self, VersionError> {
        if let Some(exact) = text.strip_prefix('=') {
            return Ok(VersionRange::Exact(Version::parse(exact)?));
        }
        match text.split_once(':') {
            Some((low, high)) => {
                let bound = |s: &str| -> Result<Option<Version>, VersionError> {
                    if s.is_empty() {
                        Ok(None)
                    } else {
                        Version::parse(s).map(Some)
                    }
                };
                Ok(VersionRange::Between {
                    low: bound(low)?,
                    high: bound(high)?,
                })
            }
            None => Ok(VersionRange::Prefix(Version::parse(text)?)),
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::Exact(v) => write!(f, "={v}"),
            VersionRange::Prefix(v) => write!(f, "{v}"),
            VersionRange::Between { low, high } => {
                if let Some(low) = low {
                    write!(f, "{low}")?;
                }
                write!(f, ":")?;
                if let Some(high) = high {
                    write!(f, "{high}")?;
                }
                Ok(())
            }
        }
    }
}

/// Test whether `candidate` lies in `range`.
///
/// | Range | Matches |
/// |-------|---------|
/// | `=1.2` | exactly `1.2` |
/// | `1.2` | `1.2`, `1.2.0`, `1.2.5.1`, not `1.20` |
/// | `1.2:` | `1.2` and everything newer |
/// | `:1.4` | everything up to and including the `1.4` series |
/// | `1.2:1.4` | both of the above |
pub fn version_matches(candidate: &Version, range: &VersionRange) -> bool {
    match range {
        VersionRange::Exact(v) => candidate == v,
        VersionRange::Prefix(v) => v.is_prefix_of(candidate),
        VersionRange::Between { low, high } => {
            low.as_ref().is_none_or(|low| candidate >= low)
                && high
                    .as_ref()
                    .is_none_or(|high| candidate <= high || high.is_prefix_of(candidate))
        }
    }
}

/// A union of version ranges; empty means "any version".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionConstraint {
    ranges: Vec<VersionRange>,
}

impl VersionConstraint {
    /// The constraint that admits every version.
    pub fn any() -> Self {
        Self::default()
    }

    /// Constraint admitting exactly `version`.
    pub fn exact(version: Version) -> Self {
        Self {
            ranges: vec![VersionRange::Exact(version)],
        }
    }

    /// Parse a comma separated list of ranges.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let text = text.trim();
        if text.is_empty() || text == ":" {
            return Ok(Self::any());
        }
        let ranges = text
            .split(',')
            .map(|r| VersionRange::parse(r.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }

    /// Whether this constraint admits every version.
    pub fn is_any(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The ranges of this constraint.
    pub fn ranges(&self) -> &[VersionRange] {
        &self.ranges
    }

    /// Whether `version` satisfies the constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.is_any() || self.ranges.iter().any(|r| version_matches(version, r))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, ":");
        }
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}
