//! Concrete graphs: materialization, validation and identity.
//!
//! [`materialize`] turns an optimized [`Assignment`] into a
//! [`ConcreteGraph`], re-checking every graph invariant on the way. A
//! failed check means the solver produced something it should not have
//! and surfaces as [`ConcretizeError::InternalConsistency`], never as an
//! ordinary unsatisfiable request.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::ConfigError;
use crate::error::{ConcretizeError, Result};
use crate::reuse::{Provenance, ReuseRecord};
use crate::solver::Assignment;
use crate::space::{ConfigId, ConstraintMask, SearchSpace};
use crate::spec::{DepTypes, VariantValue};
use crate::version::Version;

/// Structural identity of a concrete node: a SHA-256 over its name,
/// version, variants, target and the identities and types of its
/// dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash of a node from its attributes and outgoing edges. Edge order
    /// does not matter.
    pub fn compute<'a>(
        name: &str,
        version: &Version,
        variants: &BTreeMap<String, VariantValue>,
        target: &str,
        dependencies: impl IntoIterator<Item = (&'a str, &'a SpecHash, &'a DepTypes)>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("name={name}\nversion={}\n", version.as_str()));
        for (variant, value) in variants {
            hasher.update(format!("variant:{variant}={value}\n"));
        }
        hasher.update(format!("target={target}\n"));
        let mut edges: Vec<String> = dependencies
            .into_iter()
            .map(|(dep, hash, types)| format!("dep:{dep}/{}:{types}\n", hash.0))
            .collect();
        edges.sort();
        for edge in edges {
            hasher.update(edge);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash of a reusable record; provenance and prefix do not count.
    pub fn of_record(record: &ReuseRecord) -> Self {
        Self::compute(
            &record.name,
            &record.version,
            &record.variants,
            &record.target,
            record
                .dependencies
                .iter()
                .map(|e| (e.name.as_str(), &e.hash, &e.types)),
        )
    }

    /// The full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first seven digits.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a concrete node is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeOrigin {
    /// Built from source.
    Built,
    /// An existing node.
    Reused(Provenance),
}

/// A typed edge to another node of the same graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteEdge {
    /// Dependency package name.
    pub name: String,
    /// Edge types.
    pub types: DepTypes,
    /// Virtuals the dependency provides for this edge.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub virtuals: BTreeSet<String>,
}

/// A fully resolved package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteNode {
    /// Package name.
    pub name: String,
    /// Version.
    pub version: Version,
    /// Value of every declared variant.
    pub variants: BTreeMap<String, VariantValue>,
    /// Target.
    pub target: String,
    /// Structural identity.
    pub hash: SpecHash,
    /// Built or reused.
    pub origin: NodeOrigin,
    /// Installation prefix of externals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Direct dependencies, by name.
    #[serde(default)]
    pub dependencies: Vec<ConcreteEdge>,
}

impl fmt::Display for ConcreteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version.as_str())?;
        for (name, value) in &self.variants {
            match value {
                VariantValue::Bool(true) => write!(f, "+{name}")?,
                VariantValue::Bool(false) => write!(f, "~{name}")?,
                _ => {}
            }
        }
        for (name, value) in &self.variants {
            if !matches!(value, VariantValue::Bool(_)) {
                write!(f, " {name}={value}")?;
            }
        }
        write!(f, " target={} /{}", self.target, self.hash.short())
    }
}

/// A concrete dependency DAG. Nodes are in topological order, every
/// dependency before its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcreteGraph {
    /// Nodes, dependencies first.
    pub nodes: Vec<ConcreteNode>,
    /// Names of the root nodes.
    pub roots: Vec<String>,
}

impl ConcreteGraph {
    /// The node for `name`.
    pub fn node(&self, name: &str) -> Option<&ConcreteNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root nodes, in name order.
    pub fn roots(&self) -> impl Iterator<Item = &ConcreteNode> {
        self.roots.iter().filter_map(|r| self.node(r))
    }

    /// Check the structure of a graph from an untrusted source: unique
    /// names, edges only to earlier nodes (which also rules out cycles),
    /// and known roots.
    pub fn validate(&self) -> Result<()> {
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        for node in &self.nodes {
            for edge in &node.dependencies {
                if !placed.contains(edge.name.as_str()) {
                    return Err(ConcretizeError::InternalConsistency(format!(
                        "edge {} -> {} does not point to an earlier node",
                        node.name, edge.name
                    )));
                }
            }
            if !placed.insert(&node.name) {
                return Err(ConcretizeError::InternalConsistency(format!(
                    "package {} appears twice",
                    node.name
                )));
            }
        }
        if let Some(root) = self.roots.iter().find(|r| !placed.contains(r.as_str())) {
            return Err(ConcretizeError::InternalConsistency(format!(
                "unknown root {root}"
            )));
        }
        Ok(())
    }

    /// Indented dependency tree of every root. A node already printed is
    /// not expanded again.
    pub fn tree(&self) -> String {
        let mut out = String::new();
        let mut seen = BTreeSet::new();
        for root in &self.roots {
            self.render(root, 0, None, &mut seen, &mut out);
        }
        out
    }

    fn render<'g>(
        &'g self,
        name: &'g str,
        depth: usize,
        edge: Option<&ConcreteEdge>,
        seen: &mut BTreeSet<&'g str>,
        out: &mut String,
    ) {
        let Some(node) = self.node(name) else {
            return;
        };
        let mark = match node.origin {
            NodeOrigin::Built => " -  ",
            NodeOrigin::Reused(Provenance::External) => "[e] ",
            NodeOrigin::Reused(_) => "[+] ",
        };
        out.push_str(mark);
        out.push_str(&"    ".repeat(depth));
        if let Some(edge) = edge {
            out.push('^');
            out.push_str(&node.to_string());
            out.push_str(&format!(" [{}]", edge.types));
        } else {
            out.push_str(&node.to_string());
        }
        out.push('\n');
        if !seen.insert(&node.name) {
            return;
        }
        for dep in &node.dependencies {
            self.render(&dep.name, depth + 1, Some(dep), seen, out);
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json(e).into())
    }

    /// Read and validate a graph written by [`ConcreteGraph::to_json`].
    pub fn from_json(text: &str) -> Result<Self> {
        let graph: ConcreteGraph = serde_json::from_str(text).map_err(ConfigError::Json)?;
        graph.validate()?;
        Ok(graph)
    }
}

impl fmt::Display for ConcreteGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tree())
    }
}

fn inconsistent(message: String) -> ConcretizeError {
    ConcretizeError::InternalConsistency(message)
}

/// Convert an assignment into a concrete graph, re-validating every
/// invariant: usable nodes, variants within their domains, satisfied
/// requirements and constrains, one provider per virtual per node,
/// acyclicity, and reachability from the roots.
pub fn materialize(space: &SearchSpace, assignment: &Assignment) -> Result<ConcreteGraph> {
    let mask = space.full_mask();
    for top in space.top() {
        if mask.is_active(top.requirement.origin)
            && !assignment
                .nodes()
                .any(|id| top.requirement.matches(space.config(id), &mask))
        {
            let names: Vec<&str> = top.requirement.alternatives.iter().map(|a| a.name.as_str()).collect();
            return Err(inconsistent(format!("no node for required {}", names.join(" | "))));
        }
    }
    for id in assignment.nodes() {
        check_node(space, assignment, &mask, id)?;
    }
    let order = topological_order(space, assignment)?;
    check_reachable(space, assignment, &order)?;

    let mut hashes: BTreeMap<ConfigId, SpecHash> = BTreeMap::new();
    let mut nodes = Vec::with_capacity(order.len());
    for id in order {
        let config = space.config(id);
        let mut dependencies = Vec::new();
        let mut identities = Vec::new();
        for (to, edge) in assignment.dependencies(id) {
            let dep = space.config(to);
            let hash = hashes
                .get(&to)
                .ok_or_else(|| inconsistent(format!("{} placed before its dependency {}", config.name, dep.name)))?;
            identities.push((dep.name.as_str(), hash, &edge.types));
            dependencies.push(ConcreteEdge {
                name: dep.name.clone(),
                types: edge.types.clone(),
                virtuals: edge.virtuals.clone(),
            });
        }
        let hash = match config.hash() {
            Some(hash) => hash.clone(),
            None => SpecHash::compute(
                &config.name,
                &config.version,
                &config.variants,
                &config.target,
                identities,
            ),
        };
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        hashes.insert(id, hash.clone());
        nodes.push(ConcreteNode {
            name: config.name.clone(),
            version: config.version.clone(),
            variants: config.variants.clone(),
            target: config.target.clone(),
            hash,
            origin: config.provenance().map_or(NodeOrigin::Built, NodeOrigin::Reused),
            prefix: space.record(id).and_then(|r| r.prefix.clone()),
            dependencies,
        });
    }

    let roots: BTreeSet<String> = assignment
        .roots()
        .map(|id| space.config(id).name.clone())
        .collect();
    let graph = ConcreteGraph {
        nodes,
        roots: roots.into_iter().collect(),
    };
    debug!(nodes = graph.len(), roots = graph.roots.len(), "materialized graph");
    Ok(graph)
}

fn check_node(
    space: &SearchSpace,
    assignment: &Assignment,
    mask: &ConstraintMask,
    id: ConfigId,
) -> Result<()> {
    let config = space.config(id);
    if let Some(reason) = space.exclusion_reason(id, mask) {
        return Err(inconsistent(format!("{config} was chosen but {reason}")));
    }

    let facts = space
        .facts()
        .package(&config.name)
        .ok_or_else(|| inconsistent(format!("{config} has no package definition")))?;
    for (name, decl) in &facts.def.variants {
        let value = config
            .variants
            .get(name)
            .ok_or_else(|| inconsistent(format!("{config} has no value for variant {name}")))?;
        if let Err(invalid) = decl.domain.validate(value) {
            return Err(inconsistent(format!(
                "{config} has {name}={value} outside the declared domain ({})",
                invalid.allowed
            )));
        }
    }
    if let Some(name) = config.variants.keys().find(|v| facts.def.variant(v).is_none()) {
        return Err(inconsistent(format!("{config} carries undeclared variant {name}")));
    }

    for requirement in config.active_requirements(mask) {
        let satisfied = match requirement.edge {
            Some(_) => assignment
                .dependencies(id)
                .any(|(to, _)| requirement.matches(space.config(to), mask)),
            None => assignment
                .reachable_from(id)
                .into_iter()
                .any(|to| requirement.matches(space.config(to), mask)),
        };
        if !satisfied {
            let wanted: Vec<String> = requirement.alternatives.iter().map(|a| a.to_string()).collect();
            return Err(inconsistent(format!(
                "{config} needs one of [{}]",
                wanted.join(", ")
            )));
        }
    }

    for constrain in config.active_constrains(mask) {
        if let Some(other) = assignment
            .nodes()
            .find(|&n| constrain.matcher.matches(space.config(n), mask))
        {
            return Err(inconsistent(format!(
                "{config} forbids {} which is in the graph",
                space.config(other)
            )));
        }
    }

    let mut providers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (to, edge) in assignment.dependencies(id) {
        for v in &edge.virtuals {
            providers
                .entry(v.as_str())
                .or_default()
                .insert(space.config(to).name.as_str());
        }
    }
    if let Some((virtual_name, names)) = providers.into_iter().find(|(_, p)| p.len() > 1) {
        return Err(ConcretizeError::AmbiguousVirtualProvider {
            package: config.name.clone(),
            virtual_name: virtual_name.to_string(),
            providers: names.into_iter().map(str::to_string).collect(),
        });
    }
    Ok(())
}

/// Kahn's algorithm, smallest package name first among ready nodes.
fn topological_order(space: &SearchSpace, assignment: &Assignment) -> Result<Vec<ConfigId>> {
    let mut pending: BTreeMap<ConfigId, usize> = assignment
        .nodes()
        .map(|id| (id, assignment.dependencies(id).count()))
        .collect();
    let mut ready: BTreeSet<(&str, ConfigId)> = pending
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(&id, _)| (space.config(id).name.as_str(), id))
        .collect();
    let mut order = Vec::with_capacity(pending.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(id);
        for ((from, _), _) in assignment.edges().filter(|((_, to), _)| *to == id) {
            if let Some(deps) = pending.get_mut(from) {
                *deps -= 1;
                if *deps == 0 {
                    ready.insert((space.config(*from).name.as_str(), *from));
                }
            }
        }
    }
    if order.len() != assignment.len() {
        let stuck: Vec<&str> = pending
            .iter()
            .filter(|(_, deps)| **deps > 0)
            .map(|(&id, _)| space.config(id).name.as_str())
            .collect();
        return Err(inconsistent(format!(
            "dependency cycle among {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

fn check_reachable(space: &SearchSpace, assignment: &Assignment, order: &[ConfigId]) -> Result<()> {
    let mut reached: BTreeSet<ConfigId> = assignment.roots().collect();
    for root in assignment.roots() {
        reached.extend(assignment.reachable_from(root));
    }
    match order.iter().find(|id| !reached.contains(id)) {
        Some(&orphan) => Err(inconsistent(format!(
            "{} is not reachable from any root",
            space.config(orphan)
        ))),
        None => Ok(()),
    }
}
