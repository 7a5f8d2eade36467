//! Dependency graph over unit names.
//!
//! Built from a full set of declarations and validated with a depth-first
//! traversal that marks nodes `Visiting` on the way down and `Visited` on the
//! way up; meeting a `Visiting` node is a back-edge, i.e. a cycle. A graph is
//! immutable once built: reloading produces a new generation that the engine
//! swaps in whole.

use crate::declaration::UnitDeclaration;
use crate::error::{FluxError, Result};
use crate::paths;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyGraph {
    generation: u64,
    /// unit → its direct dependencies, sorted and deduplicated.
    edges: BTreeMap<String, Vec<String>>,
    /// Dependencies before dependents; ties broken by name.
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Visited,
}

impl DependencyGraph {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(declarations: &[UnitDeclaration], generation: u64) -> Result<Self> {
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for decl in declarations {
            paths::validate_name(&decl.name)?;
            let mut deps: Vec<String> = decl.depends_on.clone();
            deps.sort();
            deps.dedup();
            if edges.insert(decl.name.clone(), deps).is_some() {
                return Err(FluxError::DuplicateUnit(decl.name.clone()));
            }
        }

        for (unit, deps) in &edges {
            for dep in deps {
                if dep != unit && !edges.contains_key(dep) {
                    return Err(FluxError::UnknownDependency {
                        unit: unit.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(&edges)?;
        Ok(Self {
            generation,
            edges,
            order,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.edges.contains_key(unit)
    }

    /// A linearization consistent with `dependsOn`. Only a scheduling hint:
    /// units without a dependency relation may apply in any order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &BTreeMap<String, Vec<String>> {
        &self.edges
    }

    pub fn dependencies(&self, unit: &str) -> &[String] {
        self.edges.get(unit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All direct and indirect dependencies of `unit`, in topological order.
    pub fn transitive_dependencies(&self, unit: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependencies(unit).iter().map(String::as_str).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependencies(next).iter().map(String::as_str));
            }
        }
        self.order
            .iter()
            .filter(|u| seen.contains(*u))
            .cloned()
            .collect()
    }

    /// Units that depend directly on `unit`.
    pub fn dependents(&self, unit: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == unit))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn topological_order(edges: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(edges.len());
    let mut order = Vec::with_capacity(edges.len());
    let mut path: Vec<&str> = Vec::new();

    for root in edges.keys() {
        visit(root, edges, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

fn visit<'a>(
    node: &'a str,
    edges: &'a BTreeMap<String, Vec<String>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(node) {
        Some(Mark::Visited) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Err(FluxError::CycleDetected { path: cycle });
        }
        None => {}
    }

    marks.insert(node, Mark::Visiting);
    path.push(node);
    if let Some(deps) = edges.get(node) {
        for dep in deps {
            visit(dep, edges, marks, path, order)?;
        }
    }
    path.pop();
    marks.insert(node, Mark::Visited);
    order.push(node.to_string());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
