//! Dependency graph: cycle detection and sequential execution order.
//!
//! Uses `petgraph` to model step dependencies as a directed graph.
//! Topological sort detects cycles; [`execution_order`] then walks the
//! graph in a stable Kahn order so that independent steps keep their
//! declaration order.

use std::collections::HashMap;

use ledgerflow_types::workflow::StepDescriptor;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::SpecError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build a graph with one node per step (node index == step index) and an
/// edge from each dependency to its dependent.
fn build_graph(steps: &[StepDescriptor]) -> Result<DiGraph<&str, ()>, SpecError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<NodeIndex> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx
                .get(dep.as_str())
                .ok_or_else(|| SpecError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }

    Ok(graph)
}

/// Validate that steps form a DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDescriptor]) -> Result<(), SpecError> {
    let graph = build_graph(steps)?;
    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        SpecError::CycleDetected(node_id.to_string())
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution order
// ---------------------------------------------------------------------------

/// Sequential execution order honoring `depends_on`.
///
/// At each point the earliest-declared step whose dependencies have all run
/// is chosen, so a spec whose steps are already in dependency order executes
/// exactly as written.
pub fn execution_order(steps: &[StepDescriptor]) -> Result<Vec<&StepDescriptor>, SpecError> {
    let graph = build_graph(steps)?;
    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        SpecError::CycleDetected(node_id.to_string())
    })?;

    let mut remaining: Vec<usize> = (0..steps.len())
        .map(|i| {
            graph
                .neighbors_directed(NodeIndex::new(i), petgraph::Direction::Incoming)
                .count()
        })
        .collect();
    let mut done = vec![false; steps.len()];
    let mut order = Vec::with_capacity(steps.len());

    while order.len() < steps.len() {
        let Some(next) = (0..steps.len()).find(|&i| !done[i] && remaining[i] == 0) else {
            // Unreachable after a successful toposort.
            return Err(SpecError::CycleDetected(
                steps
                    .iter()
                    .enumerate()
                    .find(|(i, _)| !done[*i])
                    .map(|(_, s)| s.id.clone())
                    .unwrap_or_default(),
            ));
        };
        done[next] = true;
        order.push(&steps[next]);
        for dependent in graph.neighbors_directed(NodeIndex::new(next), petgraph::Direction::Outgoing)
        {
            remaining[dependent.index()] = remaining[dependent.index()].saturating_sub(1);
        }
    }

    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, depends_on: Vec<&str>) -> StepDescriptor {
        let mut s = StepDescriptor::new(id, "echo");
        s.depends_on = depends_on.into_iter().map(String::from).collect();
        s
    }

    fn ids(order: Vec<&StepDescriptor>) -> Vec<&str> {
        order.into_iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_independent_steps_keep_declaration_order() {
        let steps = vec![step("c", vec![]), step("a", vec![]), step("b", vec![])];
        assert_eq!(ids(execution_order(&steps).unwrap()), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_dependency_moves_step_later() {
        let steps = vec![
            step("report", vec!["fetch"]),
            step("fetch", vec![]),
            step("audit", vec![]),
        ];
        assert_eq!(
            ids(execution_order(&steps).unwrap()),
            vec!["fetch", "report", "audit"]
        );
    }

    #[test]
    fn test_diamond() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ];
        assert_eq!(ids(execution_order(&steps).unwrap()), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", vec!["c"]), step("b", vec!["a"]), step("c", vec!["b"])];
        assert!(matches!(validate_dag(&steps), Err(SpecError::CycleDetected(_))));
        assert!(execution_order(&steps).is_err());
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", vec!["nope"])];
        assert!(matches!(
            execution_order(&steps),
            Err(SpecError::UnknownDependency { dependency, .. }) if dependency == "nope"
        ));
    }
}
