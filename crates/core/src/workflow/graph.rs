use crate::error::{EngineError, EngineResult};
use crate::types::{StepId, Workflow};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

/// Structural finding that does not make a workflow invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Steps that `on_success` links connect into a loop. Execution is
    /// bounded by the visit budget, so loops are allowed.
    Cycle(Vec<StepId>),
    /// Step not reachable from the first step
    Unreachable(StepId),
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::Cycle(steps) => {
                let names: Vec<&str> = steps.iter().map(|s| s.0.as_str()).collect();
                write!(f, "steps form a cycle: {}", names.join(" -> "))
            }
            Diagnostic::Unreachable(step) => {
                write!(f, "step {} is unreachable from the first step", step)
            }
        }
    }
}

/// Graph of a workflow's `on_success` links
pub struct StepGraph {
    graph: DiGraph<StepId, ()>,
}

impl StepGraph {
    /// Build the graph, rejecting empty ids, duplicate step ids and links to
    /// steps that do not exist
    pub fn from_workflow(workflow: &Workflow) -> EngineResult<Self> {
        if workflow.id.0.trim().is_empty() {
            return Err(EngineError::Definition("workflow id must not be empty".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &workflow.steps {
            if step.id.0.trim().is_empty() {
                return Err(EngineError::Definition(format!(
                    "workflow {} has a step with an empty id",
                    workflow.id
                )));
            }
            if step.target.trim().is_empty() {
                return Err(EngineError::Definition(format!(
                    "step {} of workflow {} has no target",
                    step.id, workflow.id
                )));
            }

            let node = graph.add_node(step.id.clone());
            if step_indices.insert(step.id.clone(), node).is_some() {
                return Err(EngineError::Definition(format!(
                    "duplicate step id {} in workflow {}",
                    step.id, workflow.id
                )));
            }
        }

        for step in &workflow.steps {
            if let Some(next) = &step.on_success {
                let next_idx = step_indices.get(next).ok_or_else(|| {
                    EngineError::Definition(format!(
                        "step {} of workflow {} links to unknown step {}",
                        step.id, workflow.id, next
                    ))
                })?;
                graph.add_edge(step_indices[&step.id], *next_idx, ());
            }
        }

        Ok(Self { graph })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Loops and unreachable steps
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        for component in tarjan_scc(&self.graph) {
            let is_loop = component.len() > 1
                || self.graph.contains_edge(component[0], component[0]);
            if is_loop {
                let mut steps: Vec<NodeIndex> = component;
                steps.sort();
                diagnostics.push(Diagnostic::Cycle(
                    steps.into_iter().map(|n| self.graph[n].clone()).collect(),
                ));
            }
        }

        // Steps are added in declaration order, so node 0 is the first step
        if let Some(entry) = self.graph.node_indices().next() {
            let mut dfs = Dfs::new(&self.graph, entry);
            let mut reached = vec![false; self.graph.node_count()];
            while let Some(node) = dfs.next(&self.graph) {
                reached[node.index()] = true;
            }

            for node in self.graph.node_indices() {
                if !reached[node.index()] {
                    diagnostics.push(Diagnostic::Unreachable(self.graph[node].clone()));
                }
            }
        }

        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Step, StepKind, WorkflowId};

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: WorkflowId::new("test-workflow"),
            name: "Test".to_string(),
            description: String::new(),
            steps,
        }
    }

    #[test]
    fn test_linear_chain() {
        let graph = StepGraph::from_workflow(&workflow(vec![
            Step::new("a", StepKind::Tool, "extract").then("b"),
            Step::new("b", StepKind::Module, "analyze").then("c"),
            Step::new("c", StepKind::Ai, "auto"),
        ]))
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert!(graph.diagnostics().is_empty());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result = StepGraph::from_workflow(&workflow(vec![
            Step::new("a", StepKind::Tool, "extract"),
            Step::new("a", StepKind::Tool, "extract"),
        ]));
        assert!(matches!(result, Err(EngineError::Definition(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_dangling_link_rejected() {
        let result = StepGraph::from_workflow(&workflow(vec![
            Step::new("a", StepKind::Tool, "extract").then("missing")
        ]));
        assert!(matches!(result, Err(EngineError::Definition(msg)) if msg.contains("missing")));
    }

    #[test]
    fn test_cycle_and_unreachable_are_diagnostics() {
        let graph = StepGraph::from_workflow(&workflow(vec![
            Step::new("a", StepKind::Tool, "extract").then("b"),
            Step::new("b", StepKind::Tool, "verify").then("a"),
            Step::new("orphan", StepKind::Module, "archive"),
        ]))
        .unwrap();

        let diagnostics = graph.diagnostics();
        assert!(diagnostics.contains(&Diagnostic::Cycle(vec![
            StepId::new("a"),
            StepId::new("b")
        ])));
        assert!(diagnostics.contains(&Diagnostic::Unreachable(StepId::new("orphan"))));
    }
}
