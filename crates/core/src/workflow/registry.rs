use super::graph::StepGraph;
use crate::error::{EngineError, EngineResult};
use crate::types::{Workflow, WorkflowId};
use anyhow::Context;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Validated, immutable workflow definitions
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a workflow. Nothing is stored if validation fails,
    /// and a registered id cannot be registered again.
    pub fn register(&self, workflow: Workflow) -> EngineResult<()> {
        let graph = StepGraph::from_workflow(&workflow)?;
        for diagnostic in graph.diagnostics() {
            tracing::warn!("Workflow {}: {}", workflow.id, diagnostic);
        }

        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::Definition(format!(
                "workflow {} is already registered",
                workflow.id
            )));
        }

        tracing::info!(
            "Registered workflow {} ({} steps)",
            workflow.id,
            workflow.steps.len()
        );
        workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn get(&self, id: &WorkflowId) -> EngineResult<Arc<Workflow>> {
        self.workflows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }

    /// All workflows, ordered by id
    pub fn list(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<Arc<Workflow>> = self.workflows.read().values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub fn len(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.read().is_empty()
    }

    /// Register every `*.json` workflow file in `dir`, in file name order.
    /// Stops at the first file that fails to parse or validate.
    pub fn load_dir(&self, dir: &Path) -> EngineResult<Vec<WorkflowId>> {
        let paths = workflow_files(dir)?;

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let workflow = read_workflow(&path)?;
            let id = workflow.id.clone();
            self.register(workflow)?;
            loaded.push(id);
        }

        tracing::info!("Loaded {} workflows from {}", loaded.len(), dir.display());
        Ok(loaded)
    }
}

/// `*.json` files directly inside `dir`, sorted by path
pub fn workflow_files(dir: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read workflow directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse a workflow definition file without registering it
pub fn read_workflow(path: &Path) -> EngineResult<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;

    serde_json::from_str(&content)
        .map_err(|e| EngineError::Definition(format!("{}: {}", path.display(), e)))
}
