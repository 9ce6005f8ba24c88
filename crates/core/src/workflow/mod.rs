pub mod executor;
pub mod graph;
pub mod job;
pub mod registry;
pub mod target;

pub use executor::WorkflowExecutor;
pub use graph::{Diagnostic, StepGraph};
pub use job::{WorkflowJobHandler, WORKFLOW_JOB_TYPE};
pub use registry::{read_workflow, workflow_files, WorkflowRegistry};
pub use target::{Collaborator, Target, TargetOutcome, TargetRegistry, AUTO_PROVIDER};
