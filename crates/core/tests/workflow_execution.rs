use docket_core::workflow::{
    TargetOutcome, TargetRegistry, WorkflowExecutor, WorkflowJobHandler, WorkflowRegistry,
    WORKFLOW_JOB_TYPE,
};
use docket_core::storage::RedbJobStore;
use docket_core::{
    EngineError, JobQueue, JobStatus, JobWorker, NewJob, Payload, ProcessOutcome, QueueConfig,
    Step, StepId, StepKind, StepStatus, Workflow, WorkflowId,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn workflow(id: &str, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: WorkflowId::new(id),
        name: id.to_string(),
        description: String::new(),
        steps,
    }
}

type Visits = Arc<parking_lot::Mutex<Vec<(String, Payload)>>>;

fn visited_names(visited: &Visits) -> Vec<String> {
    visited.lock().iter().map(|(name, _)| name.clone()).collect()
}

/// Tools that append their name and input to `visited` and count visits in their output
fn recording_targets(visited: Visits, failing: &str) -> TargetRegistry {
    let mut targets = TargetRegistry::new();
    for name in ["extract", "classify", "summarise"] {
        let visited = visited.clone();
        let fails = name == failing;
        targets.register_tool(name, move |input: Payload| {
            visited.lock().push((name.to_string(), input.clone()));
            async move {
                if fails {
                    return Ok::<_, anyhow::Error>(TargetOutcome::failure(format!(
                        "{} could not read the document",
                        name
                    )));
                }
                let seen = input.get("seen").and_then(Value::as_u64).unwrap_or(0);
                Ok(TargetOutcome::success(json!({"last": name, "seen": seen + 1})))
            }
        });
    }
    targets
}

fn chain() -> Workflow {
    workflow(
        "intake",
        vec![
            Step::new("a", StepKind::Tool, "extract").then("b"),
            Step::new("b", StepKind::Tool, "classify").then("c"),
            Step::new("c", StepKind::Tool, "summarise"),
        ],
    )
}

#[tokio::test]
async fn test_chain_runs_in_order() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(chain()).unwrap();
    let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = WorkflowExecutor::new(registry, Arc::new(recording_targets(visited.clone(), "")));

    let report = executor
        .execute(&WorkflowId::new("intake"), payload(json!({"x": 1})))
        .await
        .unwrap();

    assert_eq!(visited_names(&visited), vec!["extract", "classify", "summarise"]);
    let inputs: Vec<Payload> = visited.lock().iter().map(|(_, input)| input.clone()).collect();
    assert_eq!(Value::Object(inputs[0].clone()), json!({"x": 1}));
    assert_eq!(inputs[2]["x"], 1);
    assert_eq!(inputs[2]["seen"], 2);
    assert_eq!(report.trace.len(), 3);
    assert!(report.trace.iter().all(|r| r.status == StepStatus::Completed));
    assert_eq!(report.output, json!({"last": "summarise", "seen": 3}));
}

#[tokio::test]
async fn test_failing_step_aborts_with_trace() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(chain()).unwrap();
    let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = WorkflowExecutor::new(
        registry,
        Arc::new(recording_targets(visited.clone(), "classify")),
    );

    let err = executor
        .execute(&WorkflowId::new("intake"), Payload::new())
        .await
        .unwrap_err();

    assert_eq!(visited_names(&visited), vec!["extract", "classify"]);
    assert_eq!(err.failed_step(), Some(&StepId::new("b")));
    let trace = err.trace().unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[1].status, StepStatus::Failed);
    assert!(matches!(err, EngineError::Handler { ref message, .. } if message.contains("classify")));
}

#[tokio::test]
async fn test_missing_target_keeps_partial_trace() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(workflow(
            "intake",
            vec![
                Step::new("a", StepKind::Tool, "extract").then("b"),
                Step::new("b", StepKind::Tool, "missing_tool"),
            ],
        ))
        .unwrap();
    let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = WorkflowExecutor::new(registry, Arc::new(recording_targets(visited.clone(), "")));

    let err = executor
        .execute(&WorkflowId::new("intake"), payload(json!({"x": 1})))
        .await
        .unwrap_err();

    assert_eq!(visited_names(&visited), vec!["extract"]);
    assert_eq!(err.failed_step(), Some(&StepId::new("b")));
    assert!(matches!(
        err,
        EngineError::TargetNotFound { kind: "tool", ref target, .. } if target == "missing_tool"
    ));

    let trace = err.trace().unwrap();
    assert_eq!(trace.len(), 2);
    assert_eq!(trace[0].step_id, StepId::new("a"));
    assert_eq!(trace[0].status, StepStatus::Completed);
    assert_eq!(trace[1].step_id, StepId::new("b"));
    assert_eq!(trace[1].status, StepStatus::Failed);
}

#[tokio::test]
async fn test_collaborator_error_counts_as_failure() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(workflow(
            "verify",
            vec![Step::new("check", StepKind::Module, "citation_checker")],
        ))
        .unwrap();

    let mut targets = TargetRegistry::new();
    targets.register_module("citation_checker", |_input: Payload| async move {
        Err::<TargetOutcome, _>(anyhow::anyhow!("reporter service unavailable"))
    });

    let executor = WorkflowExecutor::new(registry, Arc::new(targets));
    let err = executor
        .execute(&WorkflowId::new("verify"), Payload::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Handler { ref step_id, .. } if step_id.0 == "check"));
    assert_eq!(err.trace().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cycle_exhausts_visit_budget() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(workflow(
            "loop",
            vec![
                Step::new("a", StepKind::Tool, "extract").then("b"),
                Step::new("b", StepKind::Tool, "classify").then("a"),
            ],
        ))
        .unwrap();
    let visited = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let executor = WorkflowExecutor::new(registry, Arc::new(recording_targets(visited.clone(), "")));

    let err = executor
        .execute(&WorkflowId::new("loop"), Payload::new())
        .await
        .unwrap_err();

    match err {
        EngineError::CycleDetected { budget, trace, .. } => {
            assert_eq!(budget, 3);
            assert_eq!(trace.len(), 3);
        }
        other => panic!("expected CycleDetected, got {other}"),
    }
    assert_eq!(visited.lock().len(), 3);
}

#[tokio::test]
async fn test_zero_step_workflow() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(workflow("empty", Vec::new())).unwrap();
    let executor = WorkflowExecutor::new(registry, Arc::new(TargetRegistry::new()));

    let report = executor
        .execute(&WorkflowId::new("empty"), payload(json!({"ignored": true})))
        .await
        .unwrap();

    assert_eq!(report.output, json!({}));
    assert!(report.trace.is_empty());
}

#[tokio::test]
async fn test_unknown_workflow() {
    let executor = WorkflowExecutor::new(
        Arc::new(WorkflowRegistry::new()),
        Arc::new(TargetRegistry::new()),
    );
    assert!(matches!(
        executor.execute(&WorkflowId::new("missing"), Payload::new()).await,
        Err(EngineError::NotFound { kind: "workflow", .. })
    ));
}

#[tokio::test]
async fn test_workflow_runs_as_job() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(workflow(
            "draft",
            vec![
                Step::new("facts", StepKind::Module, "fact_extractor").then("write"),
                Step::new("write", StepKind::Ai, "auto")
                    .with_input(payload(json!({"prompt": "Draft a demand letter"}))),
            ],
        ))
        .unwrap();

    let ai_calls = Arc::new(AtomicUsize::new(0));
    let mut targets = TargetRegistry::new();
    targets.register_module("fact_extractor", |input: Payload| async move {
        let matter = input.get("matter").cloned().unwrap_or(Value::Null);
        Ok::<_, anyhow::Error>(TargetOutcome::success(json!({"facts": ["signed lease"], "matter": matter})))
    });
    let calls = ai_calls.clone();
    targets.register_ai_provider("anthropic", move |input: Payload| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            assert_eq!(input["prompt"], "Draft a demand letter");
            assert_eq!(input["facts"], json!(["signed lease"]));
            Ok::<_, anyhow::Error>(TargetOutcome::success("Dear tenant, ..."))
        }
    });
    targets.set_default_ai_provider("anthropic");

    let executor = Arc::new(WorkflowExecutor::new(registry, Arc::new(targets)));

    let temp_file = NamedTempFile::new().unwrap();
    let store = RedbJobStore::new(temp_file.path().to_path_buf()).unwrap();
    let queue = Arc::new(JobQueue::new(Arc::new(store), QueueConfig::default()));
    let worker = JobWorker::new(queue.clone());
    worker.register_handler(WORKFLOW_JOB_TYPE, WorkflowJobHandler::new(executor));

    let config = WorkflowJobHandler::job_config(
        &WorkflowId::new("draft"),
        payload(json!({"matter": "2024-CV-118"})),
    );
    let job_id = queue
        .create_job(NewJob::new(WORKFLOW_JOB_TYPE).config(config))
        .await
        .unwrap();

    assert_eq!(
        worker.process_next_job().await.unwrap(),
        ProcessOutcome::Completed(job_id)
    );
    assert_eq!(ai_calls.load(Ordering::SeqCst), 1);

    let job = queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["output"]["provider"], "anthropic");
    assert_eq!(result["output"]["was_auto_selected"], true);
    assert_eq!(result["output"]["response"], "Dear tenant, ...");
    assert_eq!(result["steps"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_workflow_job_without_workflow_id_fails() {
    let executor = Arc::new(WorkflowExecutor::new(
        Arc::new(WorkflowRegistry::new()),
        Arc::new(TargetRegistry::new()),
    ));

    let temp_file = NamedTempFile::new().unwrap();
    let store = RedbJobStore::new(temp_file.path().to_path_buf()).unwrap();
    let queue = Arc::new(JobQueue::new(Arc::new(store), QueueConfig::default()));
    let worker = JobWorker::new(queue.clone());
    worker.register_handler(WORKFLOW_JOB_TYPE, WorkflowJobHandler::new(executor));

    let job_id = queue
        .create_job(NewJob::new(WORKFLOW_JOB_TYPE).max_attempts(1))
        .await
        .unwrap();

    assert_eq!(
        worker.process_next_job().await.unwrap(),
        ProcessOutcome::Failed(job_id)
    );
    let error = queue.get_job(&job_id).await.unwrap().unwrap().error.unwrap();
    assert!(error.message.contains("workflow_id"));
}
