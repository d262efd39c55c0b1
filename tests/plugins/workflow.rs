use async_trait::async_trait;
use quire::core::config::EngineConfig;
use quire::core::descriptor::{FieldKind, FieldSpec, SchemaDescriptor};
use quire::core::error::QuireError;
use quire::core::query::{FindOptions, SchemaSnapshot};
use quire::core::schemas::{COMPONENT_ENTITY_TYPE, WORKFLOW_ENTITY_TYPE};
use quire::core::store::Store;
use quire::plugins::actions::{ActionDescriptor, ActionKind, Statement};
use quire::plugins::codegen::{CodeGenerator, GeneratedComponent, UnconfiguredGenerator};
use quire::plugins::notify::NotificationChannel;
use quire::plugins::workflow::{
    CreateRequest, ExecutionPlan, ImproveRequest, Planner, Step, StepAction, StepKind,
    StepRequest, WorkflowEngine, WorkflowPhase, WorkflowStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;

struct FakeGenerator {
    calls: AtomicUsize,
}

impl FakeGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CodeGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedComponent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedComponent {
            name: prompt.split_whitespace().next().unwrap_or("widget").to_string(),
            description: prompt.to_string(),
            code: format!("// {prompt}"),
            component_type: "widget".to_string(),
        })
    }

    async fn improve(
        &self,
        existing: &GeneratedComponent,
        instructions: &str,
    ) -> anyhow::Result<GeneratedComponent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut improved = existing.clone();
        improved.code = format!("{}\n// {instructions}", existing.code);
        Ok(improved)
    }
}

struct FixedPlanner(Option<ExecutionPlan>);

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(
        &self,
        _request: &str,
        _snapshot: &SchemaSnapshot,
    ) -> anyhow::Result<ExecutionPlan> {
        self.0
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model unavailable"))
    }
}

fn todo_store() -> Arc<Store> {
    let store = Store::open_in_memory().unwrap();
    store
        .register_schema(
            SchemaDescriptor::new("todo").field("text", FieldSpec::new(FieldKind::String).required()),
        )
        .unwrap();
    Arc::new(store)
}

fn new_engine(store: Arc<Store>) -> WorkflowEngine {
    WorkflowEngine::new(store, FakeGenerator::new()).unwrap()
}

fn read_step(description: &str, entity_type: &str) -> Step {
    Step::new(
        description,
        StepAction::Read(StepRequest::Descriptor(ActionDescriptor::new(
            ActionKind::Find,
            entity_type,
        ))),
    )
}

fn write_step(description: &str, descriptor: ActionDescriptor) -> Step {
    Step::new(description, StepAction::Write(StepRequest::Descriptor(descriptor)))
}

fn count(store: &Store, entity_type: &str) -> u64 {
    store
        .count(entity_type, &json!({}), &FindOptions::uncached())
        .unwrap()
}

#[tokio::test]
async fn test_write_step_suspends_and_denial_leaves_data_untouched() {
    let store = todo_store();
    for text in ["a", "b"] {
        store.create("todo", json!({"text": text}), None).unwrap();
    }
    let engine = new_engine(Arc::clone(&store));

    let plan = ExecutionPlan::new(
        "Clear the list",
        vec![
            read_step("look at todos", "todo"),
            write_step(
                "delete every todo",
                ActionDescriptor::new(ActionKind::DeleteAll, "todo"),
            ),
        ],
    );
    let suspended = engine.start_with_plan("clear my todos", plan).await.unwrap();
    assert_eq!(suspended.phase(), WorkflowPhase::AwaitingConfirmation);
    assert_eq!(suspended.status(), WorkflowStatus::Processing);
    assert_eq!(suspended.current_step_index(), Some(1));
    assert_eq!(suspended.document.step_results.len(), 1);
    assert_eq!(suspended.document.step_results[0].kind, StepKind::Read);
    assert!(suspended.document.response_text.contains("Step 2 of 2"));
    let pending = suspended.pending_step().unwrap();
    assert!(pending.requires_confirmation);

    let denied = engine.deny(&suspended.id, "changed my mind").unwrap();
    assert_eq!(denied.status(), WorkflowStatus::Failed);
    assert_eq!(denied.phase(), WorkflowPhase::Failed);
    assert_eq!(denied.document.error.as_deref(), Some("denied: changed my mind"));
    assert_eq!(count(&store, "todo"), 2);

    // Nothing pending any more.
    let again = engine.deny(&suspended.id, "twice").unwrap();
    assert_eq!(again.version, denied.version);
    let approved = engine.approve(&suspended.id).await.unwrap();
    assert_eq!(approved.phase(), WorkflowPhase::Failed);
    assert_eq!(count(&store, "todo"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_approval_executes_step_once() {
    let store = todo_store();
    let engine = new_engine(Arc::clone(&store));
    let plan = ExecutionPlan::new(
        "Add a todo",
        vec![write_step(
            "create the todo",
            ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "once"})),
        )],
    );
    let suspended = engine.start_with_plan("add once", plan).await.unwrap();
    assert_eq!(suspended.phase(), WorkflowPhase::AwaitingConfirmation);
    assert_eq!(count(&store, "todo"), 0);

    let engine = Arc::new(engine);
    let approvals: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = suspended.id.clone();
            tokio::spawn(async move { engine.approve_step(&id, 0).await })
        })
        .collect();
    let mut terminal = 0;
    for approval in approvals {
        if approval.await.unwrap().unwrap().is_terminal() {
            terminal += 1;
        }
    }
    assert_eq!(count(&store, "todo"), 1);
    assert!(terminal >= 1);

    let done = engine.require(&suspended.id).unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(done.document.step_results.len(), 1);
    assert!(done.document.continuation.is_some());

    let late = engine.approve(&suspended.id).await.unwrap();
    assert_eq!(late.version, done.version);
    assert_eq!(count(&store, "todo"), 1);
}

#[tokio::test]
async fn test_approval_for_a_different_step_is_ignored() {
    let store = todo_store();
    let engine = new_engine(Arc::clone(&store));
    let plan = ExecutionPlan::new(
        "Two writes",
        vec![
            write_step(
                "first",
                ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "1"})),
            ),
            write_step(
                "second",
                ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "2"})),
            ),
        ],
    );
    let wf = engine.start_with_plan("two", plan).await.unwrap();

    let unchanged = engine.approve_step(&wf.id, 1).await.unwrap();
    assert_eq!(unchanged.version, wf.version);
    assert_eq!(count(&store, "todo"), 0);

    let after_first = engine.approve_step(&wf.id, 0).await.unwrap();
    assert_eq!(after_first.phase(), WorkflowPhase::AwaitingConfirmation);
    assert_eq!(after_first.current_step_index(), Some(1));
    assert_eq!(count(&store, "todo"), 1);

    // Replaying the approval for step 0 does not run step 1.
    let replay = engine.approve_step(&wf.id, 0).await.unwrap();
    assert_eq!(replay.version, after_first.version);

    let done = engine.approve_step(&wf.id, 1).await.unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(count(&store, "todo"), 2);
    assert!(done.document.response_text.starts_with("Two writes."));
}

#[tokio::test]
async fn test_suspended_workflow_resumes_from_another_engine() {
    let tmp = tempdir().unwrap();
    let config = EngineConfig::with_database(tmp.path().join("quire.db"));

    let id = {
        let store = Arc::new(Store::open(&config).unwrap());
        let engine = new_engine(store);
        let plan = ExecutionPlan::new(
            "Seed notes",
            vec![write_step(
                "insert notes",
                ActionDescriptor::new(ActionKind::CreateMany, "note")
                    .with_items(vec![json!({"n": 1}), json!({"n": 2})]),
            )],
        );
        engine.start_with_plan("seed", plan).await.unwrap().id
    };

    let store = Arc::new(Store::open(&config).unwrap());
    let engine = new_engine(Arc::clone(&store));
    let loaded = engine.require(&id).unwrap();
    assert_eq!(loaded.phase(), WorkflowPhase::AwaitingConfirmation);

    let done = engine.approve(&id).await.unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(done.document.step_results[0].rows_affected, Some(2));
    assert_eq!(count(&store, "note"), 2);
}

#[tokio::test]
async fn test_failed_step_keeps_earlier_results() {
    let store = todo_store();
    let engine = new_engine(Arc::clone(&store));
    let plan = ExecutionPlan::new(
        "Fill the list",
        vec![
            write_step(
                "good insert",
                ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "ok"})),
            ),
            write_step(
                "bad insert",
                ActionDescriptor::new(ActionKind::CreateMany, "todo")
                    .with_items(vec![json!({"text": "fine"}), json!({"note": "no text"})]),
            ),
        ],
    );
    let wf = engine.start_with_plan("fill", plan).await.unwrap();
    let wf = engine.approve(&wf.id).await.unwrap();
    assert_eq!(wf.phase(), WorkflowPhase::AwaitingConfirmation);

    let failed = engine.approve(&wf.id).await.unwrap();
    assert_eq!(failed.status(), WorkflowStatus::Failed);
    assert_eq!(failed.document.step_results.len(), 1);
    assert_eq!(failed.current_step_index(), Some(1));
    let error = failed.document.error.clone().unwrap();
    assert!(error.contains("step 1"), "{error}");

    // Step 0 stays applied; step 1 rolled back as a whole.
    assert_eq!(count(&store, "todo"), 1);
}

#[tokio::test]
async fn test_create_and_improve_components() {
    let store = todo_store();
    let generator = FakeGenerator::new();
    let engine = WorkflowEngine::new(Arc::clone(&store), generator.clone()).unwrap();

    let plan = ExecutionPlan::new(
        "Build a counter",
        vec![
            Step::new(
                "generate",
                StepAction::Create(CreateRequest {
                    prompt: "counter with buttons".into(),
                    name: None,
                }),
            ),
            Step::new(
                "polish",
                StepAction::Improve(ImproveRequest {
                    name: "counter".into(),
                    instructions: "add a reset button".into(),
                }),
            ),
            Step::new(
                "fresh",
                StepAction::Improve(ImproveRequest {
                    name: "gauge".into(),
                    instructions: "gauge for cpu load".into(),
                }),
            ),
        ],
    );
    // Neither create nor improve waits for approval.
    let done = engine.start_with_plan("make widgets", plan).await.unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(done.document.step_results.len(), 3);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);

    let counter = store
        .find_one(COMPONENT_ENTITY_TYPE, &json!({"name": "counter"}), &FindOptions::uncached())
        .unwrap()
        .unwrap();
    assert!(counter.data["code"].as_str().unwrap().contains("add a reset button"));
    assert_eq!(counter.version, 2);
    assert_eq!(counter.metadata["workflowId"], json!(done.id));
    assert_eq!(counter.metadata["step"], 0);

    let gauge = store
        .find_one(COMPONENT_ENTITY_TYPE, &json!({"name": "gauge"}), &FindOptions::uncached())
        .unwrap()
        .unwrap();
    assert_eq!(gauge.metadata["step"], 2);
    assert_eq!(count(&store, COMPONENT_ENTITY_TYPE), 2);
}

#[tokio::test]
async fn test_unconfigured_generator_fails_the_step() {
    let store = todo_store();
    let engine = WorkflowEngine::new(Arc::clone(&store), Arc::new(UnconfiguredGenerator)).unwrap();
    let plan = ExecutionPlan::new(
        "Build",
        vec![Step::new(
            "generate",
            StepAction::Create(CreateRequest {
                prompt: "anything".into(),
                name: Some("thing".into()),
            }),
        )],
    );
    let failed = engine.start_with_plan("build", plan).await.unwrap();
    assert_eq!(failed.status(), WorkflowStatus::Failed);
    assert!(failed.document.error.unwrap().contains("no code generator"));
    assert_eq!(count(&store, COMPONENT_ENTITY_TYPE), 0);
}

#[tokio::test]
async fn test_planner_drives_start() {
    let store = todo_store();
    store.create("todo", json!({"text": "a"}), None).unwrap();

    let plan = ExecutionPlan::new("List todos", vec![read_step("read", "todo")]);
    let engine = new_engine(Arc::clone(&store)).with_planner(Arc::new(FixedPlanner(Some(plan))));
    let done = engine.start("what is on my list?").await.unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(done.document.request_text, "what is on my list?");
    assert_eq!(done.document.response_text, "List todos. Found 1 record(s).");
    assert_eq!(done.document.step_results[0].rows.as_ref().unwrap().len(), 1);

    let broken = engine_with_failing_planner(Arc::clone(&store));
    let failed = broken.start("anything").await.unwrap();
    assert_eq!(failed.status(), WorkflowStatus::Failed);
    assert!(failed.document.error.unwrap().starts_with("planning failed"));

    let bare = new_engine(Arc::clone(&store));
    let err = bare.start("no planner").await.unwrap_err();
    assert!(matches!(err, QuireError::WorkflowStateError(_)));
}

fn engine_with_failing_planner(store: Arc<Store>) -> WorkflowEngine {
    new_engine(store).with_planner(Arc::new(FixedPlanner(None)))
}

#[tokio::test]
async fn test_empty_plan_completes_immediately() {
    let engine = new_engine(todo_store());
    let done = engine
        .start_with_plan("nothing", ExecutionPlan::new("Nothing needed", vec![]))
        .await
        .unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
    assert_eq!(done.document.response_text, "Nothing needed. Nothing to do.");
}

#[tokio::test]
async fn test_generated_statements_are_gated_like_descriptors() {
    let store = todo_store();
    store.create("todo", json!({"text": "a"}), None).unwrap();
    let engine = new_engine(Arc::clone(&store));

    // Labelled a read, but the statement writes.
    let plan = ExecutionPlan::new(
        "Tidy",
        vec![Step::new(
            "raw cleanup",
            StepAction::Read(StepRequest::Statements {
                statements: vec![Statement::Raw {
                    sql: "DELETE FROM records WHERE entity_type = 'todo'".into(),
                    params: vec![],
                }],
            }),
        )],
    );
    let wf = engine.start_with_plan("tidy", plan).await.unwrap();
    assert_eq!(wf.phase(), WorkflowPhase::AwaitingConfirmation);
    assert_eq!(count(&store, "todo"), 1);

    // Raw writes can reach workflow rows, so steps refuse them outright.
    let refused = engine.approve(&wf.id).await.unwrap();
    assert_eq!(refused.status(), WorkflowStatus::Failed);
    assert!(refused.document.error.unwrap().contains("raw write"));
    assert_eq!(count(&store, "todo"), 1);

    let raw_read = ExecutionPlan::new(
        "Count",
        vec![Step::new(
            "raw count",
            StepAction::Read(StepRequest::Statements {
                statements: vec![Statement::Raw {
                    sql: "SELECT COUNT(*) AS n FROM records WHERE entity_type = 'todo'".into(),
                    params: vec![],
                }],
            }),
        )],
    );
    let counted = engine.start_with_plan("count", raw_read).await.unwrap();
    assert_eq!(counted.status(), WorkflowStatus::Completed);
    assert_eq!(
        counted.document.step_results[0].rows,
        Some(vec![json!({"n": 1})])
    );

    let hostile = ExecutionPlan::new(
        "Drop",
        vec![Step::new(
            "drop",
            StepAction::Write(StepRequest::Statements {
                statements: vec![Statement::Raw {
                    sql: "DROP TABLE records".into(),
                    params: vec![],
                }],
            }),
        )],
    );
    let wf = engine.start_with_plan("drop", hostile).await.unwrap();
    let failed = engine.approve(&wf.id).await.unwrap();
    assert_eq!(failed.status(), WorkflowStatus::Failed);
    assert!(failed.document.error.unwrap().contains("Policy violation"));
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let store = todo_store();
    let engine = new_engine(Arc::clone(&store));
    let waiting = ExecutionPlan::new(
        "Add",
        vec![write_step(
            "add",
            ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "x"})),
        )],
    );
    engine.start_with_plan("one", waiting).await.unwrap();
    engine
        .start_with_plan("two", ExecutionPlan::new("Done", vec![]))
        .await
        .unwrap();

    assert_eq!(engine.list(None).unwrap().len(), 2);
    let processing = engine.list(Some(WorkflowStatus::Processing)).unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].document.request_text, "one");
    assert_eq!(engine.list(Some(WorkflowStatus::Completed)).unwrap().len(), 1);

    let err = engine.require("missing").unwrap_err();
    assert!(matches!(err, QuireError::NotFound(_)));
}

#[tokio::test]
async fn test_broadcast_fires_on_every_transition() {
    let (channel, mut rx) = NotificationChannel::broadcast(64);
    let engine = new_engine(todo_store()).with_notifier(channel);
    let plan = ExecutionPlan::new(
        "Add",
        vec![write_step(
            "add",
            ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "x"})),
        )],
    );
    let wf = engine.start_with_plan("notify me", plan).await.unwrap();

    // ingest, running, awaiting_confirmation
    let mut seen = 0;
    while rx.try_recv().is_ok() {
        seen += 1;
    }
    assert_eq!(seen, 3);

    engine.approve(&wf.id).await.unwrap();
    let mut seen = 0;
    while rx.try_recv().is_ok() {
        seen += 1;
    }
    // claim, step result, completion
    assert_eq!(seen, 3);
}

/// Parks at an await point so concurrent approvals overlap inside the step.
struct YieldingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl CodeGenerator for YieldingGenerator {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedComponent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        Ok(GeneratedComponent {
            name: "slow".to_string(),
            description: prompt.to_string(),
            code: String::new(),
            component_type: "widget".to_string(),
        })
    }

    async fn improve(
        &self,
        existing: &GeneratedComponent,
        _instructions: &str,
    ) -> anyhow::Result<GeneratedComponent> {
        Ok(existing.clone())
    }
}

#[tokio::test]
async fn test_interleaved_approvals_generate_once() {
    let store = todo_store();
    let generator = Arc::new(YieldingGenerator {
        calls: AtomicUsize::new(0),
    });
    let engine = WorkflowEngine::new(Arc::clone(&store), generator.clone()).unwrap();
    let mut gated = Step::new(
        "generate after sign-off",
        StepAction::Create(CreateRequest {
            prompt: "slow widget".into(),
            name: None,
        }),
    );
    gated.requires_confirmation = true;
    let suspended = engine
        .start_with_plan("slow", ExecutionPlan::new("Build slowly", vec![gated]))
        .await
        .unwrap();
    assert_eq!(suspended.phase(), WorkflowPhase::AwaitingConfirmation);

    // Both futures run on one task; the generator's yields hand control back
    // to the second approval while the first is mid-step.
    let (first, second) = tokio::join!(
        engine.approve_step(&suspended.id, 0),
        engine.approve_step(&suspended.id, 0)
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(count(&store, COMPONENT_ENTITY_TYPE), 1);
    let done = engine.require(&suspended.id).unwrap();
    assert_eq!(done.status(), WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_steps_writing_workflow_records_fail_cleanly() {
    let store = todo_store();
    let engine = new_engine(Arc::clone(&store));
    let bystander = engine
        .start_with_plan(
            "bystander",
            ExecutionPlan::new(
                "Add",
                vec![write_step(
                    "add",
                    ActionDescriptor::new(ActionKind::Create, "todo")
                        .with_data(json!({"text": "x"})),
                )],
            ),
        )
        .await
        .unwrap();

    for descriptor in [
        ActionDescriptor::new(ActionKind::DeleteAll, WORKFLOW_ENTITY_TYPE),
        ActionDescriptor::new(ActionKind::UpdateMany, WORKFLOW_ENTITY_TYPE)
            .with_filters(json!({"status": "processing"}))
            .with_updates(json!({"responseText": "hijacked"})),
    ] {
        let plan = ExecutionPlan::new("Rewrite history", vec![write_step("touch", descriptor)]);
        let wf = engine.start_with_plan("self", plan).await.unwrap();
        assert_eq!(wf.phase(), WorkflowPhase::AwaitingConfirmation);

        let failed = engine.approve(&wf.id).await.unwrap();
        assert_eq!(failed.status(), WorkflowStatus::Failed);
        assert!(failed.is_terminal());
        let error = failed.document.error.clone().unwrap();
        assert!(error.contains("step 0"), "{error}");
        assert!(error.contains(WORKFLOW_ENTITY_TYPE), "{error}");

        // Persisted, not just returned.
        let stored = engine.require(&wf.id).unwrap();
        assert_eq!(stored.version, failed.version);
        assert_eq!(stored.phase(), WorkflowPhase::Failed);
    }

    let untouched = engine.require(&bystander.id).unwrap();
    assert_eq!(untouched.version, bystander.version);
    assert_eq!(untouched.phase(), WorkflowPhase::AwaitingConfirmation);
    assert_eq!(count(&store, WORKFLOW_ENTITY_TYPE), 3);
}
