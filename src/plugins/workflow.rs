//! Confirmation-gated, multi-step workflow engine.
//!
//! A workflow is a stored `workflow/chat` record. Its plan and the index of
//! the next unexecuted step live in the record's `continuation`, so a
//! suspended workflow can be resumed by any engine instance over the same
//! database.
//!
//! Phases: `planning -> running -> (awaiting_confirmation <-> running) ->
//! completed | failed`. Non-confirming steps run immediately; the engine
//! suspends exactly when the next step requires confirmation. Every phase
//! change goes through a version compare-and-set, so two approvals of the same
//! suspension execute the pending step once.

use crate::core::descriptor::{FieldKind, FieldRule, FieldSpec, SchemaDescriptor};
use crate::core::error::QuireError;
use crate::core::output;
use crate::core::query::{FindOptions, SchemaSnapshot};
use crate::core::record::Record;
use crate::core::schemas::{COMPONENT_ENTITY_TYPE, WORKFLOW_ENTITY_TYPE};
use crate::core::store::Store;
use crate::plugins::actions::{self, ActionDescriptor, ActionPlan, Statement};
use crate::plugins::codegen::{CodeGenerator, GeneratedComponent};
use crate::plugins::notify::NotificationChannel;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[clap(name = "workflow", about = "Start, inspect and approve multi-step workflows")]
pub struct WorkflowCli {
    #[clap(subcommand)]
    pub command: WorkflowCommand,
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommand {
    /// Start a workflow from a JSON execution plan.
    Start {
        /// Request text recorded on the workflow.
        request: String,
        #[clap(long)]
        plan: PathBuf,
    },
    /// List workflows, optionally by status (processing|completed|failed).
    List {
        #[clap(long)]
        status: Option<String>,
    },
    /// Show one workflow.
    Show { id: String },
    /// Approve the pending step.
    Approve {
        id: String,
        /// Only approve if this is the pending step index.
        #[clap(long)]
        step: Option<usize>,
    },
    /// Deny the pending step; the workflow fails without executing it.
    Deny {
        id: String,
        #[clap(long, default_value = "denied by operator")]
        reason: String,
    },
}

pub async fn run_workflow_cli(
    engine: &WorkflowEngine,
    cli: WorkflowCli,
    format: &str,
) -> Result<(), QuireError> {
    match cli.command {
        WorkflowCommand::Start { request, plan } => {
            let content = std::fs::read_to_string(&plan)?;
            let plan: ExecutionPlan = serde_json::from_str(&content)?;
            let workflow = engine.start_with_plan(&request, plan).await?;
            print_workflow(format, "workflow.start", &workflow)
        }
        WorkflowCommand::List { status } => {
            let status = status.as_deref().map(str::parse::<WorkflowStatus>).transpose()?;
            let workflows = engine.list(status)?;
            output::emit(
                format,
                "workflow.list",
                "ok",
                json!({ "workflows": workflows }),
                || {
                    for wf in &workflows {
                        println!(
                            "{} {} {}",
                            wf.id,
                            output::status_word(wf.document.phase.as_str()),
                            output::compact_line(&wf.document.request_text, 80)
                        );
                    }
                },
            )
        }
        WorkflowCommand::Show { id } => {
            let workflow = engine.require(&id)?;
            print_workflow(format, "workflow.show", &workflow)
        }
        WorkflowCommand::Approve { id, step } => {
            let workflow = match step {
                Some(index) => engine.approve_step(&id, index).await?,
                None => engine.approve(&id).await?,
            };
            print_workflow(format, "workflow.approve", &workflow)
        }
        WorkflowCommand::Deny { id, reason } => {
            let workflow = engine.deny(&id, &reason)?;
            print_workflow(format, "workflow.deny", &workflow)
        }
    }
}

fn print_workflow(format: &str, cmd: &str, workflow: &Workflow) -> Result<(), QuireError> {
    let phase = workflow.document.phase.as_str();
    output::emit(format, cmd, phase, json!({ "workflow": workflow }), || {
        println!("{} {}", workflow.id, output::status_word(phase));
        println!("  {}", output::compact_line(&workflow.document.response_text, 160));
        for result in &workflow.document.step_results {
            println!(
                "  [{}] {} {}",
                result.index,
                result.kind.as_str(),
                output::compact_line(&result.message, 100)
            );
        }
        if let Some(error) = &workflow.document.error {
            println!("  error: {error}");
        }
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Processing,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Processing => "processing",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = QuireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(WorkflowStatus::Processing),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(QuireError::ValidationError(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Planning,
    Running,
    AwaitingConfirmation,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Planning => "planning",
            WorkflowPhase::Running => "running",
            WorkflowPhase::AwaitingConfirmation => "awaiting_confirmation",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Read,
    Write,
    Create,
    Improve,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Read => "read",
            StepKind::Write => "write",
            StepKind::Create => "create",
            StepKind::Improve => "improve",
        }
    }
}

/// What a read or write step asks of the action layer: a structured
/// descriptor, or statements produced by an external SQL generator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepRequest {
    Descriptor(ActionDescriptor),
    Statements { statements: Vec<Statement> },
}

impl StepRequest {
    pub fn is_write(&self) -> bool {
        match self {
            StepRequest::Descriptor(descriptor) => descriptor.action.is_write(),
            StepRequest::Statements { statements } => statements.iter().any(Statement::is_write),
        }
    }

    pub fn to_plan(&self, snapshot: &SchemaSnapshot) -> Result<ActionPlan, QuireError> {
        match self {
            StepRequest::Descriptor(descriptor) => actions::generate(descriptor, snapshot),
            StepRequest::Statements { statements } => Ok(ActionPlan::from_statements(
                statements.clone(),
                "Run generated statements.",
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub prompt: String,
    /// Overrides the generated component name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImproveRequest {
    pub name: String,
    pub instructions: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum StepAction {
    Read(StepRequest),
    Write(StepRequest),
    Create(CreateRequest),
    Improve(ImproveRequest),
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            StepAction::Read(_) => StepKind::Read,
            StepAction::Write(_) => StepKind::Write,
            StepAction::Create(_) => StepKind::Create,
            StepAction::Improve(_) => StepKind::Improve,
        }
    }

    /// Write steps, and read steps whose request turns out to write.
    pub fn is_write(&self) -> bool {
        match self {
            StepAction::Write(_) => true,
            StepAction::Read(request) => request.is_write(),
            StepAction::Create(_) | StepAction::Improve(_) => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub index: usize,
    pub description: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl Step {
    pub fn new(description: impl Into<String>, action: StepAction) -> Self {
        Self {
            index: 0,
            description: description.into(),
            action,
            requires_confirmation: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn new(summary: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            summary: summary.into(),
            steps,
        }
    }

    /// Renumber steps 0..n and force confirmation on every write.
    pub fn normalized(mut self) -> Self {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.index = i;
            if step.action.is_write() {
                step.requires_confirmation = true;
            }
        }
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    pub plan: ExecutionPlan,
    pub current_step_index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    pub kind: StepKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonValue>>,
}

/// Document stored in a `workflow/chat` record. `continuation` and `error`
/// serialize as null so a merge update clears them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    pub request_text: String,
    #[serde(default)]
    pub response_text: String,
    pub status: WorkflowStatus,
    pub phase: WorkflowPhase,
    #[serde(default)]
    pub continuation: Option<Continuation>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowDocument {
    fn new(request_text: &str) -> Self {
        Self {
            request_text: request_text.to_string(),
            response_text: String::new(),
            status: WorkflowStatus::Processing,
            phase: WorkflowPhase::Planning,
            continuation: None,
            step_results: Vec::new(),
            error: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(flatten)]
    pub document: WorkflowDocument,
}

impl Workflow {
    fn from_record(record: Record) -> Result<Self, QuireError> {
        if record.entity_type != WORKFLOW_ENTITY_TYPE {
            return Err(QuireError::NotFound(format!(
                "record {} is a {}, not a workflow",
                record.id, record.entity_type
            )));
        }
        Ok(Self {
            id: record.id,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            document: serde_json::from_value(record.data)?,
        })
    }

    pub fn status(&self) -> WorkflowStatus {
        self.document.status
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.document.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.document.phase.is_terminal()
    }

    pub fn current_step_index(&self) -> Option<usize> {
        self.document
            .continuation
            .as_ref()
            .map(|c| c.current_step_index)
    }

    /// The step waiting for approval, if suspended.
    pub fn pending_step(&self) -> Option<&Step> {
        if self.document.phase != WorkflowPhase::AwaitingConfirmation {
            return None;
        }
        let continuation = self.document.continuation.as_ref()?;
        continuation.plan.steps.get(continuation.current_step_index)
    }
}

/// Turns a request into a plan. The concrete model lives outside the crate.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        request: &str,
        snapshot: &SchemaSnapshot,
    ) -> anyhow::Result<ExecutionPlan>;
}

fn workflow_schema() -> SchemaDescriptor {
    let statuses = [WorkflowStatus::Processing, WorkflowStatus::Completed, WorkflowStatus::Failed]
        .iter()
        .map(|s| json!(s.as_str()))
        .collect();
    SchemaDescriptor::new(WORKFLOW_ENTITY_TYPE)
        .field(
            "requestText",
            FieldSpec::new(FieldKind::String)
                .required()
                .rule(FieldRule::MinLength(1)),
        )
        .field(
            "status",
            FieldSpec::new(FieldKind::String)
                .required()
                .indexed()
                .rule(FieldRule::OneOf(statuses)),
        )
        .field("phase", FieldSpec::new(FieldKind::String).required())
}

fn component_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(COMPONENT_ENTITY_TYPE)
        .field(
            "name",
            FieldSpec::new(FieldKind::String)
                .required()
                .unique()
                .rule(FieldRule::MinLength(1)),
        )
        .field("code", FieldSpec::new(FieldKind::String).required())
        .field("componentType", FieldSpec::new(FieldKind::String))
}

pub struct WorkflowEngine {
    store: Arc<Store>,
    codegen: Arc<dyn CodeGenerator>,
    planner: Option<Arc<dyn Planner>>,
    notifier: NotificationChannel,
}

impl WorkflowEngine {
    /// Registers the workflow and component schemas on `store`.
    pub fn new(store: Arc<Store>, codegen: Arc<dyn CodeGenerator>) -> Result<Self, QuireError> {
        store.register_schema(workflow_schema())?;
        store.register_schema(component_schema())?;
        Ok(Self {
            store,
            codegen,
            planner: None,
            notifier: NotificationChannel::Noop,
        })
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_notifier(mut self, notifier: NotificationChannel) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn get(&self, id: &str) -> Result<Option<Workflow>, QuireError> {
        match self.store.find_by_id_with(id, false)? {
            Some(record) if record.entity_type == WORKFLOW_ENTITY_TYPE => {
                Ok(Some(Workflow::from_record(record)?))
            }
            _ => Ok(None),
        }
    }

    pub fn require(&self, id: &str) -> Result<Workflow, QuireError> {
        self.get(id)?
            .ok_or_else(|| QuireError::NotFound(format!("workflow {id}")))
    }

    pub fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, QuireError> {
        let filter = match status {
            Some(status) => json!({ "status": status.as_str() }),
            None => JsonValue::Null,
        };
        self.store
            .find(WORKFLOW_ENTITY_TYPE, &filter, &FindOptions::uncached())?
            .into_iter()
            .map(Workflow::from_record)
            .collect()
    }

    /// Plan `request` with the configured planner and run it.
    pub async fn start(&self, request: &str) -> Result<Workflow, QuireError> {
        let planner = self.planner.clone().ok_or_else(|| {
            QuireError::WorkflowStateError("no planner configured".to_string())
        })?;
        let workflow = self.ingest(request)?;
        let snapshot = self.store.schema_snapshot()?;
        match planner.plan(request, &snapshot).await {
            Ok(plan) => self.begin(workflow, plan).await,
            Err(e) => self.fail(workflow, format!("planning failed: {e}")),
        }
    }

    pub async fn start_with_plan(
        &self,
        request: &str,
        plan: ExecutionPlan,
    ) -> Result<Workflow, QuireError> {
        let workflow = self.ingest(request)?;
        self.begin(workflow, plan).await
    }

    /// Approve whatever step is pending. A no-op outside `awaiting_confirmation`.
    pub async fn approve(&self, id: &str) -> Result<Workflow, QuireError> {
        self.resume(id, None).await
    }

    /// Approve only if `index` is the pending step; repeated approvals of an
    /// already executed step are no-ops.
    pub async fn approve_step(&self, id: &str, index: usize) -> Result<Workflow, QuireError> {
        self.resume(id, Some(index)).await
    }

    pub fn deny(&self, id: &str, reason: &str) -> Result<Workflow, QuireError> {
        let workflow = self.require(id)?;
        let Some(step) = workflow.pending_step().cloned() else {
            debug!(id, phase = workflow.phase().as_str(), "nothing to deny");
            return Ok(workflow);
        };
        let mut doc = workflow.document.clone();
        doc.status = WorkflowStatus::Failed;
        doc.phase = WorkflowPhase::Failed;
        doc.error = Some(format!("denied: {reason}"));
        doc.response_text = format!("Step {} was denied: {reason}", step.index + 1);
        match self.persist(&workflow, &doc)? {
            Some(denied) => {
                info!(id, step = step.index, "workflow denied");
                Ok(denied)
            }
            None => self.require(id),
        }
    }

    fn ingest(&self, request: &str) -> Result<Workflow, QuireError> {
        let doc = WorkflowDocument::new(request);
        let record = self
            .store
            .create(WORKFLOW_ENTITY_TYPE, serde_json::to_value(&doc)?, None)?;
        info!(id = %record.id, "workflow ingested");
        self.notifier.fire();
        Workflow::from_record(record)
    }

    async fn begin(&self, workflow: Workflow, plan: ExecutionPlan) -> Result<Workflow, QuireError> {
        let plan = plan.normalized();
        let mut doc = workflow.document.clone();
        doc.phase = WorkflowPhase::Running;
        doc.response_text = plan.summary.clone();
        doc.continuation = Some(Continuation {
            plan,
            current_step_index: 0,
        });
        let workflow = self.commit(&workflow, doc)?;
        self.drive(workflow).await
    }

    async fn resume(&self, id: &str, expected: Option<usize>) -> Result<Workflow, QuireError> {
        let workflow = self.require(id)?;
        let Some(step) = workflow.pending_step().cloned() else {
            debug!(id, phase = workflow.phase().as_str(), "nothing to approve");
            return Ok(workflow);
        };
        if let Some(index) = expected
            && index != step.index
        {
            debug!(id, index, pending = step.index, "approval is for another step");
            return Ok(workflow);
        }

        let mut doc = workflow.document.clone();
        doc.phase = WorkflowPhase::Running;
        let Some(claimed) = self.persist(&workflow, &doc)? else {
            debug!(id, "approval raced with another transition");
            return self.require(id);
        };
        info!(id, step = step.index, "step approved");

        let workflow = self.run_and_advance(claimed, &step).await?;
        if workflow.is_terminal() {
            return Ok(workflow);
        }
        self.drive(workflow).await
    }

    /// Run steps until one needs confirmation or the plan ends.
    async fn drive(&self, mut workflow: Workflow) -> Result<Workflow, QuireError> {
        loop {
            let Some(continuation) = workflow.document.continuation.clone() else {
                return self.fail(workflow, "workflow has no plan".to_string());
            };
            let index = continuation.current_step_index;
            let total = continuation.plan.steps.len();
            let Some(step) = continuation.plan.steps.get(index).cloned() else {
                return self.complete(workflow);
            };

            if step.requires_confirmation {
                let mut doc = workflow.document.clone();
                doc.phase = WorkflowPhase::AwaitingConfirmation;
                doc.response_text = format!(
                    "Step {} of {total} needs confirmation: {}",
                    index + 1,
                    step.description
                );
                info!(id = %workflow.id, step = index, "awaiting confirmation");
                return self.commit(&workflow, doc);
            }

            workflow = self.run_and_advance(workflow, &step).await?;
            if workflow.is_terminal() {
                return Ok(workflow);
            }
        }
    }

    async fn run_and_advance(&self, workflow: Workflow, step: &Step) -> Result<Workflow, QuireError> {
        match self.execute_step(&workflow.id, step).await {
            Ok(result) => {
                debug!(id = %workflow.id, step = step.index, "step executed");
                let mut doc = workflow.document.clone();
                doc.step_results.push(result);
                doc.phase = WorkflowPhase::Running;
                if let Some(continuation) = doc.continuation.as_mut() {
                    continuation.current_step_index = step.index + 1;
                }
                if let Some(advanced) = self.persist(&workflow, &doc)? {
                    return Ok(advanced);
                }
                warn!(id = %workflow.id, step = step.index, "workflow record moved while step ran");
                let fresh = self.require(&workflow.id)?;
                let failure = QuireError::WorkflowStepFailure {
                    index: step.index,
                    message: "workflow record changed while the step ran".to_string(),
                };
                self.fail(fresh, failure.to_string())
            }
            Err(e) => {
                let failure = QuireError::WorkflowStepFailure {
                    index: step.index,
                    message: e.to_string(),
                };
                warn!(id = %workflow.id, error = %failure, "workflow step failed");
                self.fail(workflow, failure.to_string())
            }
        }
    }

    async fn execute_step(&self, workflow_id: &str, step: &Step) -> anyhow::Result<StepResult> {
        let kind = step.action.kind();
        match &step.action {
            StepAction::Read(request) | StepAction::Write(request) => {
                let plan = request.to_plan(&self.store.schema_snapshot()?)?;
                actions::validate_plan(&plan)?;
                check_step_targets(&plan)?;
                let result = actions::execute(&self.store, &plan)?.into_result()?;
                Ok(StepResult {
                    index: step.index,
                    kind,
                    message: result.message,
                    rows_affected: result.rows_affected,
                    rows: result.rows,
                })
            }
            StepAction::Create(request) => {
                let mut component = self.codegen.generate(&request.prompt).await?;
                if let Some(name) = &request.name {
                    component.name = name.clone();
                }
                self.save_component(workflow_id, step.index, &component)?;
                Ok(StepResult {
                    index: step.index,
                    kind,
                    message: format!("Created component '{}'.", component.name),
                    rows_affected: Some(1),
                    rows: None,
                })
            }
            StepAction::Improve(request) => {
                let existing = self.store.find_one(
                    COMPONENT_ENTITY_TYPE,
                    &json!({ "name": request.name }),
                    &FindOptions::uncached(),
                )?;
                let message = match existing {
                    Some(record) => {
                        let current: GeneratedComponent = serde_json::from_value(record.data)?;
                        let mut improved =
                            self.codegen.improve(&current, &request.instructions).await?;
                        improved.name = request.name.clone();
                        self.store
                            .update(&record.id, serde_json::to_value(&improved)?)?
                            .ok_or_else(|| {
                                anyhow::anyhow!("component '{}' disappeared", request.name)
                            })?;
                        format!("Improved component '{}'.", request.name)
                    }
                    None => {
                        let mut component =
                            self.codegen.generate(&request.instructions).await?;
                        component.name = request.name.clone();
                        self.save_component(workflow_id, step.index, &component)?;
                        format!("Created component '{}' (no prior version).", request.name)
                    }
                };
                Ok(StepResult {
                    index: step.index,
                    kind,
                    message,
                    rows_affected: Some(1),
                    rows: None,
                })
            }
        }
    }

    fn save_component(
        &self,
        workflow_id: &str,
        step_index: usize,
        component: &GeneratedComponent,
    ) -> Result<Record, QuireError> {
        self.store.create(
            COMPONENT_ENTITY_TYPE,
            serde_json::to_value(component)?,
            Some(json!({ "workflowId": workflow_id, "step": step_index })),
        )
    }

    fn complete(&self, workflow: Workflow) -> Result<Workflow, QuireError> {
        let mut doc = workflow.document.clone();
        doc.status = WorkflowStatus::Completed;
        doc.phase = WorkflowPhase::Completed;
        doc.response_text = compose_summary(&doc);
        let done = self.commit(&workflow, doc)?;
        info!(id = %done.id, steps = done.document.step_results.len(), "workflow completed");
        Ok(done)
    }

    /// Lands the workflow in `failed`, re-reading once if the record moved.
    fn fail(&self, workflow: Workflow, error: String) -> Result<Workflow, QuireError> {
        if let Some(failed) = self.persist(&workflow, &failed_document(&workflow, &error))? {
            return Ok(failed);
        }
        let fresh = self.require(&workflow.id)?;
        if fresh.is_terminal() {
            return Ok(fresh);
        }
        let doc = failed_document(&fresh, &error);
        self.commit(&fresh, doc)
    }

    /// Compare-and-set the document; `None` when the record moved underneath.
    fn persist(
        &self,
        workflow: &Workflow,
        doc: &WorkflowDocument,
    ) -> Result<Option<Workflow>, QuireError> {
        let updated =
            self.store
                .update_if_version(&workflow.id, workflow.version, serde_json::to_value(doc)?)?;
        let updated = updated.map(Workflow::from_record).transpose()?;
        if updated.is_some() {
            self.notifier.fire();
        }
        Ok(updated)
    }

    fn commit(&self, workflow: &Workflow, doc: WorkflowDocument) -> Result<Workflow, QuireError> {
        self.persist(workflow, &doc)?.ok_or_else(|| {
            QuireError::WorkflowStateError(format!(
                "workflow {} changed concurrently",
                workflow.id
            ))
        })
    }
}

fn failed_document(workflow: &Workflow, error: &str) -> WorkflowDocument {
    let mut doc = workflow.document.clone();
    doc.status = WorkflowStatus::Failed;
    doc.phase = WorkflowPhase::Failed;
    doc.response_text = format!("Failed: {error}");
    doc.error = Some(error.to_string());
    doc
}

/// Steps may read workflow records but never write them, and raw writes
/// can't be scoped away from them, so both are refused before anything runs.
fn check_step_targets(plan: &ActionPlan) -> anyhow::Result<()> {
    for statement in plan.statements.iter().filter(|s| s.is_write()) {
        match statement {
            Statement::Raw { .. } => {
                anyhow::bail!("raw write statements are not allowed in workflow steps")
            }
            s if s.entity_type() == Some(WORKFLOW_ENTITY_TYPE) => {
                anyhow::bail!("workflow steps cannot write {WORKFLOW_ENTITY_TYPE} records")
            }
            _ => {}
        }
    }
    Ok(())
}

fn compose_summary(doc: &WorkflowDocument) -> String {
    let summary = doc
        .continuation
        .as_ref()
        .map(|c| c.plan.summary.trim().trim_end_matches('.').to_string())
        .unwrap_or_default();
    if doc.step_results.is_empty() {
        return format!("{summary}. Nothing to do.");
    }
    let details: Vec<&str> = doc
        .step_results
        .iter()
        .map(|r| r.message.as_str())
        .collect();
    format!("{summary}. {}", details.join(" "))
}
