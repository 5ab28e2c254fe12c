//! REST handlers for tasks, agents, sessions and the gateway.
//!
//! Handlers validate request shape, call into the orchestrator or store and
//! wrap the result in the response envelope. State rules live below this layer.

use super::response::{ApiError, ApiResult, created, ok, ok_with};
use super::server::AppState;
use crate::error::CoreError;
use crate::gateway::GatewayStatus;
use crate::orchestrator::DispatchRequest;
use crate::types::{
    Agent, AgentStatus, CreateAgentInput, CreateTaskInput, MAX_NAME_LEN, NewPlanningAnswer,
    NewPlanningQuestion, PRIORITY_MAX, PRIORITY_MIN, Priority, Session, Task, TaskFilter,
    TaskStatus, UpdateAgentInput, UpdateTaskInput,
};
use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// =============================================================================
// Validation
// =============================================================================

fn check_name(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::validation(
            field,
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

fn check_priority(priority: Priority) -> Result<(), CoreError> {
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
        return Err(CoreError::validation(
            "priority",
            format!("must be between {PRIORITY_MIN} and {PRIORITY_MAX}"),
        ));
    }
    Ok(())
}

fn check_questions(questions: &[NewPlanningQuestion]) -> Result<(), CoreError> {
    if questions.is_empty() {
        return Err(CoreError::validation("questions", "at least one question is required"));
    }
    if questions.iter().any(|q| q.question.trim().is_empty()) {
        return Err(CoreError::validation("questions", "question text must not be empty"));
    }
    Ok(())
}

fn check_answers(answers: &[NewPlanningAnswer]) -> Result<(), CoreError> {
    if answers.is_empty() {
        return Err(CoreError::validation("answers", "at least one answer is required"));
    }
    if answers.iter().any(|a| a.question_id.is_empty()) {
        return Err(CoreError::validation("answers", "question_id must not be empty"));
    }
    Ok(())
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(value)| value).map_err(ApiError::from)
}

/// Parse a body that may be omitted entirely.
fn optional_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError(CoreError::validation("body", e.to_string())))
}

fn found<T>(value: Option<T>, missing: impl FnOnce() -> CoreError) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError(missing()))
}

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    status: Option<String>,
    agent_id: Option<String>,
    priority: Option<String>,
}

impl TaskQuery {
    fn into_filter(self) -> Result<TaskFilter, CoreError> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| {
                TaskStatus::from_str(&s)
                    .ok_or_else(|| CoreError::validation("status", format!("unknown status '{s}'")))
            })
            .transpose()?;
        let priority = self
            .priority
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<Priority>()
                    .map_err(|_| CoreError::validation("priority", "must be an integer"))
            })
            .transpose()?;
        Ok(TaskFilter {
            status,
            agent_id: self.agent_id.filter(|a| !a.is_empty()),
            priority,
        })
    }
}

#[derive(Serialize)]
struct TaskList {
    tasks: Vec<Task>,
    total: usize,
}

pub async fn list_tasks(State(state): State<AppState>, Query(query): Query<TaskQuery>) -> ApiResult {
    let filter = query.into_filter()?;
    let tasks = state.db().list_tasks(&filter)?;
    Ok(ok(TaskList {
        total: tasks.len(),
        tasks,
    }))
}

pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskInput>, JsonRejection>,
) -> ApiResult {
    let input = body(payload)?;
    check_name("title", &input.title)?;
    if let Some(priority) = input.priority {
        check_priority(priority)?;
    }
    let task = state.db().create_task(input)?;
    tracing::info!(task_id = %task.id, title = %task.title, "Task created");
    Ok(created(task, "Task created successfully"))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = found(state.db().get_task(&id)?, || CoreError::task_not_found(&id))?;
    Ok(ok(task))
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateTaskInput>, JsonRejection>,
) -> ApiResult {
    let input = body(payload)?;
    if let Some(title) = &input.title {
        check_name("title", title)?;
    }
    if let Some(priority) = input.priority {
        check_priority(priority)?;
    }
    let task = state.orchestrator.update_task(&id, input)?;
    Ok(ok_with(task, "Task updated successfully"))
}

pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = state.orchestrator.delete_task(&id)?;
    Ok(ok_with(
        serde_json::json!({ "id": task.id }),
        "Task deleted successfully",
    ))
}

pub async fn dispatch_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    raw: Bytes,
) -> ApiResult {
    let request: DispatchRequest = optional_body(&raw)?;
    let outcome = state.orchestrator.dispatch(&id, request)?;
    let message = if outcome.spawned {
        "Task dispatched and agent spawned"
    } else {
        "Task dispatched; agent spawn queued until the gateway is available"
    };
    Ok(ok_with(outcome, message))
}

pub async fn get_planning(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    found(state.db().get_task(&id)?, || CoreError::task_not_found(&id))?;
    let planning = found(state.db().get_planning_session_by_task(&id)?, || {
        CoreError::planning_session_not_found(&format!("task {id}"))
    })?;
    Ok(ok(planning))
}

/// Either `questions` (start) or `answers` (submit).
#[derive(Debug, Deserialize)]
pub struct PlanningRequest {
    #[serde(default)]
    questions: Option<Vec<NewPlanningQuestion>>,
    #[serde(default)]
    answers: Option<Vec<NewPlanningAnswer>>,
}

pub async fn post_planning(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<PlanningRequest>, JsonRejection>,
) -> ApiResult {
    match body(payload)? {
        PlanningRequest {
            questions: Some(questions),
            ..
        } => {
            check_questions(&questions)?;
            let planning = state.orchestrator.start_planning(&id, questions)?;
            Ok(created(planning, "Planning session started"))
        }
        PlanningRequest {
            answers: Some(answers),
            ..
        } => {
            check_answers(&answers)?;
            let planning = state.orchestrator.submit_answers(&id, answers)?;
            let message = if planning.completed {
                "Planning completed"
            } else {
                "Answers submitted"
            };
            Ok(ok_with(planning, message))
        }
        _ => Err(ApiError(CoreError::validation(
            "questions",
            "provide either questions or answers",
        ))),
    }
}

#[derive(Serialize)]
struct SessionList {
    sessions: Vec<Session>,
    total: usize,
}

impl From<Vec<Session>> for SessionList {
    fn from(sessions: Vec<Session>) -> Self {
        Self {
            total: sessions.len(),
            sessions,
        }
    }
}

pub async fn task_sessions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    found(state.db().get_task(&id)?, || CoreError::task_not_found(&id))?;
    let sessions = state.db().list_sessions_by_task(&id)?;
    Ok(ok(SessionList::from(sessions)))
}

// =============================================================================
// Agents
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    status: Option<String>,
}

#[derive(Serialize)]
struct AgentList {
    agents: Vec<Agent>,
    total: usize,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> ApiResult {
    let status = query
        .status
        .filter(|s| !s.is_empty())
        .map(|s| {
            AgentStatus::from_str(&s)
                .ok_or_else(|| CoreError::validation("status", format!("unknown status '{s}'")))
        })
        .transpose()?;
    let agents = state.db().list_agents(status)?;
    Ok(ok(AgentList {
        total: agents.len(),
        agents,
    }))
}

pub async fn create_agent(
    State(state): State<AppState>,
    payload: Result<Json<CreateAgentInput>, JsonRejection>,
) -> ApiResult {
    let input = body(payload)?;
    check_name("name", &input.name)?;
    check_name("role", &input.role)?;
    let agent = state.db().create_agent(input)?;
    tracing::info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
    Ok(created(agent, "Agent created successfully"))
}

pub async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let agent = found(state.db().get_agent(&id)?, || CoreError::agent_not_found(&id))?;
    Ok(ok(agent))
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateAgentInput>, JsonRejection>,
) -> ApiResult {
    let input = body(payload)?;
    if let Some(name) = &input.name {
        check_name("name", name)?;
    }
    if let Some(role) = &input.role {
        check_name("role", role)?;
    }
    let agent = state.db().update_agent(&id, input)?;
    Ok(ok_with(agent, "Agent updated successfully"))
}

#[derive(Serialize)]
struct AgentStatusSummary {
    id: String,
    name: String,
    role: String,
    status: AgentStatus,
    current_task_id: Option<String>,
    updated_at: DateTime<Utc>,
}

pub async fn agent_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let agent = found(state.db().get_agent(&id)?, || CoreError::agent_not_found(&id))?;
    Ok(ok(AgentStatusSummary {
        id: agent.id,
        name: agent.name,
        role: agent.role,
        status: agent.status,
        current_task_id: agent.current_task_id,
        updated_at: agent.updated_at,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    release: bool,
}

#[derive(Serialize)]
struct Assigned {
    agent: Agent,
    task: Task,
}

#[derive(Serialize)]
struct Released {
    agent: Agent,
    released: bool,
    task: Option<Task>,
    cancelled_sessions: Vec<String>,
}

pub async fn assign_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<AssignRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    if request.release {
        let release = state.orchestrator.release(&id)?;
        return Ok(ok_with(
            Released {
                agent: release.agent,
                released: true,
                task: release.task,
                cancelled_sessions: release.cancelled_sessions,
            },
            "Agent released from current task",
        ));
    }

    let task_id = request
        .task_id
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CoreError::validation("task_id", "required when not releasing"))?;
    let (agent, task) = state.orchestrator.assign(&id, &task_id)?;
    Ok(ok_with(
        Assigned { agent, task },
        "Task assigned to agent successfully",
    ))
}

pub async fn agent_sessions(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    found(state.db().get_agent(&id)?, || CoreError::agent_not_found(&id))?;
    let sessions = state.db().list_sessions_by_agent(&id)?;
    Ok(ok(SessionList::from(sessions)))
}

// =============================================================================
// Sessions
// =============================================================================

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = found(state.db().get_session(&id)?, || CoreError::session_not_found(&id))?;
    Ok(ok(session))
}

#[derive(Debug, Deserialize)]
pub struct OutputRequest {
    output: String,
}

pub async fn append_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<OutputRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    let session = state.db().append_session_output(&id, &request.output)?;
    Ok(ok(session))
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    error: Option<String>,
}

pub async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    raw: Bytes,
) -> ApiResult {
    let request: CompleteRequest = optional_body(&raw)?;
    let error = request.error.filter(|e| !e.is_empty());
    let session = state.orchestrator.complete_session(&id, error)?;
    Ok(ok_with(session, "Session completed"))
}

pub async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.orchestrator.cancel_session(&id)?;
    Ok(ok_with(session, "Session cancelled"))
}

// =============================================================================
// Gateway and health
// =============================================================================

#[derive(Serialize)]
struct GatewayReport {
    enabled: bool,
    url: Option<String>,
    #[serde(flatten)]
    status: GatewayStatus,
}

pub async fn gateway_status(State(state): State<AppState>) -> ApiResult {
    let report = match &state.gateway {
        Some(gateway) => GatewayReport {
            enabled: true,
            url: Some(gateway.options().url.clone()),
            status: gateway.status(),
        },
        None => GatewayReport {
            enabled: false,
            url: None,
            status: GatewayStatus::disconnected(),
        },
    };
    Ok(ok(report))
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> ApiResult {
    Ok(ok(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(check_name("title", "Write spec").is_ok());
        assert!(check_name("title", "   ").is_err());
        assert!(check_name("title", &"x".repeat(MAX_NAME_LEN)).is_ok());
        let err = check_name("title", &"x".repeat(MAX_NAME_LEN + 1)).unwrap_err();
        assert_eq!(err.field(), Some("title"));
    }

    #[test]
    fn priority_bounds() {
        assert!(check_priority(1).is_ok());
        assert!(check_priority(10).is_ok());
        assert!(check_priority(0).is_err());
        assert!(check_priority(11).is_err());
    }

    #[test]
    fn task_query_rejects_unknown_status() {
        let query = TaskQuery {
            status: Some("sleeping".into()),
            ..Default::default()
        };
        assert!(query.into_filter().is_err());

        let query = TaskQuery {
            status: Some("in_progress".into()),
            priority: Some("8".into()),
            agent_id: Some(String::new()),
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.status, Some(TaskStatus::InProgress));
        assert_eq!(filter.priority, Some(8));
        assert!(filter.agent_id.is_none());
    }

    #[test]
    fn empty_optional_body_uses_defaults() {
        let request: DispatchRequest = optional_body(&Bytes::from_static(b"")).unwrap();
        assert!(request.auto_assign);
        assert!(request.agent_id.is_none());

        let request: DispatchRequest =
            optional_body(&Bytes::from_static(br#"{"agent_id":"a1","auto_assign":false}"#))
                .unwrap();
        assert_eq!(request.agent_id.as_deref(), Some("a1"));
        assert!(!request.auto_assign);
    }
}
