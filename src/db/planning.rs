//! Planning session operations.

use super::{Database, new_id, now};
use crate::error::{CoreError, CoreResult};
use crate::types::{
    NewPlanningAnswer, NewPlanningQuestion, PlanningAnswer, PlanningQuestion, PlanningSession,
    TaskStatus,
};
use tracing::debug;

impl Database {
    pub fn get_planning_session(&self, id: &str) -> CoreResult<Option<PlanningSession>> {
        self.with_data(|data| {
            Ok(data
                .planning_sessions
                .iter()
                .find(|p| p.id == id)
                .cloned())
        })
    }

    pub fn get_planning_session_by_task(
        &self,
        task_id: &str,
    ) -> CoreResult<Option<PlanningSession>> {
        self.with_data(|data| {
            Ok(data
                .planning_sessions
                .iter()
                .find(|p| p.task_id == task_id)
                .cloned())
        })
    }

    /// Start planning on a task.
    ///
    /// The task must be pending, ready or planning and must not have an
    /// incomplete planning session. A completed session is replaced. The new
    /// session is linked to the task and the task moves to `planning`.
    pub fn create_planning_session(
        &self,
        task_id: &str,
        questions: Vec<NewPlanningQuestion>,
    ) -> CoreResult<PlanningSession> {
        let now = now();
        self.with_data_mut(|data| {
            let task = data.task(task_id)?;
            if !task.status.is_dispatchable() {
                return Err(CoreError::invalid_state(format!(
                    "Task {} is {} and cannot enter planning",
                    task.id, task.status
                )));
            }
            if let Some(existing) = data.planning_sessions.iter().find(|p| p.task_id == task_id) {
                if !existing.completed {
                    return Err(CoreError::invalid_state(format!(
                        "Task {} already has an incomplete planning session ({})",
                        task_id, existing.id
                    )));
                }
                debug!(task_id, replaced = %existing.id, "Replacing completed planning session");
            }
            data.planning_sessions.retain(|p| p.task_id != task_id);

            let session = PlanningSession {
                id: new_id(),
                task_id: task_id.to_string(),
                questions: questions
                    .into_iter()
                    .map(|q| PlanningQuestion {
                        id: q.id.filter(|id| !id.is_empty()).unwrap_or_else(new_id),
                        question: q.question,
                        question_type: q.question_type,
                        options: q.options,
                    })
                    .collect(),
                answers: Vec::new(),
                completed: false,
                created_at: now,
                completed_at: None,
            };
            data.planning_sessions.push(session.clone());
            data.task_mut(task_id)?
                .link_planning_session(&session.id, now);
            Ok(session)
        })
    }

    /// Append answers to a planning session.
    ///
    /// When the answers complete the session, a task still in `planning`
    /// moves to `ready` in the same write.
    pub fn submit_planning_answers(
        &self,
        id: &str,
        answers: Vec<NewPlanningAnswer>,
    ) -> CoreResult<PlanningSession> {
        let now = now();
        self.with_data_mut(|data| {
            let session = data.planning_session_mut(id)?;
            let answers = answers
                .into_iter()
                .map(|a| PlanningAnswer {
                    question_id: a.question_id,
                    answer: a.answer,
                    answered_at: a.answered_at.unwrap_or(now),
                })
                .collect();
            let completed = session.submit_answers(answers, now)?;
            let session = session.clone();

            if completed
                && let Ok(task) = data.task_mut(&session.task_id)
                && task.status == TaskStatus::Planning
            {
                task.update_status(TaskStatus::Ready, now);
            }
            Ok(session)
        })
    }

    /// Delete a planning session and unlink it from its task.
    ///
    /// A task still in `planning` returns to `pending`.
    pub fn delete_planning_session(&self, id: &str) -> CoreResult<PlanningSession> {
        let now = now();
        self.with_data_mut(|data| {
            let idx = data
                .planning_sessions
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| CoreError::planning_session_not_found(id))?;
            let session = data.planning_sessions.remove(idx);

            if let Ok(task) = data.task_mut(&session.task_id)
                && task.planning_session_id.as_deref() == Some(id)
            {
                task.planning_session_id = None;
                if task.status == TaskStatus::Planning {
                    task.update_status(TaskStatus::Pending, now);
                } else {
                    task.updated_at = now;
                }
            }
            Ok(session)
        })
    }
}
