//! Entity state machines.
//!
//! Pure transition logic for tasks, agents, sessions and planning sessions.
//! Nothing here touches the store; callers load an entity, apply a
//! transition and persist the result in a single write.

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Agent, AgentStatus, PlanningAnswer, PlanningSession, Session, SessionOutcome, Task,
    TaskStatus,
};
use chrono::{DateTime, Utc};

impl Task {
    /// Move the task to `status`, maintaining the lifecycle timestamps.
    ///
    /// `started_at` is set once, the first time the task enters `in_progress`.
    /// `completed_at` is set on entering `completed` or `failed`. Leaving the
    /// agent-holding statuses drops the agent reference.
    pub fn update_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        match status {
            TaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        if !status.holds_agent() {
            self.agent_id = None;
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Fails unless the task can be handed to an agent.
    pub fn ensure_dispatchable(&self) -> CoreResult<()> {
        if self.status.is_dispatchable() {
            return Ok(());
        }
        let reason = if self.status.is_terminal() {
            "is terminal"
        } else {
            "is already dispatched"
        };
        Err(CoreError::invalid_state(format!(
            "Task {} {} (status: {})",
            self.id, reason, self.status
        )))
    }

    /// Hand the task to `agent_id`.
    pub fn mark_dispatched(&mut self, agent_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        self.ensure_dispatchable()?;
        self.status = TaskStatus::Dispatched;
        self.agent_id = Some(agent_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Return a task to `pending` after its agent let go of it.
    ///
    /// Only tasks that were dispatched or in progress are reset; returns
    /// whether anything changed.
    pub fn return_to_pending(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.holds_agent() {
            return false;
        }
        self.update_status(TaskStatus::Pending, now);
        true
    }

    /// Attach a planning session and enter `planning`.
    pub fn link_planning_session(&mut self, planning_session_id: &str, now: DateTime<Utc>) {
        self.planning_session_id = Some(planning_session_id.to_string());
        self.update_status(TaskStatus::Planning, now);
    }
}

impl Agent {
    /// Make the agent busy with `task_id`.
    pub fn assign(&mut self, task_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != AgentStatus::Idle {
            return Err(CoreError::AgentUnavailable {
                agent_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = AgentStatus::Busy;
        self.current_task_id = Some(task_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Return the agent to idle. Returns the task it was holding, if any.
    pub fn release(&mut self, now: DateTime<Utc>) -> CoreResult<Option<String>> {
        if self.status == AgentStatus::Idle {
            return Err(CoreError::AlreadyIdle(self.id.clone()));
        }
        Ok(self.clear(now))
    }

    /// Unconditional release. No-op on an idle agent with no task.
    pub fn clear(&mut self, now: DateTime<Utc>) -> Option<String> {
        if self.status == AgentStatus::Idle && self.current_task_id.is_none() {
            return None;
        }
        self.status = AgentStatus::Idle;
        self.updated_at = now;
        self.current_task_id.take()
    }
}

impl PlanningSession {
    /// Append answers and recompute completion.
    ///
    /// Returns true if this submission completed the session.
    pub fn submit_answers(
        &mut self,
        answers: Vec<PlanningAnswer>,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        if self.completed {
            return Err(CoreError::invalid_state(format!(
                "Planning session {} is already completed",
                self.id
            )));
        }
        self.answers.extend(answers);
        if self.answers.len() >= self.questions.len() {
            self.completed = true;
            self.completed_at = Some(now);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn unanswered(&self) -> usize {
        self.questions.len().saturating_sub(self.answers.len())
    }
}

impl Session {
    /// End the session with an explicit terminal outcome.
    pub fn finish(
        &mut self,
        outcome: SessionOutcome,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::SessionAlreadyTerminal {
                session_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = outcome.status();
        if error_message.is_some() {
            self.error_message = error_message;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `failed` when an error message is given, otherwise `completed`.
    pub fn complete(&mut self, error_message: Option<String>, now: DateTime<Utc>) -> CoreResult<()> {
        let outcome = if error_message.is_some() {
            SessionOutcome::Failed
        } else {
            SessionOutcome::Completed
        };
        self.finish(outcome, error_message, now)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        self.finish(SessionOutcome::Cancelled, None, now)
    }

    pub fn append_output(&mut self, text: &str, now: DateTime<Utc>) {
        self.output.get_or_insert_with(String::new).push_str(text);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PlanningQuestion, QuestionType, SessionStatus, PRIORITY_DEFAULT};
    use chrono::Duration;

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: "t1".into(),
            title: "Write docs".into(),
            description: None,
            status,
            priority: PRIORITY_DEFAULT,
            agent_id: None,
            deliverables: Vec::new(),
            planning_session_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn agent(status: AgentStatus) -> Agent {
        let now = Utc::now();
        Agent {
            id: "a1".into(),
            name: "Ada".into(),
            role: "writer".into(),
            status,
            current_task_id: None,
            session_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: "s1".into(),
            agent_id: "a1".into(),
            task_id: "t1".into(),
            status: SessionStatus::Active,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn planning(questions: usize) -> PlanningSession {
        PlanningSession {
            id: "p1".into(),
            task_id: "t1".into(),
            questions: (0..questions)
                .map(|i| PlanningQuestion {
                    id: format!("q{i}"),
                    question: format!("Question {i}?"),
                    question_type: QuestionType::Text,
                    options: None,
                })
                .collect(),
            answers: Vec::new(),
            completed: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn answer(question_id: &str) -> PlanningAnswer {
        PlanningAnswer {
            question_id: question_id.into(),
            answer: "yes".into(),
            answered_at: Utc::now(),
        }
    }

    #[test]
    fn started_at_is_set_only_once() {
        let mut t = task(TaskStatus::Dispatched);
        t.agent_id = Some("a1".into());
        let first = Utc::now();
        t.update_status(TaskStatus::InProgress, first);
        assert_eq!(t.started_at, Some(first));

        t.update_status(TaskStatus::InProgress, first + Duration::seconds(30));
        assert_eq!(t.started_at, Some(first));
        assert_eq!(t.agent_id.as_deref(), Some("a1"));
    }

    #[test]
    fn completion_sets_completed_at_and_drops_agent() {
        let mut t = task(TaskStatus::InProgress);
        t.agent_id = Some("a1".into());
        let now = Utc::now();
        t.update_status(TaskStatus::Failed, now);
        assert_eq!(t.completed_at, Some(now));
        assert!(t.agent_id.is_none());
    }

    #[test]
    fn dispatch_rejected_from_terminal_and_dispatched() {
        assert!(task(TaskStatus::Completed).ensure_dispatchable().is_err());
        let err = task(TaskStatus::Dispatched).ensure_dispatchable().unwrap_err();
        assert!(err.to_string().contains("already dispatched"));
        assert!(task(TaskStatus::Planning).ensure_dispatchable().is_ok());
    }

    #[test]
    fn return_to_pending_only_for_held_tasks() {
        let mut t = task(TaskStatus::InProgress);
        t.agent_id = Some("a1".into());
        assert!(t.return_to_pending(Utc::now()));
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.agent_id.is_none());

        let mut t = task(TaskStatus::Ready);
        assert!(!t.return_to_pending(Utc::now()));
        assert_eq!(t.status, TaskStatus::Ready);
    }

    #[test]
    fn assign_requires_idle_agent() {
        let mut a = agent(AgentStatus::Idle);
        a.assign("t1", Utc::now()).unwrap();
        assert_eq!(a.status, AgentStatus::Busy);
        assert_eq!(a.current_task_id.as_deref(), Some("t1"));

        let err = a.assign("t2", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::AgentUnavailable {
                status: AgentStatus::Busy,
                ..
            }
        ));

        let mut offline = agent(AgentStatus::Offline);
        assert!(offline.assign("t1", Utc::now()).is_err());
    }

    #[test]
    fn release_idle_agent_fails() {
        let mut a = agent(AgentStatus::Idle);
        assert!(matches!(
            a.release(Utc::now()),
            Err(CoreError::AlreadyIdle(_))
        ));
    }

    #[test]
    fn release_returns_held_task() {
        let mut a = agent(AgentStatus::Idle);
        a.assign("t1", Utc::now()).unwrap();
        let released = a.release(Utc::now()).unwrap();
        assert_eq!(released.as_deref(), Some("t1"));
        assert_eq!(a.status, AgentStatus::Idle);
        assert!(a.current_task_id.is_none());
    }

    #[test]
    fn clear_is_noop_on_idle_agent() {
        let mut a = agent(AgentStatus::Idle);
        let before = a.updated_at;
        assert_eq!(a.clear(before + Duration::seconds(5)), None);
        assert_eq!(a.updated_at, before);
    }

    #[test]
    fn answers_accumulate_across_submissions() {
        let mut p = planning(2);
        let done = p.submit_answers(vec![answer("q0")], Utc::now()).unwrap();
        assert!(!done);
        assert!(!p.completed);
        assert_eq!(p.unanswered(), 1);

        let now = Utc::now();
        let done = p.submit_answers(vec![answer("q1")], now).unwrap();
        assert!(done);
        assert!(p.completed);
        assert_eq!(p.completed_at, Some(now));
        let ids: Vec<_> = p.answers.iter().map(|a| a.question_id.as_str()).collect();
        assert_eq!(ids, ["q0", "q1"]);
    }

    #[test]
    fn over_answering_completes() {
        let mut p = planning(1);
        assert!(
            p.submit_answers(vec![answer("q0"), answer("q0")], Utc::now())
                .unwrap()
        );
        assert!(p.completed);
    }

    #[test]
    fn submitting_to_completed_session_is_rejected() {
        let mut p = planning(1);
        let now = Utc::now();
        p.submit_answers(vec![answer("q0")], now).unwrap();
        let err = p
            .submit_answers(vec![answer("q0")], now + Duration::seconds(1))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(p.answers.len(), 1);
        assert_eq!(p.completed_at, Some(now));
    }

    #[test]
    fn complete_with_error_fails_session() {
        let mut s = session();
        s.complete(Some("boom".into()), Utc::now()).unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.error_message.as_deref(), Some("boom"));
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn cancel_leaves_error_message_untouched() {
        let mut s = session();
        s.cancel(Utc::now()).unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
        assert!(s.error_message.is_none());
    }

    #[test]
    fn terminal_sessions_never_move() {
        let mut s = session();
        s.complete(None, Utc::now()).unwrap();
        let err = s.cancel(Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::SessionAlreadyTerminal {
                status: SessionStatus::Completed,
                ..
            }
        ));
        assert_eq!(s.status, SessionStatus::Completed);
    }

    #[test]
    fn output_appends_from_null() {
        let mut s = session();
        s.append_output("hello", Utc::now());
        s.append_output(" world", Utc::now());
        assert_eq!(s.output.as_deref(), Some("hello world"));
    }
}
