//! Task state transitions.
//!
//! Every change the process loop makes to a task goes through [`transition`],
//! which also decides whether the loop moves on to the next task.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Task, TaskResult, TaskStatus};

/// What happened when the process loop handled a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `run` succeeded.
    Started,
    /// The external work is waiting or running.
    Pending,
    /// The external work completed successfully.
    Completed,
    /// The task failed permanently.
    Failed(String),
    /// The task failed transiently and is retried on the next pass.
    Transient(String),
}

impl Outcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Started => "started",
            Outcome::Pending => "pending",
            Outcome::Completed => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Transient(_) => "transient",
        }
    }
}

/// What the process loop does after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Stop advancing the job for this pass.
    Stop,
    /// Handle the next task in the same pass.
    Continue,
    /// Complete the job.
    EndJob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub note: String,
    pub stamp_start: bool,
    pub stamp_end: bool,
    pub flow: Flow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from} on {outcome}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub outcome: &'static str,
}

impl Transition {
    /// Write the transition onto a task.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        task.status = self.status;
        task.result = self.result;
        task.note = self.note.clone();
        if self.stamp_start {
            task.start = Some(now);
        }
        if self.stamp_end {
            task.end = Some(now);
        }
    }
}

pub fn transition(current: TaskStatus, outcome: &Outcome) -> Result<Transition, IllegalTransition> {
    use TaskStatus::*;

    let step = |status, result, note: &str, flow| Transition {
        status,
        result,
        note: note.to_string(),
        stamp_start: false,
        stamp_end: false,
        flow,
    };

    let transition = match (current, outcome) {
        (Planned, Outcome::Started) => Transition {
            stamp_start: true,
            ..step(Running, None, "", Flow::Stop)
        },
        (Planned, Outcome::Transient(note)) => {
            step(Planned, Some(TaskResult::Failed), note.as_str(), Flow::Stop)
        }
        (Planned | Waiting | Running, Outcome::Failed(note)) => Transition {
            stamp_end: true,
            ..step(Completed, Some(TaskResult::Failed), note.as_str(), Flow::EndJob)
        },
        (Waiting | Running, Outcome::Pending) => step(current, None, "", Flow::Stop),
        (Waiting | Running, Outcome::Completed) => Transition {
            stamp_end: true,
            ..step(Completed, Some(TaskResult::Ok), "", Flow::Continue)
        },
        (Waiting | Running, Outcome::Transient(note)) => {
            step(current, Some(TaskResult::Failed), note.as_str(), Flow::Stop)
        }
        _ => {
            return Err(IllegalTransition {
                from: current,
                outcome: outcome.label(),
            })
        }
    };

    Ok(transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start() {
        let t = transition(TaskStatus::Planned, &Outcome::Started).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.result, None);
        assert!(t.stamp_start);
        assert!(!t.stamp_end);
        assert_eq!(t.flow, Flow::Stop);
    }

    #[test]
    fn test_transient_keeps_status() {
        for status in [TaskStatus::Planned, TaskStatus::Waiting, TaskStatus::Running] {
            let t = transition(status, &Outcome::Transient("timeout".to_string())).unwrap();
            assert_eq!(t.status, status);
            assert_eq!(t.result, Some(TaskResult::Failed));
            assert_eq!(t.note, "timeout");
            assert_eq!(t.flow, Flow::Stop);
        }
    }

    #[test]
    fn test_pending_clears_note() {
        let t = transition(TaskStatus::Waiting, &Outcome::Pending).unwrap();
        assert_eq!(t.status, TaskStatus::Waiting);
        assert_eq!(t.result, None);
        assert_eq!(t.note, "");
        assert_eq!(t.flow, Flow::Stop);
    }

    #[test]
    fn test_completed_continues() {
        let t = transition(TaskStatus::Running, &Outcome::Completed).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result, Some(TaskResult::Ok));
        assert!(t.stamp_end);
        assert_eq!(t.flow, Flow::Continue);
    }

    #[test]
    fn test_failure_ends_job() {
        for status in [TaskStatus::Planned, TaskStatus::Running] {
            let t = transition(status, &Outcome::Failed("Collection is empty".to_string())).unwrap();
            assert_eq!(t.status, TaskStatus::Completed);
            assert_eq!(t.result, Some(TaskResult::Failed));
            assert_eq!(t.note, "Collection is empty");
            assert_eq!(t.flow, Flow::EndJob);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(transition(TaskStatus::Completed, &Outcome::Started).is_err());
        assert!(transition(TaskStatus::Completed, &Outcome::Completed).is_err());
        assert!(transition(TaskStatus::Planned, &Outcome::Pending).is_err());
        assert!(transition(TaskStatus::Planned, &Outcome::Completed).is_err());
        assert!(transition(TaskStatus::Running, &Outcome::Started).is_err());

        let err = transition(TaskStatus::Completed, &Outcome::Pending).unwrap_err();
        assert_eq!(err.to_string(), "no transition from COMPLETED on pending");
    }

    #[test]
    fn test_apply() {
        let mut task = crate::testing::fixtures::task(1, 1, 1, crate::job::TaskType::Collect);
        task.note = "old".to_string();
        let now = Utc::now();

        transition(TaskStatus::Planned, &Outcome::Started)
            .unwrap()
            .apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.start, Some(now));
        assert_eq!(task.end, None);
        assert_eq!(task.note, "");
    }
}
