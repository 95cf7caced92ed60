//! Pure milestone progress transitions.
//!
//! Transitions take the current milestone and an event and return the new
//! milestone together with whether anything changed, so callers can skip
//! writes for no-op events. Nothing here performs I/O.

use serde::Serialize;

use crate::model::{CommitSha, Milestone, Project};
use crate::verdict::CommitVerdict;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilestoneEvent {
    /// A learner (or mentor) ticked or unticked a goal.
    GoalToggled { goal: String, completed: bool },
    /// An evaluation verdict passed the confidence gate.
    VerdictAccepted { verdict: CommitVerdict },
    /// A commit carrying the milestone's signature was found.
    CommitDetected { sha: CommitSha },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub milestone: Milestone,
    pub changed: bool,
}

impl TransitionResult {
    fn from_before(before: &Milestone, milestone: Milestone) -> Self {
        let changed = *before != milestone;
        Self { milestone, changed }
    }
}

pub fn transition(milestone: &Milestone, event: &MilestoneEvent) -> TransitionResult {
    let mut next = milestone.clone();

    match event {
        MilestoneEvent::GoalToggled { goal, completed } => {
            if *completed {
                next.completed_goals.insert(goal.clone());
            } else {
                next.completed_goals.remove(goal);
            }
            next.completed = next.all_goals_completed();
        }
        MilestoneEvent::VerdictAccepted { verdict } => {
            for achieved in verdict.achieved_goals() {
                let achieved = achieved.trim();
                if let Some(declared) = next.goals.iter().find(|g| g.trim() == achieved) {
                    next.completed_goals.insert(declared.clone());
                }
            }
            next.completed = true;
        }
        MilestoneEvent::CommitDetected { sha } => {
            next.detected = true;
            next.commit_sha = Some(sha.clone());
        }
    }

    TransitionResult::from_before(milestone, next)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectResult {
    pub project: Project,
    /// Milestones whose `completed` flag was cleared.
    pub milestones_reset: usize,
}

/// Drop the repository connection and clear every milestone's `completed`
/// flag. Goal progress and detection are kept.
pub fn disconnect_repository(project: &Project) -> DisconnectResult {
    let mut next = project.clone();
    next.connection = None;

    let mut milestones_reset = 0;
    for milestone in &mut next.milestones {
        if milestone.completed {
            milestone.completed = false;
            milestones_reset += 1;
        }
    }

    DisconnectResult {
        project: next,
        milestones_reset,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MilestoneStatus {
    /// An earlier milestone is still open.
    Pending,
    Active,
    /// Active, and a matching commit has been found.
    Detected,
    Completed,
}

fn status_of(project: &Project, index: usize) -> Option<MilestoneStatus> {
    let milestone = project.milestones.get(index)?;
    let status = if milestone.completed {
        MilestoneStatus::Completed
    } else if project.active_milestone_index() == Some(index) {
        if milestone.detected {
            MilestoneStatus::Detected
        } else {
            MilestoneStatus::Active
        }
    } else {
        MilestoneStatus::Pending
    };
    Some(status)
}

/// Derived status of every milestone, in declared order.
pub fn statuses(project: &Project) -> Vec<MilestoneStatus> {
    (0..project.milestones.len())
        .filter_map(|i| status_of(project, i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectId, RepositoryConnection};
    use crate::verdict::GoalAssessment;
    use proptest::prelude::*;

    fn toggle(goal: &str, completed: bool) -> MilestoneEvent {
        MilestoneEvent::GoalToggled {
            goal: goal.to_string(),
            completed,
        }
    }

    fn verdict(achieved: &[(&str, bool)]) -> CommitVerdict {
        let mut verdict = CommitVerdict::degraded(&[]);
        verdict.should_complete = true;
        verdict.confidence_score = 90;
        verdict.goals_achieved = achieved
            .iter()
            .map(|(goal, achieved)| GoalAssessment {
                goal: goal.to_string(),
                achieved: *achieved,
                explanation: String::new(),
            })
            .collect();
        verdict
    }

    fn project() -> Project {
        Project {
            id: ProjectId::parse("65f1a2b3c4d5e6f708192a3b").unwrap(),
            title: "Todo".to_string(),
            description: String::new(),
            milestones: vec![
                Milestone::new("Setup", "init").with_goals(["Create repo", "Add README"]),
                Milestone::new("Auth", "add login").with_goals(["Login form"]),
            ],
            connection: Some(RepositoryConnection {
                owner: "octo".to_string(),
                name: "todo".to_string(),
                full_name: Some("octo/todo".to_string()),
                default_branch: Some("main".to_string()),
                html_url: None,
                connected_at: chrono::Utc::now(),
            }),
            context: None,
        }
    }

    #[test]
    fn test_toggling_all_goals_completes() {
        let m = Milestone::new("Setup", "init").with_goals(["A", "B"]);
        let m = transition(&m, &toggle("A", true)).milestone;
        assert!(!m.completed);
        let m = transition(&m, &toggle("B", true)).milestone;
        assert!(m.completed);
        let m = transition(&m, &toggle("A", false)).milestone;
        assert!(!m.completed);
    }

    #[test]
    fn test_toggle_preserves_detected() {
        let mut m = Milestone::new("Setup", "init").with_goals(["A"]);
        m.detected = true;
        let result = transition(&m, &toggle("A", true));
        assert!(result.milestone.detected);
        assert!(result.changed);
    }

    #[test]
    fn test_repeated_toggle_is_no_op() {
        let m = Milestone::new("Setup", "init").with_goals(["A", "B"]);
        let once = transition(&m, &toggle("A", true)).milestone;
        let twice = transition(&once, &toggle("A", true));
        assert!(!twice.changed);
    }

    #[test]
    fn test_verdict_completes_and_unions_declared_goals() {
        let mut m = Milestone::new("Setup", "init").with_goals(["Create repo", "Add README"]);
        m.completed_goals.insert("Add README".to_string());

        let result = transition(
            &m,
            &MilestoneEvent::VerdictAccepted {
                verdict: verdict(&[(" Create repo ", true), ("Invented goal", true)]),
            },
        );

        assert!(result.milestone.completed);
        assert_eq!(
            result.milestone.completed_goals.iter().collect::<Vec<_>>(),
            vec!["Add README", "Create repo"]
        );
    }

    #[test]
    fn test_verdict_completes_even_with_unachieved_goals() {
        let m = Milestone::new("Setup", "init").with_goals(["A", "B"]);
        let result = transition(
            &m,
            &MilestoneEvent::VerdictAccepted {
                verdict: verdict(&[("A", true), ("B", false)]),
            },
        );
        assert!(result.milestone.completed);
        assert!(!result.milestone.completed_goals.contains("B"));
    }

    #[test]
    fn test_commit_detected_leaves_goals_alone() {
        let m = Milestone::new("Setup", "init").with_goals(["A"]);
        let result = transition(
            &m,
            &MilestoneEvent::CommitDetected {
                sha: CommitSha::from("abc1234"),
            },
        );
        assert!(result.milestone.detected);
        assert_eq!(result.milestone.commit_sha, Some(CommitSha::from("abc1234")));
        assert!(!result.milestone.completed);
        assert!(result.milestone.completed_goals.is_empty());
    }

    #[test]
    fn test_two_milestone_activation() {
        let mut project = project();
        assert_eq!(
            statuses(&project),
            vec![MilestoneStatus::Active, MilestoneStatus::Pending]
        );

        project.milestones[0] = transition(
            &project.milestones[0],
            &MilestoneEvent::CommitDetected {
                sha: CommitSha::from("abc1234"),
            },
        )
        .milestone;
        assert_eq!(status_of(&project, 0), Some(MilestoneStatus::Detected));

        for goal in ["Create repo", "Add README"] {
            project.milestones[0] = transition(&project.milestones[0], &toggle(goal, true)).milestone;
        }
        assert_eq!(
            statuses(&project),
            vec![MilestoneStatus::Completed, MilestoneStatus::Active]
        );
    }

    #[test]
    fn test_disconnect_preserves_goal_progress() {
        let mut project = project();
        project.milestones[0].completed_goals =
            ["Create repo", "Add README"].iter().map(|g| g.to_string()).collect();
        project.milestones[0].completed = true;
        project.milestones[0].detected = true;

        let result = disconnect_repository(&project);

        assert!(result.project.connection.is_none());
        assert_eq!(result.milestones_reset, 1);
        assert!(result.project.milestones.iter().all(|m| !m.completed));
        assert_eq!(result.project.milestones[0].completed_goals.len(), 2);
        assert!(result.project.milestones[0].detected);
    }

    fn arb_events() -> impl Strategy<Value = Vec<(usize, bool)>> {
        proptest::collection::vec((0usize..4, any::<bool>()), 0..30)
    }

    proptest! {
        /// After any toggle sequence, `completed` holds exactly when every
        /// declared goal is ticked.
        #[test]
        fn toggles_keep_completion_consistent(events in arb_events()) {
            let goals = ["A", "B", "C", "D"];
            let mut m = Milestone::new("M", "sig").with_goals(goals);
            for (i, completed) in events {
                m = transition(&m, &toggle(goals[i], completed)).milestone;
                let all = goals.iter().all(|g| m.completed_goals.contains(*g));
                prop_assert_eq!(m.completed, all);
                prop_assert!(m.completed_goals.iter().all(|g| m.declares_goal(g)));
            }
        }

        /// Applying the same verdict twice converges.
        #[test]
        fn verdict_application_is_idempotent(flags in proptest::collection::vec(any::<bool>(), 3)) {
            let m = Milestone::new("M", "sig").with_goals(["A", "B", "C"]);
            let v = verdict(&[("A", flags[0]), ("B", flags[1]), ("C", flags[2])]);
            let event = MilestoneEvent::VerdictAccepted { verdict: v };
            let once = transition(&m, &event).milestone;
            let twice = transition(&once, &event);
            prop_assert!(!twice.changed);
            prop_assert_eq!(once, twice.milestone);
        }
    }
}
