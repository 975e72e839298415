//! Entity status values, transition rules, and derived scene status.
//!
//! Every plan node that carries a `status` (asset, keyframe, video, scene,
//! segment, final video) uses [`Status`]. Transitions only move forward;
//! the single exception is an explicit operator regeneration, which goes
//! through [`Status::reset`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle status of a plan entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Generated,
    Approved,
    Failed,
}

/// All status values, in lifecycle order.
pub const ALL_STATUSES: [Status; 5] = [
    Status::Pending,
    Status::InProgress,
    Status::Generated,
    Status::Approved,
    Status::Failed,
];

impl Status {
    /// Wire name used in the plan document.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Generated => "generated",
            Self::Approved => "approved",
            Self::Failed => "failed",
        }
    }

    /// `true` for `generated` and `approved`: the entity needs no more work
    /// and a stage run skips it.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Generated | Self::Approved)
    }

    /// Single-character marker used by the status summary.
    pub fn icon(self) -> char {
        match self {
            Self::Approved => '+',
            Self::Generated => 'o',
            Self::Failed => 'x',
            Self::Pending | Self::InProgress => '.',
        }
    }

    /// Whether moving from `self` to `next` is an allowed automatic
    /// transition.
    ///
    /// Staying in place is always allowed. `failed` may re-enter
    /// `in_progress` so a later run can retry the entity.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Generated)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Generated, Approved)
        )
    }

    /// Validate a transition, returning the new status on success.
    pub fn transition(self, next: Status) -> Result<Status, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Operator-driven reset used by regeneration. Always yields `pending`.
    pub fn reset(self) -> Status {
        Status::Pending
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute a scene's status from its segment statuses.
///
/// Precedence: any `failed` wins, then any `in_progress`, then all
/// `approved`, then all generated-or-approved. Everything else (including
/// a scene without segments) is `pending`.
pub fn derive_scene_status<I>(segments: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let statuses: Vec<Status> = segments.into_iter().collect();
    if statuses.is_empty() {
        return Status::Pending;
    }
    if statuses.contains(&Status::Failed) {
        return Status::Failed;
    }
    if statuses.contains(&Status::InProgress) {
        return Status::InProgress;
    }
    if statuses.iter().all(|s| *s == Status::Approved) {
        return Status::Approved;
    }
    if statuses.iter().all(|s| s.is_done()) {
        return Status::Generated;
    }
    Status::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: Status = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(parsed, Status::Approved);
    }

    #[test]
    fn done_statuses() {
        assert!(Status::Generated.is_done());
        assert!(Status::Approved.is_done());
        assert!(!Status::Pending.is_done());
        assert!(!Status::InProgress.is_done());
        assert!(!Status::Failed.is_done());
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(Status::Pending.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Generated));
        assert!(Status::InProgress.can_transition_to(Status::Failed));
        assert!(Status::Generated.can_transition_to(Status::Approved));
        assert!(Status::Failed.can_transition_to(Status::InProgress));
    }

    #[test]
    fn regressions_rejected() {
        assert!(!Status::Generated.can_transition_to(Status::Pending));
        assert!(!Status::Approved.can_transition_to(Status::Generated));
        assert!(!Status::Generated.can_transition_to(Status::InProgress));
        assert!(!Status::Approved.can_transition_to(Status::Failed));
        assert!(Status::Approved.transition(Status::Pending).is_err());
    }

    #[test]
    fn reset_always_pending() {
        for status in ALL_STATUSES {
            assert_eq!(status.reset(), Status::Pending);
        }
    }

    #[test]
    fn empty_scene_is_pending() {
        assert_eq!(derive_scene_status([]), Status::Pending);
    }

    #[test]
    fn failed_wins_over_approved() {
        let s = derive_scene_status([Status::Approved, Status::Failed, Status::Approved]);
        assert_eq!(s, Status::Failed);
    }

    /// Exhaustive check over every combination of three segment statuses.
    #[test]
    fn derived_status_matches_rules_for_all_combinations() {
        for a in ALL_STATUSES {
            for b in ALL_STATUSES {
                for c in ALL_STATUSES {
                    let set = [a, b, c];
                    let derived = derive_scene_status(set);

                    let any_failed = set.contains(&Status::Failed);
                    let any_running = set.contains(&Status::InProgress);
                    let all_approved = set.iter().all(|s| *s == Status::Approved);
                    let all_done = set.iter().all(|s| s.is_done());

                    assert_eq!(derived == Status::Failed, any_failed, "{set:?}");
                    assert_eq!(
                        derived == Status::InProgress,
                        any_running && !any_failed,
                        "{set:?}"
                    );
                    assert_eq!(derived == Status::Approved, all_approved, "{set:?}");
                    assert_eq!(
                        derived == Status::Generated,
                        all_done && !all_approved,
                        "{set:?}"
                    );
                }
            }
        }
    }
}
