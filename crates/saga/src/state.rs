//! Saga status machine.

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The status of a saga in its lifecycle.
///
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► CompensationFailed
/// ```
///
/// `Completed` and `CompensationFailed` may re-enter `Compensating` through an
/// explicit manual compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Compensating,
    Compensated,
    CompensationFailed,
}

/// Something that moves a saga from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaTransition {
    Start,
    Complete,
    BeginCompensation,
    FinishCompensation { all_succeeded: bool },
}

impl SagaStatus {
    /// Applies a transition, rejecting anything the lifecycle does not allow.
    pub fn transition(self, transition: SagaTransition) -> Result<SagaStatus, SagaError> {
        use SagaStatus::*;
        use SagaTransition::*;

        let next = match (self, transition) {
            (Pending, Start) => Running,
            (Running, Complete) => Completed,
            (Pending | Running | Completed | CompensationFailed, BeginCompensation) => {
                Compensating
            }
            (Compensating, FinishCompensation { all_succeeded: true }) => Compensated,
            (Compensating, FinishCompensation { all_succeeded: false }) => CompensationFailed,
            (
                Pending | Running | Completed | Compensating | Compensated | CompensationFailed,
                Start | Complete | BeginCompensation | FinishCompensation { .. },
            ) => {
                return Err(SagaError::InvalidTransition {
                    from: self,
                    transition,
                });
            }
        };
        Ok(next)
    }

    /// Returns true if `execute` may pick the saga up.
    pub fn can_execute(&self) -> bool {
        matches!(self, SagaStatus::Pending | SagaStatus::Running)
    }

    /// Returns true if a manual compensation may be started or resumed.
    pub fn can_compensate(&self) -> bool {
        !matches!(self, SagaStatus::Compensated)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::CompensationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SagaStatus::Pending),
            "running" => Ok(SagaStatus::Running),
            "completed" => Ok(SagaStatus::Completed),
            "compensating" => Ok(SagaStatus::Compensating),
            "compensated" => Ok(SagaStatus::Compensated),
            "compensation_failed" => Ok(SagaStatus::CompensationFailed),
            other => Err(format!("unknown saga status '{other}'")),
        }
    }
}

/// Outcome of a single step as seen in the saga's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if the step's forward action took effect and has not yet
    /// been successfully undone.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::CompensationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
    }

    #[test]
    fn test_happy_path_transitions() {
        let status = SagaStatus::Pending
            .transition(SagaTransition::Start)
            .unwrap()
            .transition(SagaTransition::Complete)
            .unwrap();
        assert_eq!(status, SagaStatus::Completed);
    }

    #[test]
    fn test_compensation_transitions() {
        let compensating = SagaStatus::Running
            .transition(SagaTransition::BeginCompensation)
            .unwrap();
        assert_eq!(compensating, SagaStatus::Compensating);

        assert_eq!(
            compensating
                .transition(SagaTransition::FinishCompensation {
                    all_succeeded: true
                })
                .unwrap(),
            SagaStatus::Compensated
        );
        assert_eq!(
            compensating
                .transition(SagaTransition::FinishCompensation {
                    all_succeeded: false
                })
                .unwrap(),
            SagaStatus::CompensationFailed
        );
    }

    #[test]
    fn test_manual_compensation_reentry() {
        assert!(
            SagaStatus::Completed
                .transition(SagaTransition::BeginCompensation)
                .is_ok()
        );
        assert!(
            SagaStatus::CompensationFailed
                .transition(SagaTransition::BeginCompensation)
                .is_ok()
        );
        assert!(
            SagaStatus::Compensated
                .transition(SagaTransition::BeginCompensation)
                .is_err()
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(SagaStatus::Pending.transition(SagaTransition::Complete).is_err());
        assert!(SagaStatus::Running.transition(SagaTransition::Start).is_err());
        assert!(SagaStatus::Completed.transition(SagaTransition::Start).is_err());
        assert!(
            SagaStatus::Running
                .transition(SagaTransition::FinishCompensation {
                    all_succeeded: true
                })
                .is_err()
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::CompensationFailed.is_terminal());
    }

    #[test]
    fn test_display_and_parse() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::CompensationFailed,
        ] {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_serialization_uses_snake_case() {
        let json = serde_json::to_string(&SagaStatus::CompensationFailed).unwrap();
        assert_eq!(json, "\"compensation_failed\"");
    }

    #[test]
    fn test_step_needs_compensation() {
        assert!(StepStatus::Succeeded.needs_compensation());
        assert!(StepStatus::CompensationFailed.needs_compensation());
        assert!(!StepStatus::Compensated.needs_compensation());
        assert!(!StepStatus::Failed.needs_compensation());
        assert!(!StepStatus::Pending.needs_compensation());
    }
}
