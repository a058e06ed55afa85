//! Milestone (escrowed work session) entity, state machine and DTOs.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::actor::Role;
use crate::error::ApiError;

/// Milestone status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MilestoneStatus {
    #[serde(rename = "PENDIENTE")]
    Pending,
    #[serde(rename = "EN_PROGRESO")]
    InProgress,
    #[serde(rename = "COMPLETADO")]
    Completed,
    #[serde(rename = "APROBADO_CLIENTE")]
    ApprovedByClient,
    #[serde(rename = "PAGADO")]
    Paid,
    #[serde(rename = "DISPUTADO")]
    Disputed,
    #[serde(rename = "CANCELADO")]
    Cancelled,
}

impl Default for MilestoneStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "PENDIENTE",
            MilestoneStatus::InProgress => "EN_PROGRESO",
            MilestoneStatus::Completed => "COMPLETADO",
            MilestoneStatus::ApprovedByClient => "APROBADO_CLIENTE",
            MilestoneStatus::Paid => "PAGADO",
            MilestoneStatus::Disputed => "DISPUTADO",
            MilestoneStatus::Cancelled => "CANCELADO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDIENTE" => Some(Self::Pending),
            "EN_PROGRESO" => Some(Self::InProgress),
            "COMPLETADO" => Some(Self::Completed),
            "APROBADO_CLIENTE" => Some(Self::ApprovedByClient),
            "PAGADO" => Some(Self::Paid),
            "DISPUTADO" => Some(Self::Disputed),
            "CANCELADO" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Next state for `action`, or `InvalidState` naming both ends.
    pub fn apply(self, action: MilestoneAction) -> Result<MilestoneStatus, ApiError> {
        use MilestoneAction as A;
        use MilestoneStatus as S;

        let next = match (self, action) {
            (S::Pending, A::Start) => S::InProgress,
            (S::Pending | S::InProgress, A::Complete) => S::Completed,
            (S::Completed, A::Approve) => S::ApprovedByClient,
            (S::ApprovedByClient, A::ReleaseFunds) => S::Paid,
            (S::Completed | S::ApprovedByClient, A::Dispute) => S::Disputed,
            // Disputes freeze the milestone until resolved outside this service
            (S::Pending | S::InProgress | S::Completed | S::ApprovedByClient, A::Cancel) => {
                S::Cancelled
            }
            (current, action) => {
                return Err(ApiError::invalid_state(
                    format!("{} milestone ({} -> {})", action, current, action.target()),
                    current,
                ))
            }
        };

        Ok(next)
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a party can do to a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneAction {
    Start,
    Complete,
    Approve,
    ReleaseFunds,
    Dispute,
    Cancel,
}

impl MilestoneAction {
    /// Role required to perform the action; `None` means either party.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            MilestoneAction::Start | MilestoneAction::Complete => Some(Role::Provider),
            MilestoneAction::Approve | MilestoneAction::ReleaseFunds => Some(Role::Client),
            MilestoneAction::Dispute | MilestoneAction::Cancel => None,
        }
    }

    fn target(&self) -> MilestoneStatus {
        match self {
            MilestoneAction::Start => MilestoneStatus::InProgress,
            MilestoneAction::Complete => MilestoneStatus::Completed,
            MilestoneAction::Approve => MilestoneStatus::ApprovedByClient,
            MilestoneAction::ReleaseFunds => MilestoneStatus::Paid,
            MilestoneAction::Dispute => MilestoneStatus::Disputed,
            MilestoneAction::Cancel => MilestoneStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for MilestoneAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            MilestoneAction::Start => "start",
            MilestoneAction::Complete => "complete",
            MilestoneAction::Approve => "approve",
            MilestoneAction::ReleaseFunds => "release funds for",
            MilestoneAction::Dispute => "dispute",
            MilestoneAction::Cancel => "cancel",
        };
        f.write_str(verb)
    }
}

/// Opaque handle on funds held by the escrow provider. Never parsed here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscrowRef(pub String);

impl EscrowRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EscrowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dispute details recorded when a milestone is frozen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisputeRecord {
    pub reason: String,
    pub description: Option<String>,
    pub raised_by: Uuid,
    pub raised_at: DateTime<Utc>,
}

/// Milestone entity
#[derive(Debug, Clone, PartialEq)]
pub struct Milestone {
    pub id: Uuid,
    pub budget_id: Uuid,
    /// Denormalized from the budget for authorization checks.
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub sequence_number: i32,
    pub description: String,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub status: MilestoneStatus,
    pub scheduled_start: NaiveDateTime,
    pub estimated_completion: NaiveDateTime,
    pub completed_at: Option<DateTime<Utc>>,
    pub escrow_ref: EscrowRef,
    pub evidence: Option<String>,
    pub comments: Option<String>,
    pub dispute: Option<DisputeRecord>,
    /// Set while a payout is in flight at the escrow provider.
    pub release_started_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Milestone {
    /// Next state for `action`. While a payout is in flight only the payout
    /// itself may continue.
    pub fn next_status(&self, action: MilestoneAction) -> Result<MilestoneStatus, ApiError> {
        if self.release_started_at.is_some() && action != MilestoneAction::ReleaseFunds {
            return Err(ApiError::invalid_state(
                format!("{} milestone", action),
                format!("{} (release in progress)", self.status),
            ));
        }
        self.status.apply(action)
    }
}

/// Request DTO for completing a milestone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompleteMilestoneRequest {
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Request DTO for raising a dispute
#[derive(Debug, Clone, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Response DTO for milestone
#[derive(Debug, Clone, Serialize)]
pub struct MilestoneResponse {
    pub id: Uuid,
    pub budget_id: Uuid,
    pub sequence_number: i32,
    pub description: String,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub status: MilestoneStatus,
    pub scheduled_start: NaiveDateTime,
    pub estimated_completion: NaiveDateTime,
    pub completed_at: Option<DateTime<Utc>>,
    pub escrow_ref: EscrowRef,
    pub evidence: Option<String>,
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute: Option<DisputeRecord>,
    pub released_at: Option<DateTime<Utc>>,
}

impl From<Milestone> for MilestoneResponse {
    fn from(m: Milestone) -> Self {
        Self {
            id: m.id,
            budget_id: m.budget_id,
            sequence_number: m.sequence_number,
            description: m.description,
            percentage: m.percentage,
            amount: m.amount,
            status: m.status,
            scheduled_start: m.scheduled_start,
            estimated_completion: m.estimated_completion,
            completed_at: m.completed_at,
            escrow_ref: m.escrow_ref,
            evidence: m.evidence,
            comments: m.comments,
            dispute: m.dispute,
            released_at: m.released_at,
        }
    }
}

/// Receipt for a funds release
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReceipt {
    pub milestone_id: Uuid,
    pub amount_released: Decimal,
    pub new_state: MilestoneStatus,
    pub message: String,
}

/// Response DTO for a raised dispute
#[derive(Debug, Clone, Serialize)]
pub struct DisputeResponse {
    pub milestone_id: Uuid,
    pub reason: String,
    pub new_state: MilestoneStatus,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use MilestoneAction as A;
    use MilestoneStatus as S;

    #[test]
    fn happy_path_reaches_paid() {
        let paid = S::Pending
            .apply(A::Start)
            .and_then(|s| s.apply(A::Complete))
            .and_then(|s| s.apply(A::Approve))
            .and_then(|s| s.apply(A::ReleaseFunds))
            .unwrap();
        assert_eq!(paid, S::Paid);
    }

    #[test]
    fn start_is_optional() {
        assert_eq!(S::Pending.apply(A::Complete).unwrap(), S::Completed);
    }

    #[test]
    fn release_only_from_client_approval() {
        for state in [S::Pending, S::InProgress, S::Completed, S::Paid, S::Disputed, S::Cancelled] {
            assert!(
                matches!(state.apply(A::ReleaseFunds), Err(ApiError::InvalidState { .. })),
                "release allowed from {}",
                state
            );
        }
    }

    #[test]
    fn disputes_only_after_completion() {
        assert!(S::Pending.apply(A::Dispute).is_err());
        assert_eq!(S::Completed.apply(A::Dispute).unwrap(), S::Disputed);
        assert_eq!(S::ApprovedByClient.apply(A::Dispute).unwrap(), S::Disputed);
    }

    #[test]
    fn disputed_and_terminal_states_are_frozen() {
        for state in [S::Disputed, S::Paid, S::Cancelled] {
            for action in [A::Start, A::Complete, A::Approve, A::ReleaseFunds, A::Dispute, A::Cancel] {
                assert!(state.apply(action).is_err(), "{} allowed from {}", action, state);
            }
        }
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = S::Paid.apply(A::Complete).unwrap_err();
        match err {
            ApiError::InvalidState { operation, current } => {
                assert_eq!(current, "PAGADO");
                assert!(operation.contains("PAGADO -> COMPLETADO"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn roles_per_action() {
        assert_eq!(A::Complete.required_role(), Some(Role::Provider));
        assert_eq!(A::ReleaseFunds.required_role(), Some(Role::Client));
        assert_eq!(A::Dispute.required_role(), None);
    }
}
