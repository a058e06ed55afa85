//! Budget (quote) entity and DTOs
//!
//! A client asks for a quote on a service, the provider answers with hours,
//! materials and a proposed solution, and the client schedules, approves or
//! rejects it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::{hours_to_minutes, minutes_to_hours, SlotRequest, TimeSlot};
use super::milestones::MilestoneResponse;
use crate::error::ApiError;

/// Top-level budget state. `Pending` covers both unanswered and answered
/// quotes; see [`Budget::responded`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BudgetStatus {
    #[serde(rename = "PENDIENTE")]
    Pending,
    #[serde(rename = "APROBADO")]
    Approved,
    #[serde(rename = "RECHAZADO")]
    Rejected,
}

impl Default for BudgetStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl BudgetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetStatus::Pending => "PENDIENTE",
            BudgetStatus::Approved => "APROBADO",
            BudgetStatus::Rejected => "RECHAZADO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDIENTE" | "PENDING" => Some(Self::Pending),
            "APROBADO" | "APPROVED" => Some(Self::Approved),
            "RECHAZADO" | "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest estimate the `budgets.estimated_hours` NUMERIC(10,4) column holds.
pub const MAX_ESTIMATED_HOURS: Decimal = Decimal::from_parts(999_999, 0, 0, false, 0); // 999999
/// `budgets.materials_cost` is NUMERIC(12,2).
pub const MAX_MATERIALS_COST: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, 2); // 9999999999.99
/// `budgets.total` is NUMERIC(14,2).
pub const MAX_TOTAL: Decimal = Decimal::from_parts(0x107A_3FFF, 0x5AF3, 0, false, 2); // 999999999999.99

/// Budget entity
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub id: Uuid,
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub problem_description: String,
    pub solution_description: Option<String>,
    pub estimated_hours: Option<Decimal>,
    pub materials_cost: Decimal,
    /// Copied from the service when the provider responds.
    pub hourly_rate: Option<Decimal>,
    pub total: Decimal,
    pub status: BudgetStatus,
    pub responded: bool,
    pub selected_slots: Vec<TimeSlot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
}

impl Budget {
    pub fn new(client_id: Uuid, provider_id: Uuid, service_id: Uuid, problem: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id,
            provider_id,
            service_id,
            problem_description: problem,
            solution_description: None,
            estimated_hours: None,
            materials_cost: Decimal::ZERO,
            hourly_rate: None,
            total: Decimal::ZERO,
            status: BudgetStatus::Pending,
            responded: false,
            selected_slots: Vec::new(),
            created_at: now,
            updated_at: now,
            responded_at: None,
            version: 0,
        }
    }

    pub fn estimated_minutes(&self) -> i64 {
        self.estimated_hours
            .and_then(hours_to_minutes)
            .unwrap_or(0)
    }

    pub fn allocated_minutes(&self) -> i64 {
        self.selected_slots.iter().map(TimeSlot::duration_minutes).sum()
    }

    /// Estimated minus allocated hours. Negative when over-allocated.
    pub fn remaining_hours(&self) -> Decimal {
        minutes_to_hours(self.estimated_minutes() - self.allocated_minutes())
    }

    /// Whether the quote should show up as something either party can act on.
    pub fn is_actionable(&self) -> bool {
        self.responded && self.total > Decimal::ZERO
    }

    /// Fails with `InvalidState` unless the budget is still pending.
    pub fn ensure_pending(&self, operation: &str) -> Result<(), ApiError> {
        if self.status == BudgetStatus::Pending {
            Ok(())
        } else {
            Err(ApiError::invalid_state(operation, self.status))
        }
    }

    /// Pending and already answered by the provider.
    pub fn ensure_answered(&self, operation: &str) -> Result<(), ApiError> {
        self.ensure_pending(operation)?;
        if self.responded {
            Ok(())
        } else {
            Err(ApiError::invalid_state(operation, "PENDIENTE (not yet responded)"))
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Kind of file a client attached to the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttachmentKind {
    #[serde(rename = "IMAGEN")]
    Image,
    #[serde(rename = "VIDEO")]
    Video,
}

impl AttachmentKind {
    /// Only image and video MIME families are accepted.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let family = mime.split('/').next()?.trim().to_lowercase();
        match family.as_str() {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "IMAGEN",
            AttachmentKind::Video => "VIDEO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMAGEN" => Some(Self::Image),
            "VIDEO" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Attachment metadata (content is fetched separately)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BudgetAttachment {
    pub id: Uuid,
    pub budget_id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub kind: AttachmentKind,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttachmentContent {
    pub attachment: BudgetAttachment,
    pub bytes: Vec<u8>,
}

/// Request DTO for creating a budget
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBudgetRequest {
    pub service_id: Uuid,
    pub problem_description: String,
}

/// Request DTO for the provider's answer
#[derive(Debug, Clone, Deserialize)]
pub struct RespondBudgetRequest {
    pub estimated_hours: Decimal,
    #[serde(default)]
    pub materials_cost: Option<Decimal>,
    pub solution_description: String,
}

/// Request DTO for the client's chosen sessions
#[derive(Debug, Clone, Deserialize)]
pub struct SelectScheduleRequest {
    pub slots: Vec<SlotRequest>,
}

/// Response DTO for budget
#[derive(Debug, Clone, Serialize)]
pub struct BudgetResponse {
    pub id: Uuid,
    pub service_id: Uuid,
    pub client_id: Uuid,
    pub provider_id: Uuid,
    pub problem_description: String,
    pub solution_description: Option<String>,
    pub estimated_hours: Option<Decimal>,
    pub materials_cost: Decimal,
    pub hourly_rate: Option<Decimal>,
    pub total: Decimal,
    pub status: BudgetStatus,
    pub responded: bool,
    pub actionable: bool,
    pub selected_slots: Vec<TimeSlot>,
    pub hours_remaining: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<BudgetAttachment>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl BudgetResponse {
    pub fn with_attachments(mut self, attachments: Vec<BudgetAttachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }
}

impl From<Budget> for BudgetResponse {
    fn from(b: Budget) -> Self {
        let actionable = b.is_actionable();
        let hours_remaining = b.remaining_hours();
        Self {
            id: b.id,
            service_id: b.service_id,
            client_id: b.client_id,
            provider_id: b.provider_id,
            problem_description: b.problem_description,
            solution_description: b.solution_description,
            estimated_hours: b.estimated_hours,
            materials_cost: b.materials_cost,
            hourly_rate: b.hourly_rate,
            total: b.total,
            status: b.status,
            responded: b.responded,
            actionable,
            selected_slots: b.selected_slots,
            hours_remaining,
            attachments: None,
            created_at: b.created_at,
            updated_at: b.updated_at,
            responded_at: b.responded_at,
        }
    }
}

/// Response DTO for a successful approval
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResponse {
    pub budget: BudgetResponse,
    pub milestones_created: usize,
    pub milestones: Vec<MilestoneResponse>,
}

/// Response DTO for the "has the provider answered" check
#[derive(Debug, Clone, Serialize)]
pub struct RespondedResponse {
    pub budget_id: Uuid,
    pub responded: bool,
}

/// Which budgets a listing should return.
#[derive(Debug, Clone, Default)]
pub struct BudgetFilter {
    pub client_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub status: Option<BudgetStatus>,
    /// Restrict to budgets where this user is client or provider.
    pub party_id: Option<Uuid>,
    pub actionable_only: bool,
}

impl BudgetFilter {
    pub fn matches(&self, b: &Budget) -> bool {
        self.client_id.map_or(true, |id| b.client_id == id)
            && self.provider_id.map_or(true, |id| b.provider_id == id)
            && self.service_id.map_or(true, |id| b.service_id == id)
            && self.status.map_or(true, |s| b.status == s)
            && self
                .party_id
                .map_or(true, |id| b.client_id == id || b.provider_id == id)
            && (!self.actionable_only || b.is_actionable())
    }
}
