//! Persistence port for budgets, attachments and milestones.
//!
//! Writes are compare-and-swap on the entity's `version`: an update only
//! lands when the stored version still equals the one the caller read, and
//! the stored version is then bumped by one. A `false` return means another
//! writer got there first.

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::budgets::{AttachmentContent, Budget, BudgetAttachment, BudgetFilter};
use crate::domain::milestones::Milestone;
use crate::error::ApiResult;

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

/// Window of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    #[cfg(test)]
    pub fn all() -> Self {
        Self {
            limit: u32::MAX,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn insert_budget(&self, budget: &Budget) -> ApiResult<()>;

    async fn fetch_budget(&self, id: Uuid) -> ApiResult<Option<Budget>>;

    /// Matching budgets newest first, plus the total match count.
    async fn list_budgets(&self, filter: &BudgetFilter, page: Page) -> ApiResult<(Vec<Budget>, u64)>;

    async fn update_budget(&self, budget: &Budget) -> ApiResult<bool>;

    /// Removes the budget and its attachments if `budget.version` is current.
    async fn delete_budget(&self, budget: &Budget) -> ApiResult<bool>;

    /// Stores the approved budget and all of its milestones in one unit.
    /// Nothing is written when the version check fails.
    async fn commit_approval(&self, budget: &Budget, milestones: &[Milestone]) -> ApiResult<bool>;

    async fn insert_attachment(&self, attachment: &AttachmentContent) -> ApiResult<()>;

    async fn list_attachments(&self, budget_id: Uuid) -> ApiResult<Vec<BudgetAttachment>>;

    async fn fetch_attachment(&self, id: Uuid) -> ApiResult<Option<AttachmentContent>>;

    async fn delete_attachment(&self, id: Uuid) -> ApiResult<bool>;

    async fn fetch_milestone(&self, id: Uuid) -> ApiResult<Option<Milestone>>;

    /// Ordered by sequence number.
    async fn list_milestones_by_budget(&self, budget_id: Uuid) -> ApiResult<Vec<Milestone>>;

    /// Grouped per budget (oldest budget first), sequence order within each.
    async fn list_milestones_by_client(&self, client_id: Uuid) -> ApiResult<Vec<Milestone>>;

    async fn update_milestone(&self, milestone: &Milestone) -> ApiResult<bool>;
}

/// What the service catalog knows about a listed service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceListing {
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub hourly_rate: Decimal,
    /// Raw weekly availability as the provider stored it.
    pub availability: Option<String>,
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service(&self, service_id: Uuid) -> ApiResult<Option<ServiceListing>>;
}
