//! PostgreSQL adapter for the market store and the service catalog.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{MarketStore, Page, ServiceCatalog, ServiceListing};
use crate::domain::budgets::{
    AttachmentContent, AttachmentKind, Budget, BudgetAttachment, BudgetFilter, BudgetStatus,
};
use crate::domain::milestones::{DisputeRecord, EscrowRef, Milestone, MilestoneStatus};
use crate::domain::schedule::TimeSlot;
use crate::error::{ApiError, ApiResult};

// ============================================================================
// Database Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct BudgetRow {
    id: Uuid,
    client_id: Uuid,
    provider_id: Uuid,
    service_id: Uuid,
    problem_description: String,
    solution_description: Option<String>,
    estimated_hours: Option<Decimal>,
    materials_cost: Decimal,
    hourly_rate: Option<Decimal>,
    total: Decimal,
    status: String,
    responded: bool,
    selected_slots: Json<Vec<TimeSlot>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<BudgetRow> for Budget {
    type Error = ApiError;

    fn try_from(row: BudgetRow) -> Result<Self, Self::Error> {
        let status = BudgetStatus::parse(&row.status).ok_or_else(|| {
            ApiError::internal(format!("budget {} has unknown status '{}'", row.id, row.status))
        })?;

        Ok(Self {
            id: row.id,
            client_id: row.client_id,
            provider_id: row.provider_id,
            service_id: row.service_id,
            problem_description: row.problem_description,
            solution_description: row.solution_description,
            estimated_hours: row.estimated_hours,
            materials_cost: row.materials_cost,
            hourly_rate: row.hourly_rate,
            total: row.total,
            status,
            responded: row.responded,
            selected_slots: row.selected_slots.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            responded_at: row.responded_at,
            version: row.version,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttachmentRow {
    id: Uuid,
    budget_id: Uuid,
    file_name: String,
    mime_type: String,
    kind: String,
    size_bytes: i64,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<AttachmentRow> for BudgetAttachment {
    type Error = ApiError;

    fn try_from(row: AttachmentRow) -> Result<Self, Self::Error> {
        let kind = AttachmentKind::parse(&row.kind).ok_or_else(|| {
            ApiError::internal(format!("attachment {} has unknown kind '{}'", row.id, row.kind))
        })?;

        Ok(Self {
            id: row.id,
            budget_id: row.budget_id,
            file_name: row.file_name,
            mime_type: row.mime_type,
            kind,
            size_bytes: row.size_bytes,
            uploaded_at: row.uploaded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttachmentContentRow {
    #[sqlx(flatten)]
    meta: AttachmentRow,
    content: Vec<u8>,
}

#[derive(Debug, sqlx::FromRow)]
struct MilestoneRow {
    id: Uuid,
    budget_id: Uuid,
    client_id: Uuid,
    provider_id: Uuid,
    sequence_number: i32,
    description: String,
    percentage: Decimal,
    amount: Decimal,
    status: String,
    scheduled_start: NaiveDateTime,
    estimated_completion: NaiveDateTime,
    completed_at: Option<DateTime<Utc>>,
    escrow_ref: String,
    evidence: Option<String>,
    comments: Option<String>,
    dispute: Option<Json<DisputeRecord>>,
    release_started_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<MilestoneRow> for Milestone {
    type Error = ApiError;

    fn try_from(row: MilestoneRow) -> Result<Self, Self::Error> {
        let status = MilestoneStatus::parse(&row.status).ok_or_else(|| {
            ApiError::internal(format!("milestone {} has unknown status '{}'", row.id, row.status))
        })?;

        Ok(Self {
            id: row.id,
            budget_id: row.budget_id,
            client_id: row.client_id,
            provider_id: row.provider_id,
            sequence_number: row.sequence_number,
            description: row.description,
            percentage: row.percentage,
            amount: row.amount,
            status,
            scheduled_start: row.scheduled_start,
            estimated_completion: row.estimated_completion,
            completed_at: row.completed_at,
            escrow_ref: EscrowRef(row.escrow_ref),
            evidence: row.evidence,
            comments: row.comments,
            dispute: row.dispute.map(|d| d.0),
            release_started_at: row.release_started_at,
            released_at: row.released_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

const BUDGET_COLUMNS: &str = r#"
    id, client_id, provider_id, service_id, problem_description, solution_description,
    estimated_hours, materials_cost, hourly_rate, total, status, responded, selected_slots,
    created_at, updated_at, responded_at, version
"#;

const MILESTONE_COLUMNS: &str = r#"
    m.id, m.budget_id, m.client_id, m.provider_id, m.sequence_number, m.description,
    m.percentage, m.amount, m.status, m.scheduled_start, m.estimated_completion,
    m.completed_at, m.escrow_ref, m.evidence, m.comments, m.dispute, m.release_started_at,
    m.released_at, m.created_at, m.updated_at, m.version
"#;

const ATTACHMENT_COLUMNS: &str =
    "id, budget_id, file_name, mime_type, kind, size_bytes, uploaded_at";

/// Filter clause shared by the listing and its count. Binds $1..$6.
const BUDGET_FILTER: &str = r#"
    WHERE ($1::uuid IS NULL OR client_id = $1)
    AND ($2::uuid IS NULL OR provider_id = $2)
    AND ($3::uuid IS NULL OR service_id = $3)
    AND ($4::text IS NULL OR status = $4)
    AND ($5::uuid IS NULL OR client_id = $5 OR provider_id = $5)
    AND (NOT $6 OR (responded AND total > 0))
"#;

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    fn rows_to<R, T>(rows: Vec<R>) -> ApiResult<Vec<T>>
    where
        T: TryFrom<R, Error = ApiError>,
    {
        rows.into_iter().map(T::try_from).collect()
    }
}

#[async_trait]
impl MarketStore for PgStore {
    async fn insert_budget(&self, b: &Budget) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO budgets (
                id, client_id, provider_id, service_id, problem_description, solution_description,
                estimated_hours, materials_cost, hourly_rate, total, status, responded,
                selected_slots, created_at, updated_at, responded_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(b.id)
        .bind(b.client_id)
        .bind(b.provider_id)
        .bind(b.service_id)
        .bind(&b.problem_description)
        .bind(&b.solution_description)
        .bind(b.estimated_hours)
        .bind(b.materials_cost)
        .bind(b.hourly_rate)
        .bind(b.total)
        .bind(b.status.as_str())
        .bind(b.responded)
        .bind(Json(&b.selected_slots))
        .bind(b.created_at)
        .bind(b.updated_at)
        .bind(b.responded_at)
        .bind(b.version)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn fetch_budget(&self, id: Uuid) -> ApiResult<Option<Budget>> {
        let row = sqlx::query_as::<_, BudgetRow>(&format!(
            "SELECT {} FROM budgets WHERE id = $1",
            BUDGET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Budget::try_from).transpose()
    }

    async fn list_budgets(&self, filter: &BudgetFilter, page: Page) -> ApiResult<(Vec<Budget>, u64)> {
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM budgets {}", BUDGET_FILTER))
            .bind(filter.client_id)
            .bind(filter.provider_id)
            .bind(filter.service_id)
            .bind(status)
            .bind(filter.party_id)
            .bind(filter.actionable_only)
            .fetch_one(&self.db)
            .await?;

        let rows = sqlx::query_as::<_, BudgetRow>(&format!(
            "SELECT {} FROM budgets {} ORDER BY created_at DESC, id LIMIT $7 OFFSET $8",
            BUDGET_COLUMNS, BUDGET_FILTER
        ))
        .bind(filter.client_id)
        .bind(filter.provider_id)
        .bind(filter.service_id)
        .bind(status)
        .bind(filter.party_id)
        .bind(filter.actionable_only)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.db)
        .await?;

        Ok((Self::rows_to(rows)?, total as u64))
    }

    async fn update_budget(&self, b: &Budget) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE budgets SET
                solution_description = $1,
                estimated_hours = $2,
                materials_cost = $3,
                hourly_rate = $4,
                total = $5,
                status = $6,
                responded = $7,
                selected_slots = $8,
                updated_at = $9,
                responded_at = $10,
                version = version + 1
            WHERE id = $11 AND version = $12
            "#,
        )
        .bind(&b.solution_description)
        .bind(b.estimated_hours)
        .bind(b.materials_cost)
        .bind(b.hourly_rate)
        .bind(b.total)
        .bind(b.status.as_str())
        .bind(b.responded)
        .bind(Json(&b.selected_slots))
        .bind(b.updated_at)
        .bind(b.responded_at)
        .bind(b.id)
        .bind(b.version)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_budget(&self, b: &Budget) -> ApiResult<bool> {
        // Attachments go with the budget (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM budgets WHERE id = $1 AND version = $2")
            .bind(b.id)
            .bind(b.version)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit_approval(&self, b: &Budget, milestones: &[Milestone]) -> ApiResult<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE budgets SET status = $1, updated_at = $2, version = version + 1
            WHERE id = $3 AND version = $4 AND status = 'PENDIENTE'
            "#,
        )
        .bind(b.status.as_str())
        .bind(b.updated_at)
        .bind(b.id)
        .bind(b.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for m in milestones {
            sqlx::query(
                r#"
                INSERT INTO milestones (
                    id, budget_id, client_id, provider_id, sequence_number, description,
                    percentage, amount, status, scheduled_start, estimated_completion,
                    escrow_ref, created_at, updated_at, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(m.id)
            .bind(m.budget_id)
            .bind(m.client_id)
            .bind(m.provider_id)
            .bind(m.sequence_number)
            .bind(&m.description)
            .bind(m.percentage)
            .bind(m.amount)
            .bind(m.status.as_str())
            .bind(m.scheduled_start)
            .bind(m.estimated_completion)
            .bind(m.escrow_ref.as_str())
            .bind(m.created_at)
            .bind(m.updated_at)
            .bind(m.version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_attachment(&self, a: &AttachmentContent) -> ApiResult<()> {
        let meta = &a.attachment;
        sqlx::query(
            r#"
            INSERT INTO budget_attachments (
                id, budget_id, file_name, mime_type, kind, size_bytes, content, uploaded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(meta.id)
        .bind(meta.budget_id)
        .bind(&meta.file_name)
        .bind(&meta.mime_type)
        .bind(meta.kind.as_str())
        .bind(meta.size_bytes)
        .bind(&a.bytes)
        .bind(meta.uploaded_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_attachments(&self, budget_id: Uuid) -> ApiResult<Vec<BudgetAttachment>> {
        let rows = sqlx::query_as::<_, AttachmentRow>(&format!(
            "SELECT {} FROM budget_attachments WHERE budget_id = $1 ORDER BY uploaded_at",
            ATTACHMENT_COLUMNS
        ))
        .bind(budget_id)
        .fetch_all(&self.db)
        .await?;

        Self::rows_to(rows)
    }

    async fn fetch_attachment(&self, id: Uuid) -> ApiResult<Option<AttachmentContent>> {
        let row = sqlx::query_as::<_, AttachmentContentRow>(&format!(
            "SELECT {}, content FROM budget_attachments WHERE id = $1",
            ATTACHMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| {
            Ok(AttachmentContent {
                attachment: BudgetAttachment::try_from(r.meta)?,
                bytes: r.content,
            })
        })
        .transpose()
    }

    async fn delete_attachment(&self, id: Uuid) -> ApiResult<bool> {
        let result = sqlx::query("DELETE FROM budget_attachments WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_milestone(&self, id: Uuid) -> ApiResult<Option<Milestone>> {
        let row = sqlx::query_as::<_, MilestoneRow>(&format!(
            "SELECT {} FROM milestones m WHERE m.id = $1",
            MILESTONE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.map(Milestone::try_from).transpose()
    }

    async fn list_milestones_by_budget(&self, budget_id: Uuid) -> ApiResult<Vec<Milestone>> {
        let rows = sqlx::query_as::<_, MilestoneRow>(&format!(
            "SELECT {} FROM milestones m WHERE m.budget_id = $1 ORDER BY m.sequence_number",
            MILESTONE_COLUMNS
        ))
        .bind(budget_id)
        .fetch_all(&self.db)
        .await?;

        Self::rows_to(rows)
    }

    async fn list_milestones_by_client(&self, client_id: Uuid) -> ApiResult<Vec<Milestone>> {
        let rows = sqlx::query_as::<_, MilestoneRow>(&format!(
            r#"
            SELECT {} FROM milestones m
            JOIN budgets b ON b.id = m.budget_id
            WHERE m.client_id = $1
            ORDER BY b.created_at, m.budget_id, m.sequence_number
            "#,
            MILESTONE_COLUMNS
        ))
        .bind(client_id)
        .fetch_all(&self.db)
        .await?;

        Self::rows_to(rows)
    }

    async fn update_milestone(&self, m: &Milestone) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE milestones SET
                status = $1,
                completed_at = $2,
                evidence = $3,
                comments = $4,
                dispute = $5,
                release_started_at = $6,
                released_at = $7,
                updated_at = $8,
                version = version + 1
            WHERE id = $9 AND version = $10
            "#,
        )
        .bind(m.status.as_str())
        .bind(m.completed_at)
        .bind(&m.evidence)
        .bind(&m.comments)
        .bind(m.dispute.as_ref().map(Json))
        .bind(m.release_started_at)
        .bind(m.released_at)
        .bind(m.updated_at)
        .bind(m.id)
        .bind(m.version)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    provider_id: Uuid,
    hourly_rate: Decimal,
    availability: Option<String>,
}

#[async_trait]
impl ServiceCatalog for PgStore {
    async fn service(&self, service_id: Uuid) -> ApiResult<Option<ServiceListing>> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, provider_id, hourly_rate, availability FROM services WHERE id = $1",
        )
        .bind(service_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|r| ServiceListing {
            service_id: r.id,
            provider_id: r.provider_id,
            hourly_rate: r.hourly_rate,
            availability: r.availability,
        }))
    }
}
