//! Budget (quote) workflow: request, answer, schedule, approve or reject.
//!
//! Every mutating operation runs under the budget's stripe lock and lands
//! through a version-checked write, so concurrent callers on one budget see
//! exactly one winner. Approval opens one escrow hold per milestone before
//! anything is written; if any hold fails, or the write loses a race, the
//! holds already opened are voided and the budget stays `PENDIENTE`.

use chrono::{Days, NaiveDate, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::availability::parse_availability;
use super::escrow::{EscrowHoldRequest, EscrowProvider};
use super::locks::EntityLocks;
use super::milestone_plan::{plan_milestones, Allocation};
use super::schedule_selector::{candidate_dates, ScheduleSelector};
use crate::config::WorkflowPolicy;
use crate::domain::budgets::{
    ApprovalResponse, AttachmentContent, AttachmentKind, Budget, BudgetAttachment, BudgetFilter,
    BudgetResponse, BudgetStatus, CreateBudgetRequest, RespondBudgetRequest, RespondedResponse,
    SelectScheduleRequest, MAX_ESTIMATED_HOURS, MAX_MATERIALS_COST, MAX_TOTAL,
};
use crate::domain::milestones::{EscrowRef, Milestone, MilestoneResponse};
use crate::domain::schedule::{hours_to_minutes, minutes_to_hours, AvailabilityWindow, DayOfWeek};
use crate::domain::{Actor, Role};
use crate::error::{ApiError, ApiResult};
use crate::store::{MarketStore, Page, ServiceCatalog, ServiceListing};

/// A file as received from the client, before validation.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

pub struct BudgetService {
    store: Arc<dyn MarketStore>,
    catalog: Arc<dyn ServiceCatalog>,
    escrow: Arc<dyn EscrowProvider>,
    locks: EntityLocks,
    policy: WorkflowPolicy,
}

impl BudgetService {
    pub fn new(
        store: Arc<dyn MarketStore>,
        catalog: Arc<dyn ServiceCatalog>,
        escrow: Arc<dyn EscrowProvider>,
        policy: WorkflowPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            escrow,
            locks: EntityLocks::default(),
            policy,
        }
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    async fn load(&self, budget_id: Uuid) -> ApiResult<Budget> {
        self.store
            .fetch_budget(budget_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Budget {} not found", budget_id)))
    }

    async fn listing(&self, service_id: Uuid) -> ApiResult<ServiceListing> {
        self.catalog
            .service(service_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Service {} not found", service_id)))
    }

    /// Budget with its attachment metadata, visible to either party.
    pub async fn get(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<BudgetResponse> {
        let budget = self.load(budget_id).await?;
        actor.require_party(budget.client_id, budget.provider_id)?;

        let attachments = self.store.list_attachments(budget_id).await?;
        Ok(BudgetResponse::from(budget).with_attachments(attachments))
    }

    pub async fn is_responded(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<RespondedResponse> {
        let budget = self.load(budget_id).await?;
        actor.require_party(budget.client_id, budget.provider_id)?;

        Ok(RespondedResponse {
            budget_id,
            responded: budget.responded,
        })
    }

    /// Budgets matching `filter`, always narrowed to the caller's own deals.
    pub async fn list(
        &self,
        actor: &Actor,
        mut filter: BudgetFilter,
        page: Page,
    ) -> ApiResult<(Vec<Budget>, u64)> {
        filter.party_id = Some(actor.user_id);
        self.store.list_budgets(&filter, page).await
    }

    // ------------------------------------------------------------------
    // Request
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(client_id = %actor.user_id, service_id = %request.service_id))]
    pub async fn create(&self, actor: &Actor, request: CreateBudgetRequest) -> ApiResult<Budget> {
        if actor.role != Role::Client {
            return Err(ApiError::forbidden("Only clients can request a budget"));
        }

        let problem = request.problem_description.trim();
        if problem.chars().count() < self.policy.problem_description_min_chars.max(1) {
            return Err(ApiError::validation(format!(
                "Problem description must have at least {} characters",
                self.policy.problem_description_min_chars.max(1)
            )));
        }

        let listing = self.listing(request.service_id).await?;
        if listing.provider_id == actor.user_id {
            return Err(ApiError::validation("You cannot request a budget for your own service"));
        }

        let budget = Budget::new(
            actor.user_id,
            listing.provider_id,
            listing.service_id,
            problem.to_string(),
        );
        self.store.insert_budget(&budget).await?;

        info!(budget_id = %budget.id, provider_id = %budget.provider_id, "Budget requested");
        Ok(budget)
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    pub async fn attach_file(
        &self,
        actor: &Actor,
        budget_id: Uuid,
        file: NewAttachment,
    ) -> ApiResult<BudgetAttachment> {
        let mut stored = self.attach_files(actor, budget_id, vec![file]).await?;
        stored
            .pop()
            .ok_or_else(|| ApiError::internal("attachment batch came back empty"))
    }

    /// Stores a batch of files. Every file is checked before any is written,
    /// so a rejected file leaves the budget's attachments untouched.
    #[instrument(skip_all, fields(budget_id = %budget_id, files = files.len()))]
    pub async fn attach_files(
        &self,
        actor: &Actor,
        budget_id: Uuid,
        files: Vec<NewAttachment>,
    ) -> ApiResult<Vec<BudgetAttachment>> {
        let _guard = self.locks.lock(budget_id).await;
        let budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_pending("attach files")?;

        if files.is_empty() {
            return Err(ApiError::validation("No file found in the upload"));
        }

        let existing = self.store.list_attachments(budget_id).await?.len();
        if existing + files.len() > self.policy.attachment_max_count {
            return Err(ApiError::validation(format!(
                "A budget can carry at most {} attachments",
                self.policy.attachment_max_count
            )));
        }

        let prepared = files
            .into_iter()
            .enumerate()
            .map(|(index, file)| self.prepare_attachment(budget_id, file, existing + index + 1))
            .collect::<ApiResult<Vec<_>>>()?;

        let mut stored = Vec::with_capacity(prepared.len());
        for content in prepared {
            self.store.insert_attachment(&content).await?;
            info!(
                attachment_id = %content.attachment.id,
                kind = content.attachment.kind.as_str(),
                size = content.attachment.size_bytes,
                "Attachment stored"
            );
            stored.push(content.attachment);
        }

        Ok(stored)
    }

    /// Checks one file against the attachment policy. `position` names
    /// unnamed files.
    fn prepare_attachment(
        &self,
        budget_id: Uuid,
        file: NewAttachment,
        position: usize,
    ) -> ApiResult<AttachmentContent> {
        let kind = AttachmentKind::from_mime(&file.mime_type).ok_or_else(|| {
            ApiError::validation(format!(
                "Unsupported file type '{}': only images and videos are accepted",
                file.mime_type
            ))
        })?;

        if file.bytes.is_empty() {
            return Err(ApiError::validation("Attachment is empty"));
        }
        if file.bytes.len() > self.policy.attachment_max_bytes {
            return Err(ApiError::validation(format!(
                "Attachment exceeds the {} byte limit",
                self.policy.attachment_max_bytes
            )));
        }

        let file_name = match file.file_name.trim() {
            "" => format!("attachment-{}", position),
            name => name.to_string(),
        };

        Ok(AttachmentContent {
            attachment: BudgetAttachment {
                id: Uuid::new_v4(),
                budget_id,
                file_name,
                mime_type: file.mime_type,
                kind,
                size_bytes: file.bytes.len() as i64,
                uploaded_at: Utc::now(),
            },
            bytes: file.bytes,
        })
    }

    pub async fn list_attachments(
        &self,
        actor: &Actor,
        budget_id: Uuid,
    ) -> ApiResult<Vec<BudgetAttachment>> {
        let budget = self.load(budget_id).await?;
        actor.require_party(budget.client_id, budget.provider_id)?;
        self.store.list_attachments(budget_id).await
    }

    pub async fn attachment_content(
        &self,
        actor: &Actor,
        attachment_id: Uuid,
    ) -> ApiResult<AttachmentContent> {
        let content = self
            .store
            .fetch_attachment(attachment_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Attachment {} not found", attachment_id)))?;

        let budget = self.load(content.attachment.budget_id).await?;
        actor.require_party(budget.client_id, budget.provider_id)?;
        Ok(content)
    }

    #[instrument(skip_all, fields(user_id = %actor.user_id))]
    pub async fn delete_attachment(&self, actor: &Actor, attachment_id: Uuid) -> ApiResult<()> {
        let not_found = || ApiError::not_found(format!("Attachment {} not found", attachment_id));

        let budget_id = self
            .store
            .fetch_attachment(attachment_id)
            .await?
            .ok_or_else(not_found)?
            .attachment
            .budget_id;

        let _guard = self.locks.lock(budget_id).await;
        let budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_pending("delete attachments")?;

        if !self.store.delete_attachment(attachment_id).await? {
            return Err(not_found());
        }

        info!(attachment_id = %attachment_id, budget_id = %budget_id, "Attachment deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Writes `budget` if nobody else did since it was read.
    async fn save(&self, budget: &mut Budget, operation: &str) -> ApiResult<()> {
        budget.touch();
        if !self.store.update_budget(budget).await? {
            warn!(budget_id = %budget.id, operation, "Budget changed concurrently");
            return Err(ApiError::invalid_state(operation, "modified by another request"));
        }
        budget.version += 1;
        Ok(())
    }

    #[instrument(skip_all, fields(budget_id = %budget_id, provider_id = %actor.user_id))]
    pub async fn respond(
        &self,
        actor: &Actor,
        budget_id: Uuid,
        request: RespondBudgetRequest,
    ) -> ApiResult<Budget> {
        const OP: &str = "respond to budget";

        let _guard = self.locks.lock(budget_id).await;
        let mut budget = self.load(budget_id).await?;
        actor.require_provider(budget.provider_id)?;
        budget.ensure_pending(OP)?;

        if request.estimated_hours <= Decimal::ZERO {
            return Err(ApiError::validation("Estimated hours must be greater than zero"));
        }
        if request.estimated_hours > MAX_ESTIMATED_HOURS {
            return Err(ApiError::validation(format!(
                "Estimated hours cannot exceed {}",
                MAX_ESTIMATED_HOURS
            )));
        }
        if hours_to_minutes(request.estimated_hours).is_none() {
            return Err(ApiError::validation(
                "Estimated hours must be a whole number of minutes",
            ));
        }

        let materials_cost = request.materials_cost.unwrap_or_default();
        if materials_cost.is_sign_negative() {
            return Err(ApiError::validation("Materials cost cannot be negative"));
        }
        if materials_cost > MAX_MATERIALS_COST {
            return Err(ApiError::validation(format!(
                "Materials cost cannot exceed {}",
                MAX_MATERIALS_COST
            )));
        }
        if materials_cost.normalize().scale() > self.policy.amount_scale {
            return Err(ApiError::validation(format!(
                "Materials cost allows at most {} decimal places",
                self.policy.amount_scale
            )));
        }

        let solution = request.solution_description.trim();
        if solution.is_empty() {
            return Err(ApiError::validation("Solution description is required"));
        }
        if solution.chars().count() > self.policy.solution_description_max_chars {
            return Err(ApiError::validation(format!(
                "Solution description cannot exceed {} characters",
                self.policy.solution_description_max_chars
            )));
        }

        let listing = self.listing(budget.service_id).await?;
        let total = listing
            .hourly_rate
            .checked_mul(request.estimated_hours)
            .and_then(|labour| labour.checked_add(materials_cost))
            .map(|t| t.round_dp_with_strategy(self.policy.amount_scale, self.policy.rounding))
            .filter(|t| *t <= MAX_TOTAL)
            .ok_or_else(|| {
                ApiError::validation(format!("Budget total cannot exceed {}", MAX_TOTAL))
            })?;

        let revised = budget.responded;
        budget.estimated_hours = Some(request.estimated_hours);
        budget.materials_cost = materials_cost;
        budget.hourly_rate = Some(listing.hourly_rate);
        budget.total = total;
        budget.solution_description = Some(solution.to_string());
        budget.responded = true;
        budget.responded_at = Some(Utc::now());
        // Sessions were sized for the previous estimate
        budget.selected_slots.clear();

        self.save(&mut budget, OP).await?;

        info!(
            total = %budget.total,
            estimated_hours = %request.estimated_hours,
            revised,
            "Budget answered"
        );
        Ok(budget)
    }

    #[instrument(skip_all, fields(budget_id = %budget_id, slots = request.slots.len()))]
    pub async fn select_schedule(
        &self,
        actor: &Actor,
        budget_id: Uuid,
        request: SelectScheduleRequest,
    ) -> ApiResult<Budget> {
        const OP: &str = "select schedule";

        let _guard = self.locks.lock(budget_id).await;
        let mut budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_answered(OP)?;

        let estimated = budget
            .estimated_hours
            .ok_or_else(|| ApiError::invalid_state(OP, "PENDIENTE (no estimate)"))?;
        let windows = self.availability_of(budget.service_id).await?;
        let mut selector = ScheduleSelector::new(estimated, windows)?;

        let today = Utc::now().date_naive();
        let last_day = today
            .checked_add_days(Days::new(u64::from(self.policy.schedule_horizon_days)))
            .unwrap_or(NaiveDate::MAX);

        for slot in &request.slots {
            if slot.date < today || slot.date >= last_day {
                return Err(ApiError::validation(format!(
                    "Session date {} must be within the next {} days",
                    slot.date, self.policy.schedule_horizon_days
                )));
            }
            selector.add_slot(slot.date, slot.start_time, slot.end_time)?;
        }

        let mut slots = selector.into_slots();
        slots.sort_by_key(|s| (s.date, s.start_time));
        budget.selected_slots = slots;

        self.save(&mut budget, OP).await?;

        info!(
            hours_remaining = %budget.remaining_hours(),
            "Schedule saved"
        );
        Ok(budget)
    }

    /// Approves a fully scheduled budget and creates its milestones.
    #[instrument(skip_all, fields(budget_id = %budget_id, client_id = %actor.user_id))]
    pub async fn approve(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<ApprovalResponse> {
        const OP: &str = "approve budget";

        let _guard = self.locks.lock(budget_id).await;
        let budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_answered(OP)?;

        // Recomputed from what is stored, whatever the client showed
        let shortfall = budget.estimated_minutes() - budget.allocated_minutes();
        if shortfall != 0 {
            return Err(ApiError::IncompleteSchedule {
                remaining_hours: minutes_to_hours(shortfall),
            });
        }

        let plans = plan_milestones(
            budget.total,
            &budget.selected_slots,
            Allocation::from(&self.policy),
        )?;

        let attempt_id = Uuid::new_v4();
        let mut holds: Vec<EscrowRef> = Vec::with_capacity(plans.len());
        for plan in &plans {
            let request = EscrowHoldRequest {
                attempt_id,
                budget_id,
                sequence_number: plan.sequence_number,
                amount: plan.amount,
                payer_id: budget.client_id,
                payee_id: budget.provider_id,
            };

            match self.escrow.open_escrow(&request).await {
                Ok(escrow_ref) => holds.push(escrow_ref),
                Err(e) => {
                    warn!(error = %e, seq = plan.sequence_number, "Escrow hold failed, rolling back approval");
                    self.void_holds(&holds).await;
                    return Err(e.into());
                }
            }
        }

        let milestones: Vec<Milestone> = plans
            .into_iter()
            .zip(holds.iter().cloned())
            .map(|(plan, escrow_ref)| plan.into_milestone(&budget, escrow_ref))
            .collect();

        let mut approved = budget.clone();
        approved.status = BudgetStatus::Approved;
        approved.touch();

        let committed = match self.store.commit_approval(&approved, &milestones).await {
            Ok(committed) => committed,
            Err(e) => {
                self.void_holds(&holds).await;
                return Err(e);
            }
        };

        if !committed {
            self.void_holds(&holds).await;
            let current = self
                .store
                .fetch_budget(budget_id)
                .await?
                .map(|b| b.status.to_string())
                .unwrap_or_else(|| "deleted".to_string());
            warn!(budget_id = %budget_id, current = %current, "Approval lost a concurrent race");
            return Err(ApiError::invalid_state(OP, current));
        }
        approved.version += 1;

        info!(
            milestones = milestones.len(),
            total = %approved.total,
            "Budget approved"
        );

        Ok(ApprovalResponse {
            budget: approved.into(),
            milestones_created: milestones.len(),
            milestones: milestones.into_iter().map(MilestoneResponse::from).collect(),
        })
    }

    /// Best effort: a hold that cannot be voided is logged for manual follow-up.
    async fn void_holds(&self, holds: &[EscrowRef]) {
        let results = join_all(holds.iter().map(|h| self.escrow.cancel(h))).await;
        for (hold, result) in holds.iter().zip(results) {
            if let Err(e) = result {
                warn!(escrow = %hold, error = %e, "Could not void escrow hold");
            }
        }
    }

    #[instrument(skip_all, fields(budget_id = %budget_id, client_id = %actor.user_id))]
    pub async fn reject(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<Budget> {
        const OP: &str = "reject budget";

        let _guard = self.locks.lock(budget_id).await;
        let mut budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_pending(OP)?;

        budget.status = BudgetStatus::Rejected;
        self.save(&mut budget, OP).await?;

        info!("Budget rejected");
        Ok(budget)
    }

    #[instrument(skip_all, fields(budget_id = %budget_id, client_id = %actor.user_id))]
    pub async fn delete(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<()> {
        const OP: &str = "delete budget";

        let _guard = self.locks.lock(budget_id).await;
        let budget = self.load(budget_id).await?;
        actor.require_client(budget.client_id)?;
        budget.ensure_pending(OP)?;

        if !self.store.delete_budget(&budget).await? {
            return Err(ApiError::invalid_state(OP, "modified by another request"));
        }

        info!("Budget deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Availability helpers
    // ------------------------------------------------------------------

    async fn availability_of(&self, service_id: Uuid) -> ApiResult<Vec<AvailabilityWindow>> {
        let listing = self.listing(service_id).await?;
        Ok(listing
            .availability
            .as_deref()
            .map(parse_availability)
            .unwrap_or_default())
    }

    /// Normalized weekly windows of a service.
    pub async fn availability(&self, service_id: Uuid) -> ApiResult<Vec<AvailabilityWindow>> {
        self.availability_of(service_id).await
    }

    /// Dates from `from` within the horizon on which the service offers `day`.
    pub async fn candidate_dates(
        &self,
        service_id: Uuid,
        day: DayOfWeek,
        from: NaiveDate,
    ) -> ApiResult<Vec<NaiveDate>> {
        let windows = self.availability_of(service_id).await?;
        if !windows.iter().any(|w| w.day == day) {
            return Ok(Vec::new());
        }
        Ok(candidate_dates(day, from, self.policy.schedule_horizon_days).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schedule::{hhmm, SlotRequest};
    use crate::test_support::{next_weekday, Fixture};

    fn slot(date: NaiveDate, start: &str, end: &str) -> SlotRequest {
        SlotRequest {
            date,
            start_time: hhmm::parse(start).unwrap(),
            end_time: hhmm::parse(end).unwrap(),
        }
    }

    fn respond_request(hours: i64, materials: i64) -> RespondBudgetRequest {
        RespondBudgetRequest {
            estimated_hours: Decimal::from(hours),
            materials_cost: Some(Decimal::from(materials)),
            solution_description: "Replace the cartridge and seals".into(),
        }
    }

    #[tokio::test]
    async fn response_computes_total_from_rate() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;
        assert_eq!(budget.status, BudgetStatus::Pending);
        assert!(!budget.responded);

        let answered = fx
            .budgets
            .respond(&fx.provider, budget.id, respond_request(4, 50))
            .await
            .unwrap();

        assert!(answered.responded);
        assert!(answered.responded_at.is_some());
        assert_eq!(answered.hourly_rate, Some(Decimal::from(25)));
        assert_eq!(answered.total, Decimal::from(150));
        assert_eq!(answered.status, BudgetStatus::Pending);
    }

    #[tokio::test]
    async fn short_problem_description_is_rejected() {
        let fx = Fixture::new();
        let err = fx
            .budgets
            .create(
                &fx.client,
                CreateBudgetRequest {
                    service_id: fx.service_id,
                    problem_description: "   leak   ".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn only_assigned_provider_can_respond() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;

        let stranger = Actor::provider(Uuid::new_v4());
        let err = fx
            .budgets
            .respond(&stranger, budget.id, respond_request(4, 50))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        // The client cannot answer its own request either
        let client_as_provider = Actor::client(budget.provider_id);
        assert!(fx
            .budgets
            .respond(&client_as_provider, budget.id, respond_request(4, 50))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn response_validates_amounts() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;

        for request in [
            respond_request(0, 50),
            respond_request(4, -1),
            RespondBudgetRequest {
                estimated_hours: Decimal::new(1234567, 6),
                materials_cost: None,
                solution_description: "Fix".into(),
            },
            RespondBudgetRequest {
                solution_description: "  ".into(),
                ..respond_request(4, 0)
            },
        ] {
            let err = fx.budgets.respond(&fx.provider, budget.id, request).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "unexpected {err:?}");
        }
    }

    #[tokio::test]
    async fn oversized_amounts_are_rejected_not_panicking() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;

        for request in [
            RespondBudgetRequest {
                estimated_hours: Decimal::from_i128_with_scale(7 * 10i128.pow(27), 0),
                ..respond_request(4, 0)
            },
            RespondBudgetRequest {
                estimated_hours: MAX_ESTIMATED_HOURS + Decimal::ONE,
                ..respond_request(4, 0)
            },
            RespondBudgetRequest {
                materials_cost: Some(Decimal::MAX),
                ..respond_request(4, 0)
            },
            RespondBudgetRequest {
                materials_cost: Some(Decimal::new(1005, 3)),
                ..respond_request(4, 0)
            },
        ] {
            let err = fx.budgets.respond(&fx.provider, budget.id, request).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "unexpected {err:?}");
        }

        // Largest estimate and materials still fit the stored total
        let answered = fx
            .budgets
            .respond(
                &fx.provider,
                budget.id,
                RespondBudgetRequest {
                    estimated_hours: MAX_ESTIMATED_HOURS,
                    materials_cost: Some(MAX_MATERIALS_COST),
                    ..respond_request(4, 0)
                },
            )
            .await
            .unwrap();
        assert!(answered.total <= MAX_TOTAL);
    }

    #[tokio::test]
    async fn schedule_then_approve_creates_milestones() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        let monday = next_weekday(DayOfWeek::Lunes);

        let partial = fx
            .budgets
            .select_schedule(
                &fx.client,
                budget.id,
                SelectScheduleRequest {
                    slots: vec![slot(monday, "09:00", "11:00")],
                },
            )
            .await
            .unwrap();
        assert_eq!(partial.remaining_hours(), Decimal::from(2));

        let too_long = fx
            .budgets
            .select_schedule(
                &fx.client,
                budget.id,
                SelectScheduleRequest {
                    slots: vec![slot(monday, "09:00", "11:00"), slot(monday + Days::new(7), "09:00", "12:00")],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(too_long, ApiError::Validation(_)));

        let full = fx
            .budgets
            .select_schedule(
                &fx.client,
                budget.id,
                SelectScheduleRequest {
                    slots: vec![slot(monday, "09:00", "11:00"), slot(monday + Days::new(7), "09:00", "11:00")],
                },
            )
            .await
            .unwrap();
        assert_eq!(full.remaining_hours(), Decimal::ZERO);

        let approval = fx.budgets.approve(&fx.client, budget.id).await.unwrap();
        assert_eq!(approval.budget.status, BudgetStatus::Approved);
        assert_eq!(approval.milestones_created, 2);

        let amounts: Decimal = approval.milestones.iter().map(|m| m.amount).sum();
        let percents: Decimal = approval.milestones.iter().map(|m| m.percentage).sum();
        assert_eq!(amounts, approval.budget.total);
        assert_eq!(percents, Decimal::ONE_HUNDRED);
        assert_eq!(fx.escrow.opened(), 2);
        assert_eq!(fx.store.milestone_count(), 2);
    }

    #[tokio::test]
    async fn uneven_sessions_split_price_by_duration() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        let monday = next_weekday(DayOfWeek::Lunes);

        fx.budgets
            .select_schedule(
                &fx.client,
                budget.id,
                SelectScheduleRequest {
                    slots: vec![slot(monday + Days::new(7), "10:00", "11:00"), slot(monday, "09:00", "12:00")],
                },
            )
            .await
            .unwrap();

        let approval = fx.budgets.approve(&fx.client, budget.id).await.unwrap();
        let first = &approval.milestones[0];
        let second = &approval.milestones[1];
        assert_eq!(first.sequence_number, 1);
        assert_eq!(first.percentage, Decimal::from(75));
        assert_eq!(first.amount, Decimal::new(11250, 2));
        assert_eq!(second.percentage, Decimal::from(25));
        assert_eq!(second.amount, Decimal::new(3750, 2));
    }

    #[tokio::test]
    async fn approval_requires_exact_allocation() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;

        // Nothing scheduled: the whole estimate is missing
        match fx.budgets.approve(&fx.client, budget.id).await.unwrap_err() {
            ApiError::IncompleteSchedule { remaining_hours } => {
                assert_eq!(remaining_hours, Decimal::from(4))
            }
            other => panic!("unexpected {other:?}"),
        }

        fx.schedule(budget.id, &[("09:00", "12:00")]).await;
        match fx.budgets.approve(&fx.client, budget.id).await.unwrap_err() {
            ApiError::IncompleteSchedule { remaining_hours } => {
                assert_eq!(remaining_hours, Decimal::from(1))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.escrow.opened(), 0);
    }

    #[tokio::test]
    async fn over_allocation_is_reported_as_negative_shortfall() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;

        // Stored schedule that no longer matches a revised estimate
        let mut stored = fx.store.fetch_budget(budget.id).await.unwrap().unwrap();
        stored.selected_slots = fx.slots(&[("09:00", "13:00"), ("09:00", "10:00")]);
        assert!(fx.store.update_budget(&stored).await.unwrap());

        match fx.budgets.approve(&fx.client, budget.id).await.unwrap_err() {
            ApiError::IncompleteSchedule { remaining_hours } => {
                assert_eq!(remaining_hours, Decimal::from(-1))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn escrow_failure_rolls_back_approval() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.schedule(budget.id, &[("09:00", "11:00"), ("11:00", "13:00")]).await;

        fx.escrow.fail_open_on(2);
        let err = fx.budgets.approve(&fx.client, budget.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Escrow { .. }));

        let stored = fx.store.fetch_budget(budget.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BudgetStatus::Pending);
        assert_eq!(fx.store.milestone_count(), 0);
        assert_eq!(fx.escrow.cancelled().len(), 1);

        // A later attempt goes through once the provider recovers
        fx.escrow.fail_open_on(0);
        let approval = fx.budgets.approve(&fx.client, budget.id).await.unwrap();
        assert_eq!(approval.milestones_created, 2);
    }

    #[tokio::test]
    async fn concurrent_approvals_have_one_winner() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.schedule(budget.id, &[("09:00", "13:00")]).await;

        let (a, b) = tokio::join!(
            fx.budgets.approve(&fx.client, budget.id),
            fx.budgets.approve(&fx.client, budget.id)
        );

        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(ApiError::InvalidState { .. })));
        assert_eq!(fx.store.milestone_count(), 1);
    }

    #[tokio::test]
    async fn racing_replicas_are_settled_by_version_check() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.schedule(budget.id, &[("09:00", "11:00"), ("11:00", "13:00")]).await;

        // Two services share the store but not their locks, like two replicas
        let other = fx.second_replica();
        fx.escrow.yield_on_open(true);

        let (a, b) = tokio::join!(
            fx.budgets.approve(&fx.client, budget.id),
            other.approve(&fx.client, budget.id)
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(ApiError::InvalidState { .. })));
        assert_eq!(fx.store.milestone_count(), 2);

        // Every hold the loser opened was voided, none of the winner's
        let opened = fx.escrow.opened();
        let cancelled = fx.escrow.cancelled();
        assert_eq!(opened - cancelled.len(), 2);
        let kept: Vec<_> = fx
            .store
            .list_milestones_by_budget(budget.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.escrow_ref)
            .collect();
        assert!(kept.iter().all(|r| !cancelled.contains(r)));
    }

    #[tokio::test]
    async fn approve_and_reject_race_has_one_winner() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.schedule(budget.id, &[("09:00", "13:00")]).await;

        let (approved, rejected) = tokio::join!(
            fx.budgets.approve(&fx.client, budget.id),
            fx.budgets.reject(&fx.client, budget.id)
        );
        assert!(approved.is_ok() != rejected.is_ok());

        let stored = fx.store.fetch_budget(budget.id).await.unwrap().unwrap();
        assert_ne!(stored.status, BudgetStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_budgets_refuse_every_transition() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.budgets.reject(&fx.client, budget.id).await.unwrap();

        assert!(matches!(
            fx.budgets.respond(&fx.provider, budget.id, respond_request(4, 0)).await,
            Err(ApiError::InvalidState { .. })
        ));
        assert!(matches!(
            fx.budgets.approve(&fx.client, budget.id).await,
            Err(ApiError::InvalidState { .. })
        ));
        assert!(matches!(
            fx.budgets.reject(&fx.client, budget.id).await,
            Err(ApiError::InvalidState { .. })
        ));
        assert!(matches!(
            fx.budgets.delete(&fx.client, budget.id).await,
            Err(ApiError::InvalidState { .. })
        ));
        assert!(matches!(
            fx.budgets
                .select_schedule(&fx.client, budget.id, SelectScheduleRequest { slots: vec![] })
                .await,
            Err(ApiError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_needs_a_response_first() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;
        let err = fx
            .budgets
            .select_schedule(&fx.client, budget.id, SelectScheduleRequest { slots: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn revising_a_response_clears_the_schedule() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        fx.schedule(budget.id, &[("09:00", "11:00")]).await;

        let revised = fx
            .budgets
            .respond(&fx.provider, budget.id, respond_request(3, 0))
            .await
            .unwrap();
        assert!(revised.selected_slots.is_empty());
        assert_eq!(revised.total, Decimal::from(75));
    }

    #[tokio::test]
    async fn past_dates_are_refused() {
        let fx = Fixture::new();
        let budget = fx.answered_budget(4).await;
        let past_monday = next_weekday(DayOfWeek::Lunes) - Days::new(14);

        let err = fx
            .budgets
            .select_schedule(
                &fx.client,
                budget.id,
                SelectScheduleRequest {
                    slots: vec![slot(past_monday, "09:00", "11:00")],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn attachments_follow_policy() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;
        let file = |mime: &str, size: usize| NewAttachment {
            file_name: "leak.jpg".into(),
            mime_type: mime.into(),
            bytes: vec![7u8; size],
        };

        let stored = fx
            .budgets
            .attach_file(&fx.client, budget.id, file("image/jpeg", 1024))
            .await
            .unwrap();
        assert_eq!(stored.kind, AttachmentKind::Image);

        assert!(matches!(
            fx.budgets.attach_file(&fx.client, budget.id, file("application/pdf", 10)).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            fx.budgets
                .attach_file(&fx.client, budget.id, file("video/mp4", 5 * 1024 * 1024 + 1))
                .await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            fx.budgets.attach_file(&fx.provider, budget.id, file("image/png", 10)).await,
            Err(ApiError::Forbidden(_))
        ));

        for _ in 0..4 {
            fx.budgets
                .attach_file(&fx.client, budget.id, file("video/mp4", 10))
                .await
                .unwrap();
        }
        assert!(matches!(
            fx.budgets.attach_file(&fx.client, budget.id, file("image/png", 10)).await,
            Err(ApiError::Validation(_))
        ));

        let listed = fx.budgets.list_attachments(&fx.provider, budget.id).await.unwrap();
        assert_eq!(listed.len(), 5);

        let content = fx.budgets.attachment_content(&fx.provider, stored.id).await.unwrap();
        assert_eq!(content.bytes.len(), 1024);

        fx.budgets.delete_attachment(&fx.client, stored.id).await.unwrap();
        assert!(matches!(
            fx.budgets.attachment_content(&fx.client, stored.id).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_file_in_a_batch_stores_nothing() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;
        let file = |name: &str, mime: &str| NewAttachment {
            file_name: name.into(),
            mime_type: mime.into(),
            bytes: vec![0u8; 64],
        };

        let err = fx
            .budgets
            .attach_files(
                &fx.client,
                budget.id,
                vec![file("before.jpg", "image/jpeg"), file("quote.pdf", "application/pdf")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let too_many = (0..6).map(|i| file(&format!("{i}.png"), "image/png")).collect();
        assert!(matches!(
            fx.budgets.attach_files(&fx.client, budget.id, too_many).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            fx.budgets.attach_files(&fx.client, budget.id, Vec::new()).await,
            Err(ApiError::Validation(_))
        ));
        assert!(fx.budgets.list_attachments(&fx.client, budget.id).await.unwrap().is_empty());

        let stored = fx
            .budgets
            .attach_files(
                &fx.client,
                budget.id,
                vec![file("before.jpg", "image/jpeg"), file("", "video/mp4")],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].file_name, "attachment-2");
    }

    #[tokio::test]
    async fn deleting_a_budget_removes_its_attachments() {
        let fx = Fixture::new();
        let budget = fx.request_budget().await;
        let stored = fx
            .budgets
            .attach_file(
                &fx.client,
                budget.id,
                NewAttachment {
                    file_name: String::new(),
                    mime_type: "image/png".into(),
                    bytes: vec![1, 2, 3],
                },
            )
            .await
            .unwrap();
        assert_eq!(stored.file_name, "attachment-1");

        fx.budgets.delete(&fx.client, budget.id).await.unwrap();
        assert!(matches!(
            fx.budgets.get(&fx.client, budget.id).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(fx.store.fetch_attachment(stored.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listings_are_scoped_to_the_caller() {
        let fx = Fixture::new();
        let mine = fx.answered_budget(4).await;
        let _unanswered = fx.request_budget().await;

        let (all, total) = fx
            .budgets
            .list(&fx.provider, BudgetFilter::default(), Page::all())
            .await
            .unwrap();
        assert_eq!((all.len(), total), (2, 2));

        let actionable = BudgetFilter {
            actionable_only: true,
            ..Default::default()
        };
        let (only, _) = fx.budgets.list(&fx.provider, actionable, Page::all()).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, mine.id);

        let outsider = Actor::client(Uuid::new_v4());
        let (none, total) = fx
            .budgets
            .list(&outsider, BudgetFilter::default(), Page::all())
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(total, 0);

        let responded = fx.budgets.is_responded(&fx.client, mine.id).await.unwrap();
        assert!(responded.responded);
        assert!(matches!(
            fx.budgets.is_responded(&outsider, mine.id).await,
            Err(ApiError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn candidate_dates_only_for_offered_days() {
        let fx = Fixture::new();
        let monday = next_weekday(DayOfWeek::Lunes);

        let dates = fx
            .budgets
            .candidate_dates(fx.service_id, DayOfWeek::Lunes, monday)
            .await
            .unwrap();
        assert_eq!(dates.first(), Some(&monday));
        assert!(dates.iter().all(|d| DayOfWeek::of(*d) == DayOfWeek::Lunes));
        assert_eq!(dates.len(), 9);

        let sundays = fx
            .budgets
            .candidate_dates(fx.service_id, DayOfWeek::Domingo, monday)
            .await
            .unwrap();
        assert!(sundays.is_empty());
    }
}
