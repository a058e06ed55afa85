//! Milestone workflow: start, complete, approve, pay out, dispute, cancel.
//!
//! State is always re-read and checked here; whatever the caller believes
//! the milestone's state to be is ignored. A payout first claims the row
//! with a version-checked write, so no other transition can slip in while
//! the escrow provider is moving funds. A failed release drops the claim and
//! leaves the milestone in `APROBADO_CLIENTE`, ready to be retried.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::escrow::EscrowProvider;
use super::locks::EntityLocks;
use crate::domain::milestones::{
    CompleteMilestoneRequest, DisputeRecord, DisputeRequest, DisputeResponse, Milestone,
    MilestoneAction, ReleaseReceipt,
};
use crate::domain::{Actor, Role};
use crate::error::{ApiError, ApiResult};
use crate::store::MarketStore;

pub struct MilestoneService {
    store: Arc<dyn MarketStore>,
    escrow: Arc<dyn EscrowProvider>,
    locks: EntityLocks,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl MilestoneService {
    pub fn new(store: Arc<dyn MarketStore>, escrow: Arc<dyn EscrowProvider>) -> Self {
        Self {
            store,
            escrow,
            locks: EntityLocks::default(),
        }
    }

    async fn load(&self, milestone_id: Uuid) -> ApiResult<Milestone> {
        self.store
            .fetch_milestone(milestone_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Milestone {} not found", milestone_id)))
    }

    fn authorize(actor: &Actor, milestone: &Milestone, action: MilestoneAction) -> ApiResult<()> {
        match action.required_role() {
            Some(Role::Client) => actor.require_client(milestone.client_id),
            Some(Role::Provider) => actor.require_provider(milestone.provider_id),
            None => actor.require_party(milestone.client_id, milestone.provider_id),
        }
    }

    async fn save(&self, milestone: &mut Milestone, action: MilestoneAction) -> ApiResult<()> {
        milestone.updated_at = Utc::now();
        if !self.store.update_milestone(milestone).await? {
            warn!(milestone_id = %milestone.id, %action, "Milestone changed concurrently");
            return Err(ApiError::invalid_state(
                format!("{} milestone", action),
                "modified by another request",
            ));
        }
        milestone.version += 1;
        Ok(())
    }

    /// Authorizes, moves to the next state, applies `update` and saves.
    async fn transition<F>(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        action: MilestoneAction,
        update: F,
    ) -> ApiResult<Milestone>
    where
        F: FnOnce(&mut Milestone) + Send,
    {
        let _guard = self.locks.lock(milestone_id).await;
        let mut milestone = self.load(milestone_id).await?;
        Self::authorize(actor, &milestone, action)?;

        let from = milestone.status;
        milestone.status = milestone.next_status(action)?;
        update(&mut milestone);
        self.save(&mut milestone, action).await?;

        info!(
            milestone_id = %milestone.id,
            budget_id = %milestone.budget_id,
            from = %from,
            to = %milestone.status,
            "Milestone updated"
        );
        Ok(milestone)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get(&self, actor: &Actor, milestone_id: Uuid) -> ApiResult<Milestone> {
        let milestone = self.load(milestone_id).await?;
        actor.require_party(milestone.client_id, milestone.provider_id)?;
        Ok(milestone)
    }

    pub async fn list_by_budget(&self, actor: &Actor, budget_id: Uuid) -> ApiResult<Vec<Milestone>> {
        let budget = self
            .store
            .fetch_budget(budget_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Budget {} not found", budget_id)))?;
        actor.require_party(budget.client_id, budget.provider_id)?;

        self.store.list_milestones_by_budget(budget_id).await
    }

    /// Every milestone the client is paying for, across budgets.
    pub async fn list_by_client(&self, actor: &Actor, client_id: Uuid) -> ApiResult<Vec<Milestone>> {
        actor.require_client(client_id)?;
        self.store.list_milestones_by_client(client_id).await
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(milestone_id = %milestone_id))]
    pub async fn start(&self, actor: &Actor, milestone_id: Uuid) -> ApiResult<Milestone> {
        self.transition(actor, milestone_id, MilestoneAction::Start, |_| {})
            .await
    }

    #[instrument(skip_all, fields(milestone_id = %milestone_id))]
    pub async fn complete(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        request: CompleteMilestoneRequest,
    ) -> ApiResult<Milestone> {
        let evidence = non_blank(request.evidence);
        let comments = non_blank(request.comments);

        self.transition(actor, milestone_id, MilestoneAction::Complete, move |m| {
            m.completed_at = Some(Utc::now());
            m.evidence = evidence;
            m.comments = comments;
        })
        .await
    }

    #[instrument(skip_all, fields(milestone_id = %milestone_id))]
    pub async fn approve(&self, actor: &Actor, milestone_id: Uuid) -> ApiResult<Milestone> {
        self.transition(actor, milestone_id, MilestoneAction::Approve, |_| {})
            .await
    }

    /// Pays the milestone out. Only one call can succeed per milestone.
    ///
    /// A claim left behind by a crashed payout is taken over by the next
    /// call; the provider deduplicates releases per escrow reference.
    #[instrument(skip_all, fields(milestone_id = %milestone_id))]
    pub async fn release_funds(&self, actor: &Actor, milestone_id: Uuid) -> ApiResult<ReleaseReceipt> {
        let action = MilestoneAction::ReleaseFunds;

        let _guard = self.locks.lock(milestone_id).await;
        let mut milestone = self.load(milestone_id).await?;
        Self::authorize(actor, &milestone, action)?;
        let next = milestone.next_status(action)?;

        milestone.release_started_at = Some(Utc::now());
        self.save(&mut milestone, action).await?;

        if let Err(e) = self.escrow.release(&milestone.escrow_ref).await {
            warn!(escrow = %milestone.escrow_ref, error = %e, "Escrow release failed");
            milestone.release_started_at = None;
            if let Err(unclaim) = self.save(&mut milestone, action).await {
                warn!(error = %unclaim, "Could not drop the payout claim");
            }
            return Err(e.into());
        }

        milestone.status = next;
        milestone.release_started_at = None;
        milestone.released_at = Some(Utc::now());
        if let Err(e) = self.save(&mut milestone, action).await {
            error!(
                escrow = %milestone.escrow_ref,
                amount = %milestone.amount,
                "Funds released but the milestone could not be marked paid"
            );
            return Err(e);
        }

        info!(
            budget_id = %milestone.budget_id,
            amount = %milestone.amount,
            "Milestone funds released"
        );

        Ok(ReleaseReceipt {
            milestone_id,
            amount_released: milestone.amount,
            new_state: milestone.status,
            message: format!(
                "Released {} to the provider for session {}",
                milestone.amount, milestone.sequence_number
            ),
        })
    }

    #[instrument(skip_all, fields(milestone_id = %milestone_id, raised_by = %actor.user_id))]
    pub async fn dispute(
        &self,
        actor: &Actor,
        milestone_id: Uuid,
        request: DisputeRequest,
    ) -> ApiResult<DisputeResponse> {
        let reason = request.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ApiError::validation("A dispute needs a reason"));
        }

        let record = DisputeRecord {
            reason: reason.clone(),
            description: non_blank(request.description),
            raised_by: actor.user_id,
            raised_at: Utc::now(),
        };

        let milestone = self
            .transition(actor, milestone_id, MilestoneAction::Dispute, move |m| {
                m.dispute = Some(record);
            })
            .await?;

        Ok(DisputeResponse {
            milestone_id,
            reason,
            new_state: milestone.status,
            message: "Milestone frozen until the dispute is resolved".to_string(),
        })
    }

    /// Voids the escrow hold, then marks the milestone cancelled.
    #[instrument(skip_all, fields(milestone_id = %milestone_id))]
    pub async fn cancel(&self, actor: &Actor, milestone_id: Uuid) -> ApiResult<Milestone> {
        let action = MilestoneAction::Cancel;

        let _guard = self.locks.lock(milestone_id).await;
        let mut milestone = self.load(milestone_id).await?;
        Self::authorize(actor, &milestone, action)?;
        let from = milestone.status;
        let next = milestone.next_status(action)?;

        self.escrow.cancel(&milestone.escrow_ref).await?;

        milestone.status = next;
        self.save(&mut milestone, action).await?;

        info!(
            budget_id = %milestone.budget_id,
            from = %from,
            cancelled_by = %actor.user_id,
            "Milestone cancelled"
        );
        Ok(milestone)
    }
}
