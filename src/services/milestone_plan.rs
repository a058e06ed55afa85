//! Splits an approved budget into one milestone per scheduled session.

use chrono::{NaiveDateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

use crate::config::WorkflowPolicy;
use crate::domain::budgets::Budget;
use crate::domain::milestones::{EscrowRef, Milestone, MilestoneStatus};
use crate::domain::schedule::TimeSlot;
use crate::error::{ApiError, ApiResult};

/// Rounding rules for spreading a total over milestones.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub percent_scale: u32,
    pub amount_scale: u32,
    pub rounding: RoundingStrategy,
}

impl From<&WorkflowPolicy> for Allocation {
    fn from(policy: &WorkflowPolicy) -> Self {
        Self {
            percent_scale: policy.percent_scale,
            amount_scale: policy.amount_scale,
            rounding: policy.rounding,
        }
    }
}

/// A milestone before it has an escrow hold or an id.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestonePlan {
    pub sequence_number: i32,
    pub description: String,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub scheduled_start: NaiveDateTime,
    pub estimated_completion: NaiveDateTime,
}

impl MilestonePlan {
    /// Fresh `PENDIENTE` milestone of `budget` backed by `escrow_ref`.
    pub fn into_milestone(self, budget: &Budget, escrow_ref: EscrowRef) -> Milestone {
        let now = Utc::now();
        Milestone {
            id: Uuid::new_v4(),
            budget_id: budget.id,
            client_id: budget.client_id,
            provider_id: budget.provider_id,
            sequence_number: self.sequence_number,
            description: self.description,
            percentage: self.percentage,
            amount: self.amount,
            status: MilestoneStatus::Pending,
            scheduled_start: self.scheduled_start,
            estimated_completion: self.estimated_completion,
            completed_at: None,
            escrow_ref,
            evidence: None,
            comments: None,
            dispute: None,
            release_started_at: None,
            released_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Splits `whole` in proportion to `weights`, each share rounded to `scale`.
///
/// Leftovers from rounding land on the last share. When rounding up the
/// earlier shares already overshoots `whole`, shares are taken as differences
/// of rounded running totals instead, which keeps every share in `0..=whole`
/// and still sums exactly.
fn distribute(
    weights: &[Decimal],
    whole: Decimal,
    scale: u32,
    rounding: RoundingStrategy,
) -> Vec<Decimal> {
    let weight_total: Decimal = weights.iter().copied().sum();
    let share_of = |weight: Decimal| {
        (weight * whole / weight_total).round_dp_with_strategy(scale, rounding)
    };
    let (head, _) = weights.split_at(weights.len().saturating_sub(1));

    let mut shares: Vec<Decimal> = head.iter().copied().map(share_of).collect();
    let assigned: Decimal = shares.iter().copied().sum();
    if assigned <= whole {
        shares.push(whole - assigned);
        return shares;
    }

    shares.clear();
    let mut running = Decimal::ZERO;
    let mut previous_edge = Decimal::ZERO;
    for weight in head {
        running += *weight;
        let edge = share_of(running);
        shares.push(edge - previous_edge);
        previous_edge = edge;
    }
    shares.push(whole - previous_edge);
    shares
}

/// One milestone per slot in chronological order. Percentages sum to exactly
/// 100 and amounts to exactly `total`.
pub fn plan_milestones(
    total: Decimal,
    slots: &[TimeSlot],
    allocation: Allocation,
) -> ApiResult<Vec<MilestonePlan>> {
    if slots.is_empty() {
        return Err(ApiError::NoSchedule);
    }

    let mut ordered = slots.to_vec();
    ordered.sort_by_key(|s| (s.date, s.start_time, s.end_time));

    let total_minutes: i64 = ordered.iter().map(TimeSlot::duration_minutes).sum();
    if total_minutes <= 0 {
        return Err(ApiError::NoSchedule);
    }

    let minutes: Vec<Decimal> = ordered
        .iter()
        .map(|s| Decimal::from(s.duration_minutes()))
        .collect();
    let percentages = distribute(
        &minutes,
        Decimal::ONE_HUNDRED,
        allocation.percent_scale,
        allocation.rounding,
    );
    let amounts = distribute(&percentages, total, allocation.amount_scale, allocation.rounding);

    let count = ordered.len();
    let plans = ordered
        .iter()
        .zip(percentages)
        .zip(amounts)
        .enumerate()
        .map(|(index, ((slot, percentage), amount))| MilestonePlan {
            sequence_number: (index + 1) as i32,
            description: format!(
                "Session {} of {} on {} {}-{}",
                index + 1,
                count,
                slot.date,
                slot.start_time.format("%H:%M"),
                slot.end_time.format("%H:%M")
            ),
            percentage,
            amount,
            scheduled_start: slot.starts_at(),
            estimated_completion: slot.ends_at(),
        })
        .collect();

    Ok(plans)
}
