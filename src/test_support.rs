//! Shared fixtures for the workflow tests.

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::WorkflowPolicy;
use crate::domain::budgets::{
    Budget, CreateBudgetRequest, RespondBudgetRequest, SelectScheduleRequest,
};
use crate::domain::milestones::EscrowRef;
use crate::domain::schedule::{hhmm, minutes_to_hours, DayOfWeek, SlotRequest, TimeSlot};
use crate::domain::Actor;
use crate::services::budgets::BudgetService;
use crate::services::escrow::{EscrowError, EscrowHoldRequest, EscrowProvider};
use crate::services::milestones::MilestoneService;
use crate::store::memory::MemoryStore;
use crate::store::ServiceListing;

/// Escrow double that records every call and fails on request.
#[derive(Default)]
pub struct FakeEscrow {
    attempts: AtomicUsize,
    opened: AtomicUsize,
    fail_open_on: AtomicUsize,
    fail_releases: AtomicBool,
    yield_on_open: AtomicBool,
    yield_on_release: AtomicBool,
    released: Mutex<Vec<EscrowRef>>,
    cancelled: Mutex<Vec<EscrowRef>>,
}

impl FakeEscrow {
    /// The n-th open attempt (1-based) is rejected; 0 disables.
    pub fn fail_open_on(&self, n: usize) {
        self.fail_open_on.store(n, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Hands control back to the runtime inside every open.
    pub fn yield_on_open(&self, yield_now: bool) {
        self.yield_on_open.store(yield_now, Ordering::SeqCst);
    }

    /// Hands control back to the runtime inside every release.
    pub fn yield_on_release(&self, yield_now: bool) {
        self.yield_on_release.store(yield_now, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<EscrowRef> {
        self.released.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<EscrowRef> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl EscrowProvider for FakeEscrow {
    async fn open_escrow(&self, request: &EscrowHoldRequest) -> Result<EscrowRef, EscrowError> {
        if self.yield_on_open.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_open_on.load(Ordering::SeqCst) {
            return Err(EscrowError::Rejected("card declined".into()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(EscrowRef(format!(
            "esc_{}_{}_{}",
            request.budget_id.simple(),
            request.sequence_number,
            attempt
        )))
    }

    async fn release(&self, escrow: &EscrowRef) -> Result<(), EscrowError> {
        if self.yield_on_release.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(EscrowError::Unavailable("gateway timeout".into()));
        }
        self.released.lock().push(escrow.clone());
        Ok(())
    }

    async fn cancel(&self, escrow: &EscrowRef) -> Result<(), EscrowError> {
        self.cancelled.lock().push(escrow.clone());
        Ok(())
    }
}

/// First date after today falling on `day`.
pub fn next_weekday(day: DayOfWeek) -> NaiveDate {
    let today = Utc::now().date_naive();
    (1..=7)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .find(|date| DayOfWeek::of(*date) == day)
        .unwrap()
}

pub const HOURLY_RATE: i64 = 25;
pub const MATERIALS: i64 = 50;

/// One client, one provider and one plumbing service open on Monday
/// mornings and Wednesday afternoons.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub escrow: Arc<FakeEscrow>,
    pub budgets: BudgetService,
    pub milestones: MilestoneService,
    pub client: Actor,
    pub provider: Actor,
    pub service_id: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let escrow = Arc::new(FakeEscrow::default());
        let provider = Actor::provider(Uuid::new_v4());
        let service_id = Uuid::new_v4();

        store.add_service(ServiceListing {
            service_id,
            provider_id: provider.user_id,
            hourly_rate: Decimal::from(HOURLY_RATE),
            availability: Some(r#"{"LUNES": "09:00-13:00", "MIÉRCOLES": "14:00-18:00"}"#.into()),
        });

        Self {
            budgets: BudgetService::new(
                store.clone(),
                store.clone(),
                escrow.clone(),
                WorkflowPolicy::default(),
            ),
            milestones: MilestoneService::new(store.clone(), escrow.clone()),
            store,
            escrow,
            client: Actor::client(Uuid::new_v4()),
            provider,
            service_id,
        }
    }

    /// Another budget service over the same store, with its own locks.
    pub fn second_replica(&self) -> BudgetService {
        BudgetService::new(
            self.store.clone(),
            self.store.clone(),
            self.escrow.clone(),
            WorkflowPolicy::default(),
        )
    }

    pub async fn request_budget(&self) -> Budget {
        self.budgets
            .create(
                &self.client,
                CreateBudgetRequest {
                    service_id: self.service_id,
                    problem_description: "Leaking kitchen faucet".into(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn answered_budget(&self, hours: i64) -> Budget {
        self.answer(Decimal::from(hours)).await
    }

    async fn answer(&self, hours: Decimal) -> Budget {
        let budget = self.request_budget().await;
        self.budgets
            .respond(
                &self.provider,
                budget.id,
                RespondBudgetRequest {
                    estimated_hours: hours,
                    materials_cost: Some(Decimal::from(MATERIALS)),
                    solution_description: "Replace the cartridge and seals".into(),
                },
            )
            .await
            .unwrap()
    }

    /// Sessions on next Monday.
    pub fn slots(&self, ranges: &[(&str, &str)]) -> Vec<TimeSlot> {
        let monday = next_weekday(DayOfWeek::Lunes);
        ranges
            .iter()
            .map(|(start, end)| {
                TimeSlot::new(monday, hhmm::parse(start).unwrap(), hhmm::parse(end).unwrap())
                    .unwrap()
            })
            .collect()
    }

    pub async fn schedule(&self, budget_id: Uuid, ranges: &[(&str, &str)]) -> Budget {
        let slots = self
            .slots(ranges)
            .into_iter()
            .map(|s| SlotRequest {
                date: s.date,
                start_time: s.start_time,
                end_time: s.end_time,
            })
            .collect();

        self.budgets
            .select_schedule(&self.client, budget_id, SelectScheduleRequest { slots })
            .await
            .unwrap()
    }

    /// Answered for exactly the hours in `ranges`, scheduled and approved.
    pub async fn approved_budget(&self, ranges: &[(&str, &str)]) -> Uuid {
        let minutes: i64 = self.slots(ranges).iter().map(TimeSlot::duration_minutes).sum();
        let budget = self.answer(minutes_to_hours(minutes)).await;
        self.schedule(budget.id, ranges).await;
        self.budgets.approve(&self.client, budget.id).await.unwrap();
        budget.id
    }
}
