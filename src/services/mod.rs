//! Workflow services and the algorithms behind them.
//!
//! `BudgetService` and `MilestoneService` are what the handlers call; the
//! remaining modules are the pure pieces they are built from plus the escrow
//! provider client.

pub mod availability;
pub mod budgets;
pub mod escrow;
pub mod locks;
pub mod milestone_plan;
pub mod milestones;
pub mod schedule_selector;

pub use budgets::{BudgetService, NewAttachment};
pub use escrow::HttpEscrowClient;
pub use milestones::MilestoneService;
