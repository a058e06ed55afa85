//! Domain types and DTOs
//!
//! Entities and wire types for the quote and escrowed-milestone workflow.

pub mod actor;
pub mod budgets;
pub mod milestones;
pub mod schedule;

pub use actor::{Actor, Role};
pub use budgets::*;
pub use milestones::*;
pub use schedule::*;
