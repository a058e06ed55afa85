pub mod budgets;
pub mod health;
pub mod milestones;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes.
///
/// `upload_limit` caps multipart attachment bodies.
pub fn api_router(upload_limit: usize) -> Router<Arc<AppState>> {
    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        // Budgets
        .route("/budgets", post(budgets::create_budget))
        .route(
            "/budgets/:id",
            get(budgets::get_budget).delete(budgets::delete_budget),
        )
        .route("/budgets/:id/respond", post(budgets::respond_budget))
        .route("/budgets/:id/schedule", put(budgets::select_schedule))
        .route("/budgets/:id/approve", post(budgets::approve_budget))
        .route("/budgets/:id/reject", post(budgets::reject_budget))
        .route("/budgets/:id/responded", get(budgets::budget_responded))
        .route(
            "/budgets/:id/attachments",
            post(budgets::upload_attachments)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(budgets::list_attachments),
        )
        .route("/budgets/client/:id", get(budgets::list_by_client))
        .route("/budgets/provider/:id", get(budgets::list_by_provider))
        .route("/budgets/service/:id", get(budgets::list_by_service))
        .route("/budgets/state/:state", get(budgets::list_by_state))
        // Attachments
        .route("/attachments/:id", delete(budgets::delete_attachment))
        .route("/attachments/:id/content", get(budgets::download_attachment))
        // Provider availability
        .route(
            "/services/:id/availability",
            get(budgets::service_availability),
        )
        .route(
            "/services/:id/availability/dates",
            get(budgets::candidate_dates),
        )
        // Milestones
        .route("/budgets/:id/milestones", get(milestones::list_by_budget))
        .route("/milestones/:id", get(milestones::get_milestone))
        .route("/milestones/client/:id", get(milestones::list_by_client))
        .route("/milestones/:id/start", post(milestones::start_milestone))
        .route(
            "/milestones/:id/complete",
            post(milestones::complete_milestone),
        )
        .route("/milestones/:id/approve", post(milestones::approve_milestone))
        .route(
            "/milestones/:id/release-funds",
            post(milestones::release_funds),
        )
        .route("/milestones/:id/dispute", post(milestones::dispute_milestone))
        .route("/milestones/:id/cancel", post(milestones::cancel_milestone))
}
