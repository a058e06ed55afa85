//! Milestone endpoints

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::{CompleteMilestoneRequest, DisputeRequest, Milestone, MilestoneResponse};
use crate::error::ApiResult;

fn responses(milestones: Vec<Milestone>) -> Vec<MilestoneResponse> {
    milestones.into_iter().map(MilestoneResponse::from).collect()
}

pub async fn get_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestone = state.milestones.get(&actor, milestone_id).await?;
    Ok(Json(DataResponse::new(MilestoneResponse::from(milestone))))
}

/// Milestones of one budget in sequence order
pub async fn list_by_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestones = state.milestones.list_by_budget(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(responses(milestones))))
}

/// The client's milestones across all of their budgets
pub async fn list_by_client(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestones = state.milestones.list_by_client(&actor, client_id).await?;
    Ok(Json(DataResponse::new(responses(milestones))))
}

pub async fn start_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestone = state.milestones.start(&actor, milestone_id).await?;
    Ok(Json(DataResponse::new(MilestoneResponse::from(milestone))))
}

/// Provider marks the session done; evidence and comments are optional
pub async fn complete_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
    body: Option<Json<CompleteMilestoneRequest>>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let milestone = state.milestones.complete(&actor, milestone_id, req).await?;
    Ok(Json(DataResponse::new(MilestoneResponse::from(milestone))))
}

pub async fn approve_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestone = state.milestones.approve(&actor, milestone_id).await?;
    Ok(Json(DataResponse::new(MilestoneResponse::from(milestone))))
}

pub async fn release_funds(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let receipt = state.milestones.release_funds(&actor, milestone_id).await?;
    Ok(Json(DataResponse::new(receipt)))
}

pub async fn dispute_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
    Json(req): Json<DisputeRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let response = state.milestones.dispute(&actor, milestone_id, req).await?;
    Ok(Json(DataResponse::new(response)))
}

pub async fn cancel_milestone(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let milestone = state.milestones.cancel(&actor, milestone_id).await?;
    Ok(Json(DataResponse::new(MilestoneResponse::from(milestone))))
}
