//! Budget (quote) endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{Created, DataResponse, NoContent, Paginated, PaginationParams};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::{
    BudgetFilter, BudgetResponse, BudgetStatus, CreateBudgetRequest, DayOfWeek,
    RespondBudgetRequest, SelectScheduleRequest,
};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestIdExt;
use crate::services::NewAttachment;

#[derive(Debug, Deserialize, Default)]
pub struct ListFilterQuery {
    #[serde(default)]
    pub actionable_only: bool,
}

/// Create a budget request for a service
pub async fn create_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBudgetRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    tracing::debug!(request_id = ?headers.request_id(), "Creating budget");

    let budget = state.budgets.create(&actor, req).await?;
    Ok(Created(BudgetResponse::from(budget)))
}

pub async fn get_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let budget = state.budgets.get(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(budget)))
}

pub async fn delete_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<NoContent> {
    let actor = auth.actor()?;
    state.budgets.delete(&actor, budget_id).await?;
    Ok(NoContent)
}

/// Provider's answer: hours, materials and proposed solution
pub async fn respond_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
    Json(req): Json<RespondBudgetRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let budget = state.budgets.respond(&actor, budget_id, req).await?;
    Ok(Json(DataResponse::new(BudgetResponse::from(budget))))
}

/// Replace the client's selected sessions
pub async fn select_schedule(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
    Json(req): Json<SelectScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let budget = state.budgets.select_schedule(&actor, budget_id, req).await?;
    Ok(Json(DataResponse::new(BudgetResponse::from(budget))))
}

pub async fn approve_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let approval = state.budgets.approve(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(approval)))
}

pub async fn reject_budget(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let budget = state.budgets.reject(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(BudgetResponse::from(budget))))
}

pub async fn budget_responded(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let responded = state.budgets.is_responded(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(responded)))
}

// ============================================================================
// Attachments
// ============================================================================

/// Multipart upload; every file part becomes one attachment. The parts are
/// stored all together or not at all.
pub async fn upload_attachments(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("Malformed multipart body: {}", e)))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::validation(format!("Could not read upload: {}", e)))?;

        files.push(NewAttachment {
            file_name,
            mime_type,
            bytes: bytes.to_vec(),
        });
    }

    let stored = state.budgets.attach_files(&actor, budget_id, files).await?;
    Ok(Created(stored))
}

pub async fn list_attachments(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(budget_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let attachments = state.budgets.list_attachments(&actor, budget_id).await?;
    Ok(Json(DataResponse::new(attachments)))
}

/// Raw attachment bytes with their stored content type
pub async fn download_attachment(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = auth.actor()?;
    let content = state.budgets.attachment_content(&actor, attachment_id).await?;

    let safe_name: String = content
        .attachment
        .file_name
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .filter(|c| *c != '"' && *c != '\\')
        .collect();

    Ok((
        [
            (header::CONTENT_TYPE, content.attachment.mime_type),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", safe_name),
            ),
        ],
        content.bytes,
    ))
}

pub async fn delete_attachment(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<NoContent> {
    let actor = auth.actor()?;
    state.budgets.delete_attachment(&actor, attachment_id).await?;
    Ok(NoContent)
}

// ============================================================================
// Listings
// ============================================================================

async fn list_with(
    auth: RequireAuth,
    state: Arc<AppState>,
    filter: BudgetFilter,
    pagination: PaginationParams,
) -> ApiResult<Paginated<BudgetResponse>> {
    let actor = auth.actor()?;
    let (budgets, total) = state
        .budgets
        .list(&actor, filter, (&pagination).into())
        .await?;

    tracing::debug!(
        user_id = %actor.user_id,
        page = pagination.page(),
        total,
        "Listed budgets"
    );

    Ok(Paginated::new(
        budgets.into_iter().map(BudgetResponse::from).collect(),
        &pagination,
        total,
    ))
}

pub async fn list_by_client(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<Uuid>,
    Query(pagination): Query<PaginationParams>,
    Query(query): Query<ListFilterQuery>,
) -> ApiResult<Paginated<BudgetResponse>> {
    let filter = BudgetFilter {
        client_id: Some(client_id),
        actionable_only: query.actionable_only,
        ..Default::default()
    };
    list_with(auth, state, filter, pagination).await
}

pub async fn list_by_provider(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<Uuid>,
    Query(pagination): Query<PaginationParams>,
    Query(query): Query<ListFilterQuery>,
) -> ApiResult<Paginated<BudgetResponse>> {
    let filter = BudgetFilter {
        provider_id: Some(provider_id),
        actionable_only: query.actionable_only,
        ..Default::default()
    };
    list_with(auth, state, filter, pagination).await
}

pub async fn list_by_service(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<Uuid>,
    Query(pagination): Query<PaginationParams>,
    Query(query): Query<ListFilterQuery>,
) -> ApiResult<Paginated<BudgetResponse>> {
    let filter = BudgetFilter {
        service_id: Some(service_id),
        actionable_only: query.actionable_only,
        ..Default::default()
    };
    list_with(auth, state, filter, pagination).await
}

pub async fn list_by_state(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(status): Path<String>,
    Query(pagination): Query<PaginationParams>,
    Query(query): Query<ListFilterQuery>,
) -> ApiResult<Paginated<BudgetResponse>> {
    let status = BudgetStatus::parse(&status).ok_or_else(|| {
        ApiError::validation(format!(
            "Unknown budget state '{}' (PENDIENTE, APROBADO or RECHAZADO)",
            status
        ))
    })?;

    let filter = BudgetFilter {
        status: Some(status),
        actionable_only: query.actionable_only,
        ..Default::default()
    };
    list_with(auth, state, filter, pagination).await
}

// ============================================================================
// Provider availability
// ============================================================================

pub async fn service_availability(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let windows = state.budgets.availability(service_id).await?;
    Ok(Json(DataResponse::new(windows)))
}

#[derive(Debug, Deserialize)]
pub struct CandidateDatesQuery {
    pub day: String,
    /// Defaults to today (UTC)
    pub from: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct CandidateDatesResponse {
    pub day: DayOfWeek,
    pub horizon_days: u32,
    pub dates: Vec<NaiveDate>,
}

/// Bookable dates for one weekday within the scheduling horizon
pub async fn candidate_dates(
    _auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<Uuid>,
    Query(query): Query<CandidateDatesQuery>,
) -> ApiResult<impl IntoResponse> {
    let day = DayOfWeek::parse(&query.day)
        .ok_or_else(|| ApiError::validation(format!("Unknown weekday '{}'", query.day)))?;
    let from = query.from.unwrap_or_else(|| Utc::now().date_naive());

    let dates = state.budgets.candidate_dates(service_id, day, from).await?;

    Ok(Json(DataResponse::new(CandidateDatesResponse {
        day,
        horizon_days: state.budgets.policy().schedule_horizon_days,
        dates,
    })))
}
