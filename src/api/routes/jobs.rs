//! Job API endpoints

use crate::api::server::AppState;
use crate::services::{JobSnapshot, JobSpec};
use crate::types::BidRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to queue a loan discovery job. An empty body uses the
/// configured listing defaults.
#[derive(Debug, Deserialize)]
pub struct FetchLoansRequest {
    pub limit: Option<u32>,
    pub max_pages: Option<u32>,
    pub sweden: Option<bool>,
    pub norway: Option<bool>,
    pub denmark: Option<bool>,
}

/// Response for a queued job
#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: Uuid,
}

/// Jobs listing response
#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobSnapshot>,
    pub total: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Queue a loan discovery job
pub async fn start_fetch_loans(
    State(state): State<AppState>,
    Json(req): Json<FetchLoansRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), (StatusCode, Json<ErrorResponse>)> {
    let listing = &state.config.listing;

    let limit = req.limit.unwrap_or(listing.page_limit);
    if !(1..=100).contains(&limit) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "limit must be between 1 and 100".to_string(),
            }),
        ));
    }

    let max_pages = req.max_pages.unwrap_or(listing.max_pages);
    if !(1..=20).contains(&max_pages) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "max_pages must be between 1 and 20".to_string(),
            }),
        ));
    }

    let mut filters = listing.filters;
    if let Some(sweden) = req.sweden {
        filters.sweden = sweden;
    }
    if let Some(norway) = req.norway {
        filters.norway = norway;
    }
    if let Some(denmark) = req.denmark {
        filters.denmark = denmark;
    }

    let job_id = state
        .orchestrator
        .start(JobSpec::FetchLoans {
            filters,
            limit,
            max_pages,
        })
        .await;

    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// Queue a bid placement job
pub async fn start_bid(
    State(state): State<AppState>,
    Json(req): Json<BidRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), (StatusCode, Json<ErrorResponse>)> {
    if req.amount <= 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "amount must be a positive whole number of SEK".to_string(),
            }),
        ));
    }

    let job_id = state.orchestrator.start(JobSpec::PlaceBid(req)).await;

    Ok((StatusCode::ACCEPTED, Json(StartJobResponse { job_id })))
}

/// List all known jobs, newest first
pub async fn list_jobs(
    State(state): State<AppState>,
) -> Result<Json<JobsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let jobs = state.orchestrator.list().await;
    let total = jobs.len();

    Ok(Json(JobsResponse { jobs, total }))
}

/// Get one job by id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = state.orchestrator.status(job_id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Job not found".to_string(),
            }),
        )
    })?;

    Ok(Json(snapshot))
}

/// Cancel a job. Terminal jobs are returned unchanged.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = state.orchestrator.cancel(job_id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Job not found".to_string(),
            }),
        )
    })?;

    Ok(Json(snapshot))
}
