//! Loan API endpoints

use crate::api::server::AppState;
use crate::types::Loan;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

/// Query parameters for listing loans
#[derive(Debug, Deserialize)]
pub struct ListLoansQuery {
    /// Filter by status: "open" or "all" (default)
    pub status: Option<String>,
}

/// Loans response
#[derive(Debug, Serialize)]
pub struct LoansResponse {
    pub loans: Vec<Loan>,
    pub total: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// List loans from the local store
pub async fn list_loans(
    State(state): State<AppState>,
    Query(query): Query<ListLoansQuery>,
) -> Result<Json<LoansResponse>, (StatusCode, Json<ErrorResponse>)> {
    let loans = match query.status.as_deref() {
        Some("open") => state.db.get_open_loans().await,
        _ => state.db.get_loans().await,
    }
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Database error: {}", e),
            }),
        )
    })?;

    let total = loans.len();

    Ok(Json(LoansResponse { loans, total }))
}
