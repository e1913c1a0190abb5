use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use crate::AppState;
use crate::db::queries;
use crate::error::AppError;
use crate::services::query::TransactionQuery;

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.queries.get_transactions(query).await?;
    Ok(Json(page))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.queries.get_transaction(id).await?;
    Ok(Json(view))
}

/// Audit trail for one transaction, oldest first.
pub async fn list_transaction_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    // Distinguish an unknown transaction from one with no events yet.
    state.queries.get_transaction(id).await?;

    let events = queries::list_transaction_events(&state.db, id).await?;
    Ok(Json(events))
}
