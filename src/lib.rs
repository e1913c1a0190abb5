pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod services;
pub mod startup;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::services::query::TransactionQueryService;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub queries: TransactionQueryService,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/transactions", get(handlers::transactions::list_transactions))
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route(
            "/transactions/:id/events",
            get(handlers::transactions::list_transaction_events),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
