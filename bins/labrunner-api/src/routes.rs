use crate::handlers;
use crate::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/modules", get(handlers::list_modules))
        .route("/api/modules/:module_id", get(handlers::get_module))
        .route("/api/run/:module_id", post(handlers::run_code))
        .route("/api/test/:module_id", post(handlers::run_tests))
}
