pub mod analyze;
pub mod health;
pub mod reports;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::queue::BatchDriver;
use crate::sandbox::ControlPlane;
use crate::storage::ReportStore;

// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub batch: BatchDriver,
    pub reports: ReportStore,
    pub control: Arc<dyn ControlPlane>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes();
    // An empty CorsLayer adds no headers
    let cors = if state.config.server.enable_cors {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health::health_check))
        .route("/analyze", post(analyze::analyze_files))
        .route("/api/reports", get(reports::list_reports))
        .route("/api/reports/file", get(reports::get_file_content_by_query))
        .route("/api/reports/:analysis_dir", get(reports::list_analysis_files))
        .route(
            "/api/reports/:analysis_dir/*filename",
            get(reports::get_file_content),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
