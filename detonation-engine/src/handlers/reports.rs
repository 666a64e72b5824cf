use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;

use super::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub analysis: Option<String>,
    pub file: Option<String>,
}

/// GET /api/reports
pub async fn list_reports(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.reports.list_runs().await?))
}

/// GET /api/reports/:analysis_dir
pub async fn list_analysis_files(
    State(state): State<AppState>,
    Path(analysis_dir): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.reports.list_report_files(&analysis_dir).await?))
}

/// GET /api/reports/:analysis_dir/*filename
pub async fn get_file_content(
    State(state): State<AppState>,
    Path((analysis_dir, filename)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.reports.read_report(&analysis_dir, &filename).await?))
}

/// GET /api/reports/file?analysis=<run>&file=<relative path>
pub async fn get_file_content_by_query(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<Value>> {
    let (analysis, file) = match (query.analysis, query.file) {
        (Some(analysis), Some(file)) if !analysis.is_empty() && !file.is_empty() => {
            (analysis, file)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Missing 'analysis' or 'file' query parameter".to_string(),
            ))
        }
    };

    Ok(Json(state.reports.read_report(&analysis, &file).await?))
}
