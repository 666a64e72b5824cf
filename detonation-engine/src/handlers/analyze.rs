use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream;
use serde_json::json;
use tracing::info;

use super::AppState;
use crate::error::ApiResult;
use crate::pipeline::Sample;

pub const FILES_FIELD: &str = "files";
pub const PASSWORD_FIELD: &str = "zip_password";

/// POST /analyze
///
/// Accepts a multipart batch of archives plus an optional shared passphrase
/// and streams every run's progress back as server-sent events.
pub async fn analyze_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut samples = Vec::new();
    let mut passphrase = None;

    // Multipart errors keep their own status, so an oversized body is a 413
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        if name == FILES_FIELD {
            let filename = field.file_name().map(|s| s.to_string());
            let data = field.bytes().await?;
            samples.push(Sample {
                filename,
                content: data.to_vec(),
            });
        } else if name == PASSWORD_FIELD {
            let value = field.text().await?;
            passphrase = Some(value).filter(|v| !v.is_empty());
        }
    }

    let has_named_file = samples
        .iter()
        .any(|s| s.filename.as_deref().map_or(false, |n| !n.is_empty()));
    if !has_named_file {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!([{ "error": "No selected files" }])),
        )
            .into_response());
    }

    info!(
        files = samples.len(),
        password = passphrase.is_some(),
        "Received analysis request"
    );

    let events = state.batch.submit(samples, passphrase);
    let stream = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        Some((Event::default().json_data(&event), events))
    });

    Ok(Sse::new(stream).into_response())
}
