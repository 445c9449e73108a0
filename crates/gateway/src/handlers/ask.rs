//! Question handler

use crate::AppState;
use axum::{extract::State, Json};
use linesight_common::{errors::AppError, metrics::RequestMetrics, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 2000))]
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub processing_time_ms: u64,
}

/// Answer one question. Pipeline failures still produce a 200 with the
/// user-facing message as the answer.
pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>> {
    let metrics = RequestMetrics::start("POST", "/v1/ask");
    let start = Instant::now();

    if let Err(e) = request.validate() {
        metrics.finish(400);
        return Err(AppError::Validation {
            message: e.to_string(),
        });
    }

    let answer = state.assistant.answer(&request.question).await;
    let processing_time_ms = start.elapsed().as_millis() as u64;

    tracing::info!(
        question_len = request.question.len(),
        latency_ms = processing_time_ms,
        "Question answered"
    );
    metrics.finish(200);

    Ok(Json(AskResponse {
        answer,
        processing_time_ms,
    }))
}
