//! Outward entry point
//!
//! `Assistant::answer` always returns text. Every failure inside the
//! pipeline is logged and converted to its user message here.

use crate::engine::{EngineOutcome, QueryEngine};
use crate::errors::{AppError, Result};
use crate::format::QueryPayload;
use crate::llm::LanguageModel;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Returned for empty or whitespace-only questions
pub const EMPTY_QUESTION_MESSAGE: &str =
    "Please ask a question about production or quality data.";

pub struct Assistant {
    engine: QueryEngine,
    model: Arc<dyn LanguageModel>,
}

impl Assistant {
    pub fn new(engine: QueryEngine, model: Arc<dyn LanguageModel>) -> Self {
        Self { engine, model }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Answer one question. Never fails.
    #[instrument(skip(self, question), fields(question_id = %Uuid::new_v4()))]
    pub async fn answer(&self, question: &str) -> String {
        let question = question.trim();
        if question.is_empty() {
            return EMPTY_QUESTION_MESSAGE.to_string();
        }

        match self.try_answer(question).await {
            Ok(text) => text,
            Err(e) => {
                if e.is_client_error() {
                    warn!(error = %e, code = ?e.code(), "Question could not be answered");
                } else {
                    error!(error = %e, code = ?e.code(), "Question failed");
                }
                e.user_message()
            }
        }
    }

    async fn try_answer(&self, question: &str) -> Result<String> {
        match self.engine.run(question).await? {
            EngineOutcome::Message(message) => Ok(message),
            EngineOutcome::Records(payload) => {
                info!(records = payload.record_count, source = %payload.source, "Synthesizing answer");
                let answer = self.model.complete(&build_prompt(&payload)).await?;
                if answer.trim().is_empty() {
                    return Err(AppError::LanguageModel {
                        message: "model returned an empty answer".to_string(),
                    });
                }
                Ok(answer)
            }
        }
    }
}

fn build_prompt(payload: &QueryPayload) -> String {
    format!(
        "Answer the question below using the production data that follows. \
         Defect names, descriptions and acceptability are already resolved. \
         Report numbers exactly as given.\n\n{}\n\nAnswer:",
        payload.render()
    )
}
