//! Sealing and opening direct-message bodies over HTTP.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::{
    application::error::AppError,
    cache::{ResponseSynthesizer, StrategyName},
    crypto::{KeyError, MessageCipher},
};

#[derive(Clone)]
pub struct MessageState {
    pub cipher: Option<MessageCipher>,
    pub synthesizer: ResponseSynthesizer,
}

impl MessageState {
    fn cipher(&self) -> Result<&MessageCipher, AppError> {
        self.cipher.as_ref().ok_or(AppError::Key(KeyError::Missing))
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SealRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct SealResponse {
    encoded: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct OpenRequest {
    encoded: String,
}

#[derive(Debug, Serialize)]
struct OpenResponse {
    text: String,
}

pub(super) async fn seal(
    State(state): State<MessageState>,
    Json(request): Json<SealRequest>,
) -> Result<Response, AppError> {
    let encoded = state.cipher()?.encrypt(&request.text)?;
    Ok(state.synthesizer.create_response_with_status(
        StatusCode::OK,
        &SealResponse { encoded },
        StrategyName::UserPrivate,
    ))
}

pub(super) async fn open(
    State(state): State<MessageState>,
    Json(request): Json<OpenRequest>,
) -> Result<Response, AppError> {
    let text = state.cipher()?.decrypt(&request.encoded)?;
    Ok(state
        .synthesizer
        .create_response(&OpenResponse { text }, StrategyName::UserPrivate))
}
