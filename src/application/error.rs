use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    cache::{CacheError, StoreError, apply_no_store, default_cdn_header},
    config::LoadError,
    crypto::{DecryptError, EncryptError, KeyError},
    infra::{error::InfraError, upstream::UpstreamError},
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error("message could not be opened: {0}")]
    Undecryptable(#[from] DecryptError),
    #[error("upstream API is not configured")]
    UpstreamDisabled,
    #[error("validation failed: {0}")]
    Validation(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Cache(err) => cache_error_status(err),
            AppError::Undecryptable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) | AppError::Key(_) | AppError::UpstreamDisabled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Infra(InfraError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
            AppError::Infra(InfraError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Infra(_) | AppError::Encrypt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Cache(err) if err.is_timeout() => "upstream timed out",
            AppError::Cache(err) if upstream_error(err).is_some() => match self.status_code() {
                StatusCode::NOT_FOUND => "not found",
                StatusCode::BAD_GATEWAY => "upstream unavailable",
                _ => "upstream rejected the request",
            },
            AppError::Cache(_) => "request could not be served",
            AppError::Undecryptable(_) => "undecryptable",
            AppError::Validation(_) => "request could not be processed",
            AppError::Store(_) | AppError::Infra(InfraError::Store(_)) => {
                "cache temporarily unavailable"
            }
            AppError::Key(_) => "message encryption is not configured",
            AppError::UpstreamDisabled => "upstream API is not configured",
            AppError::Infra(InfraError::Upstream { .. }) => "upstream unavailable",
            AppError::Config(_) => "service misconfigured",
            AppError::Infra(_) | AppError::Encrypt(_) => "unexpected error occurred",
        }
    }
}

/// The upstream failure behind a cached query, if that is what failed.
pub fn upstream_error(err: &CacheError) -> Option<&UpstreamError> {
    err.producer_source()
        .and_then(|source| source.downcast_ref::<UpstreamError>())
}

fn cache_error_status(err: &CacheError) -> StatusCode {
    if err.is_timeout() {
        return StatusCode::GATEWAY_TIMEOUT;
    }
    match upstream_error(err) {
        Some(UpstreamError::Status { status, .. }) if status.is_client_error() => *status,
        Some(_) => StatusCode::BAD_GATEWAY,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(json!({ "error": message }))).into_response();
        apply_no_store(response.headers_mut(), &[default_cdn_header()]);
        report.attach(&mut response);
        response
    }
}
