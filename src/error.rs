//! Error types for the Bigfile server

use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::routes::JsonResult;
use crate::upload::UploadError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Multipart(e) => (e.status(), "MULTIPART_ERROR"),
            AppError::Upload(e) => (e.status_code(), e.code()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(code = code, "Request failed: {}", self);
        } else {
            tracing::warn!(code = code, "Request rejected: {}", self);
        }

        // Keep I/O details out of responses
        let message = match &self {
            AppError::Upload(UploadError::IoFailure(_)) => "Storage I/O failure".to_string(),
            other => other.to_string(),
        };

        let body = Json(JsonResult::failure(format!("{code}: {message}")));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::Fingerprint;

    #[test]
    fn test_status_mapping() {
        let fp = Fingerprint::parse("abc").unwrap();
        let cases = [
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (UploadError::EmptyUpload(fp.clone()).into(), StatusCode::NOT_FOUND),
            (UploadError::ConcurrentMergeConflict(fp.clone()).into(), StatusCode::CONFLICT),
            (UploadError::MergeInProgress(fp.clone()).into(), StatusCode::CONFLICT),
            (UploadError::AlreadyMerged(fp.clone()).into(), StatusCode::CONFLICT),
            (
                UploadError::MalformedIndex { fingerprint: fp, name: "x".into() }.into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                UploadError::IoFailure(std::io::Error::other("disk")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
