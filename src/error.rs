use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::assistant::AssistantError;
use crate::model::InferenceError;
use crate::preprocess::PreprocessError;

/// Error returned from a route: a status, a machine-readable tag and a
/// human-readable message, rendered as `{"error": tag, "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub tag: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, tag: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            tag,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.tag, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<PreprocessError> for ApiError {
    fn from(err: PreprocessError) -> Self {
        let tag = match err {
            PreprocessError::Decode(_) => "decode_error",
            PreprocessError::ColorConversion(_) => "unsupported_color_mode",
        };
        Self::new(StatusCode::BAD_REQUEST, tag, err.to_string())
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        let tag = match err {
            InferenceError::ModelUnavailable => "model_unavailable",
            InferenceError::LabelMismatch { .. } => "configuration_error",
            _ => "inference_error",
        };
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, tag, err.to_string())
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        let tag = match err {
            AssistantError::Unavailable => "assistant_unavailable",
            AssistantError::Call(_) => "assistant_call_failed",
        };
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, tag, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misconfiguration_bad_input_and_external_failures_are_distinguishable() {
        let unavailable = ApiError::from(InferenceError::ModelUnavailable);
        let decode = ApiError::from(PreprocessError::ColorConversion("empty".into()));
        let call = ApiError::from(AssistantError::Call("timeout".into()));

        assert_eq!(unavailable.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(decode.status, StatusCode::BAD_REQUEST);
        assert_eq!(call.status, StatusCode::INTERNAL_SERVER_ERROR);

        let tags = [unavailable.tag, decode.tag, call.tag];
        assert_eq!(
            tags,
            ["model_unavailable", "unsupported_color_mode", "assistant_call_failed"]
        );
    }

    #[test]
    fn label_mismatch_is_reported_as_configuration_error() {
        let err = ApiError::from(InferenceError::LabelMismatch {
            outputs: 3,
            labels: 4,
        });
        assert_eq!(err.tag, "configuration_error");
        assert!(err.message.contains('3') && err.message.contains('4'));
    }
}
