use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, State,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::assistant::{Assistant, AssistantError, ChatContext};
use crate::error::ApiError;
use crate::labels::ClassLabels;
use crate::model::{InferenceEngine, InferenceError};
use crate::prediction::{format_prediction, OutputActivation, Prediction};
use crate::preprocess::Preprocessor;

/// Read-only state shared by every request.
pub struct AppState {
    pub service_name: String,
    pub engine: InferenceEngine,
    pub preprocessor: Preprocessor,
    pub labels: Arc<ClassLabels>,
    pub activation: OutputActivation,
    pub assistant: Assistant,
}

impl AppState {
    /// Preprocess, infer and format one uploaded image.
    pub fn classify(&self, image_data: &[u8]) -> Result<Prediction, ApiError> {
        let tensor = self.preprocessor.preprocess(image_data)?;
        let scores = self.engine.infer(&tensor)?;
        let scores = self.activation.apply(scores);
        Ok(format_prediction(&scores, &self.labels)?)
    }
}

pub fn router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/predict", post(predict_handler))
        .route("/chat", post(chat_handler))
        .route("/model-info", get(model_info_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "online",
        "message": format!("{} is running", state.service_name),
        "model_loaded": state.engine.is_loaded(),
        "chatbot_enabled": state.assistant.is_enabled(),
    }))
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    if !state.engine.is_loaded() {
        return Err(InferenceError::ModelUnavailable.into());
    }

    let mut multipart = multipart.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let image_data = read_image_field(&mut multipart).await?;

    let worker_state = state.clone();
    let result = tokio::task::spawn_blocking(move || worker_state.classify(&image_data))
        .await
        .map_err(|e| ApiError::from(InferenceError::Runtime(e.to_string())))?;

    match result {
        Ok(prediction) => {
            info!(
                result = %prediction.result,
                confidence = prediction.confidence,
                "prediction"
            );
            Ok(Json(prediction))
        }
        Err(err) => {
            warn!(error = err.tag, message = %err.message, "prediction failed");
            Err(err)
        }
    }
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_request(e.body_text()))?
    {
        if field.name() != Some("image") {
            continue;
        }
        if field.file_name() == Some("") {
            return Err(ApiError::invalid_request("Empty filename"));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::invalid_request(e.body_text()))?;
        if data.is_empty() {
            return Err(ApiError::invalid_request("Uploaded image is empty"));
        }
        return Ok(data);
    }
    Err(ApiError::invalid_request("No image provided in field 'image'"))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: Option<String>,
    context: Option<ChatContext>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    status: &'static str,
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    if !state.assistant.is_enabled() {
        return Err(AssistantError::Unavailable.into());
    }

    let Json(request) = payload.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    let message = request.message.unwrap_or_default();
    if message.trim().is_empty() {
        return Err(ApiError::invalid_request("No message provided"));
    }
    let context = request.context.unwrap_or_default();

    let response = state.assistant.reply(&message, &context).await?;
    Ok(Json(ChatResponse {
        response,
        status: "success",
    }))
}

#[derive(Debug, Serialize)]
struct ModelInfo<'a> {
    input_shape: &'a [i64],
    output_shape: &'a [i64],
    input_dtype: &'a str,
    output_dtype: &'a str,
    classes: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    class_descriptions: Option<Map<String, Value>>,
    input_size: [u32; 2],
}

async fn model_info_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let metadata = state.engine.metadata()?;

    let class_descriptions = state.labels.has_descriptions().then(|| {
        state
            .labels
            .iter()
            .filter_map(|l| {
                l.description
                    .as_ref()
                    .map(|d| (l.name.clone(), Value::String(d.clone())))
            })
            .collect::<Map<String, Value>>()
    });

    let (width, height) = state.preprocessor.input_size();
    let info = ModelInfo {
        input_shape: &metadata.input_shape,
        output_shape: &metadata.output_shape,
        input_dtype: &metadata.input_dtype,
        output_dtype: &metadata.output_dtype,
        classes: state.labels.names().collect(),
        class_descriptions,
        input_size: [width, height],
    };
    serde_json::to_value(info)
        .map(Json)
        .map_err(|e| ApiError::from(InferenceError::Runtime(e.to_string())))
}
