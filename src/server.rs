use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;

use crate::classifier::{ClassifyError, ModelState, PredictionResult, CLASS_NAMES};

const SERVICE_NAME: &str = "Waste Classification API";
const ALLOWED_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

pub struct AppState {
    pub model: ModelState,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No file provided")]
    MissingFile,
    #[error("No file selected")]
    EmptyFilename,
    #[error("Invalid file type. Allowed: png, jpg, jpeg, gif, webp")]
    InvalidExtension,
    #[error("{0}")]
    Upload(#[from] MultipartError),
    #[error("{0}")]
    Processing(#[from] ClassifyError),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Processing(_) => {
                log::error!("Prediction failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn app(state: SharedState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn info_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/": "API info",
            "/health": "Health check",
            "/predict": "POST - Upload image for classification",
        },
        "classes": CLASS_NAMES,
        "model_loaded": state.model.is_loaded(),
    }))
}

async fn health_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "model_loaded": state.model.is_loaded(),
        "classes": CLASS_NAMES,
    }))
}

async fn predict_handler(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResult>, ServiceError> {
    // Find the uploaded file among the multipart fields
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            upload = Some((filename, field.bytes().await?));
            break;
        }
    }

    let (filename, image_bytes) = upload.ok_or(ServiceError::MissingFile)?;
    if filename.is_empty() {
        return Err(ServiceError::EmptyFilename);
    }
    if !has_allowed_extension(&filename) {
        return Err(ServiceError::InvalidExtension);
    }

    let result = state.model.classify(&image_bytes)?;
    Ok(Json(result))
}

// Filename check only; mismatched content surfaces later as a decode failure.
fn has_allowed_extension(filename: &str) -> bool {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str())
}
