//! HTTP scoring routes over a shared, read-only model.

use std::sync::{Arc, RwLock};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::classifier::CustomerRiskScore;
use crate::pipeline::PipelineError;
use crate::record::{validate_payloads, RecordError, TransactionPayload};
use crate::registry::{LoadedModel, ScoringError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predictions: Vec<CustomerRiskScore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("no model is loaded")]
    ModelUnavailable,
    #[error("scoring failed: {0}")]
    Scoring(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Scoring(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RecordError> for ServiceError {
    fn from(err: RecordError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ScoringError> for ServiceError {
    fn from(err: ScoringError) -> Self {
        match err {
            ScoringError::Pipeline(inner @ PipelineError::MalformedTimestamp { .. }) => {
                Self::Validation(inner.to_string())
            }
            other => Self::Scoring(other.to_string()),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(
            component = "service",
            event = "service.request.rejected",
            status = status.as_u16(),
            detail = %self
        );
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub trait ModelSource: Send + Sync + 'static {
    fn current(&self) -> Option<Arc<LoadedModel>>;
}

/// Holds the model behind an `Arc`; handlers clone the `Arc` and never
/// mutate the model itself.
#[derive(Clone, Default)]
pub struct SharedModelSource {
    inner: Arc<RwLock<Option<Arc<LoadedModel>>>>,
}

impl SharedModelSource {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(model)))),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn replace_model(&self, model: LoadedModel) {
        let mut guard = self
            .inner
            .write()
            .expect("model source lock should not be poisoned");
        *guard = Some(Arc::new(model));
    }
}

impl ModelSource for SharedModelSource {
    fn current(&self) -> Option<Arc<LoadedModel>> {
        self.inner
            .read()
            .expect("model source lock should not be poisoned")
            .clone()
    }
}

pub fn scoring_router(source: Arc<dyn ModelSource>) -> Router {
    Router::new()
        .route("/predict", post(post_predict))
        .route("/health", get(get_health))
        .with_state(ScoringAppState { source })
}

#[derive(Clone)]
struct ScoringAppState {
    source: Arc<dyn ModelSource>,
}

async fn post_predict(
    State(state): State<ScoringAppState>,
    payload: Result<Json<Vec<TransactionPayload>>, JsonRejection>,
) -> Result<Json<PredictResponse>, ServiceError> {
    let Json(payloads) =
        payload.map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
    if payloads.is_empty() {
        return Err(ServiceError::Validation(
            "request must contain at least one transaction".to_string(),
        ));
    }
    let model = state.source.current().ok_or(ServiceError::ModelUnavailable)?;
    let records = validate_payloads(payloads)?;
    let predictions = model.score(&records)?;

    info!(
        component = "service",
        event = "service.predict.finish",
        transactions = records.len(),
        customers = predictions.len(),
        model_version = model.version
    );
    Ok(Json(PredictResponse { predictions }))
}

async fn get_health(State(state): State<ScoringAppState>) -> impl IntoResponse {
    let model = state.source.current();
    Json(HealthResponse {
        status: "healthy".to_string(),
        model_name: model.as_ref().map(|m| m.model_name.clone()),
        model_version: model.as_ref().map(|m| m.version),
    })
}
