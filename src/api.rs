//! HTTP routes over the pipeline context.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anomaly::{AnomalyRecord, ScorerKind, ZScoreAnomaly};
use crate::chat::ChatReply;
use crate::context::{PipelineContext, TrainingSummary};
use crate::error::{ErrorKind, PipelineError};
use crate::predict::PredictorKind;
use crate::retrieval::ScoredRecord;
use crate::store::ModelEntry;

pub type SharedContext = Arc<Mutex<PipelineContext>>;

pub fn api_router(context: SharedContext) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/models", get(get_models))
        .route("/predict/{kind}", get(get_prediction))
        .route("/detect/anomaly/zscore", get(get_zscore_anomalies))
        .route("/detect/anomaly/{kind}", get(get_anomalies))
        .route("/train/anomaly/{kind}", post(post_train_anomaly))
        .route("/train/predictor/{kind}", post(post_train_predictor))
        .route("/context", get(get_context).post(post_context))
        .route("/chat", get(get_chat).post(post_chat))
        .with_state(ApiState { context })
}

#[derive(Clone)]
struct ApiState {
    context: SharedContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predictor: String,
    pub predicted_close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResponse {
    pub scorer: String,
    pub scored: usize,
    pub flagged: usize,
    pub anomalies: Vec<AnomalyRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZScoreResponse {
    pub column: String,
    pub flagged: usize,
    pub anomalies: Vec<ZScoreAnomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub query: String,
    pub results: Vec<ScoredRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    query: String,
    k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ZScoreQuery {
    #[serde(default = "default_zscore_column")]
    column: String,
}

fn default_zscore_column() -> String {
    "return_1".to_string()
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DataUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InvalidData | ErrorKind::InsufficientHistory => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ModelNotFound => StatusCode::NOT_FOUND,
        ErrorKind::ModelMismatch => StatusCode::CONFLICT,
        ErrorKind::DegenerateVector | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::TrainingFailed | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl ApiError {
    fn invalid_input(message: String) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            message,
        }
    }

    fn internal(message: String) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.kind);
        warn!(
            component = "api",
            event = "http.request.error",
            status = status.as_u16(),
            error_kind = self.kind.as_str(),
            error = %self.message
        );
        let body = ErrorBody {
            error: self.kind.as_str().to_string(),
            message: self.message,
        };
        (status, Json(body)).into_response()
    }
}

/// Runs `op` on the blocking pool with exclusive access to the context.
async fn with_context<T, F>(state: &ApiState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&PipelineContext) -> Result<T, PipelineError> + Send + 'static,
{
    let context = Arc::clone(&state.context);
    tokio::task::spawn_blocking(move || {
        // operations only borrow the context, so a poisoned lock holds no torn state
        let guard = context.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&guard).map_err(ApiError::from)
    })
    .await
    .map_err(|err| ApiError::internal(format!("blocking task failed: {err}")))?
}

fn parse_scorer(raw: &str) -> Result<ScorerKind, ApiError> {
    ScorerKind::parse(raw).ok_or_else(|| ApiError::invalid_input(format!("unknown anomaly scorer: {raw}")))
}

fn parse_predictor(raw: &str) -> Result<PredictorKind, ApiError> {
    PredictorKind::parse(raw).ok_or_else(|| ApiError::invalid_input(format!("unknown predictor: {raw}")))
}

async fn get_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "cmi",
        "version": env!("CARGO_PKG_VERSION"),
        "message": "crypto market intelligence API is running",
    }))
}

async fn get_models(State(state): State<ApiState>) -> Result<Json<Vec<ModelEntry>>, ApiError> {
    let models = with_context(&state, |ctx| ctx.list_models()).await?;
    Ok(Json(models))
}

async fn get_prediction(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let kind = parse_predictor(&kind)?;
    info!(component = "api", event = "http.predict.request", predictor = kind.as_str());
    let predicted_close = with_context(&state, move |ctx| ctx.predict_price(kind)).await?;
    Ok(Json(PredictionResponse {
        predictor: kind.as_str().to_string(),
        predicted_close,
    }))
}

async fn get_anomalies(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<Json<AnomalyResponse>, ApiError> {
    let kind = parse_scorer(&kind)?;
    info!(component = "api", event = "http.detect.request", scorer = kind.as_str());
    let records = with_context(&state, move |ctx| ctx.score_anomalies(kind)).await?;
    let scored = records.len();
    let anomalies: Vec<AnomalyRecord> = records
        .into_iter()
        .filter(|r| r.verdict.is_anomalous())
        .collect();
    Ok(Json(AnomalyResponse {
        scorer: kind.as_str().to_string(),
        scored,
        flagged: anomalies.len(),
        anomalies,
    }))
}

async fn get_zscore_anomalies(
    State(state): State<ApiState>,
    query: Result<Query<ZScoreQuery>, QueryRejection>,
) -> Result<Json<ZScoreResponse>, ApiError> {
    let ZScoreQuery { column } = query_params(query)?;
    info!(component = "api", event = "http.detect.request", scorer = "zscore", column = %column);
    let lookup = column.clone();
    let anomalies = with_context(&state, move |ctx| ctx.zscore_anomalies(&lookup)).await?;
    Ok(Json(ZScoreResponse {
        column,
        flagged: anomalies.len(),
        anomalies,
    }))
}

async fn post_train_anomaly(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<Json<TrainingSummary>, ApiError> {
    let kind = parse_scorer(&kind)?;
    info!(component = "api", event = "http.train.request", model = kind.model_name());
    let summary = with_context(&state, move |ctx| ctx.train_anomaly_model(kind)).await?;
    Ok(Json(summary))
}

async fn post_train_predictor(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<Json<TrainingSummary>, ApiError> {
    let kind = parse_predictor(&kind)?;
    info!(component = "api", event = "http.train.request", model = kind.model_name());
    let summary = with_context(&state, move |ctx| ctx.train_predictor(kind)).await?;
    Ok(Json(summary))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::invalid_input(rejection.body_text()))
}

async fn get_context(
    State(state): State<ApiState>,
    query: Result<Query<ContextQuery>, QueryRejection>,
) -> Result<Json<ContextResponse>, ApiError> {
    let ContextQuery { query, k } = query_params(query)?;
    let text = query.clone();
    let results = with_context(&state, move |ctx| ctx.retrieve_context(&text, k)).await?;
    Ok(Json(ContextResponse { query, results }))
}

async fn post_context(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let id = with_context(&state, move |ctx| {
        ctx.ingest_context(&request.text, request.metadata)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(IngestResponse { id })))
}

async fn get_chat(
    State(state): State<ApiState>,
    request: Result<Query<ChatRequest>, QueryRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let request = query_params(request)?;
    chat(&state, request.message).await
}

async fn post_chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    chat(&state, request.message).await
}

async fn chat(state: &ApiState, message: String) -> Result<Json<ChatReply>, ApiError> {
    info!(component = "api", event = "http.chat.request", message_len = message.len());
    let reply = with_context(state, move |ctx| ctx.chat(&message)).await?;
    Ok(Json(reply))
}
