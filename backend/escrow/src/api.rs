//! Axum REST API handlers.
//!
//! A thin adapter: every handler parses its input, calls [`EscrowService`]
//! and maps the result. Authentication is not handled here; the acting
//! identity is taken from the request body.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::errors::EscrowError;
use crate::idempotency::Executed;
use crate::models::{CommitRequest, NewCampaign, Page};
use crate::service::EscrowService;
use crate::state_machine::{self, ActionCode, CampaignState};

pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Clone)]
pub struct ApiState {
    pub service: EscrowService,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state-machine/transitions", get(transitions))
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/escrow", get(escrow_summary))
        .route("/campaigns/:id/commitments", get(list_commitments).post(commit))
        .route("/campaigns/:id/refund", post(refund_campaign))
        .route("/campaigns/:id/release", post(release_campaign))
        .route("/campaigns/:id/transition", post(transition))
        .route("/campaigns/:id/actions", post(perform_action))
        .route("/campaigns/:id/ledger", get(campaign_ledger))
        .route("/campaigns/:id/audit", get(campaign_audit))
        .route("/commitments/:id", get(get_commitment))
        .route("/commitments/:id/balance", get(commitment_balance))
        .route("/commitments/reference/:reference", get(commitment_by_reference))
        .route("/ledger", get(ledger))
        .route("/audit", get(audit_log))
        .route("/alerts", get(open_alerts))
        .route("/alerts/:id/resolve", post(resolve_alert))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub error: String,
}

#[derive(Serialize)]
pub struct KeyedResponse<T> {
    pub replayed: bool,
    pub result: T,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        ListResponse {
            count: items.len(),
            items,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateCampaignBody {
    pub actor: String,
    #[serde(flatten)]
    pub campaign: NewCampaign,
}

#[derive(Deserialize)]
pub struct ActorBody {
    pub actor: String,
}

#[derive(Deserialize)]
pub struct TransitionBody {
    pub to: CampaignState,
    pub actor: String,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct ActionBody {
    pub action: ActionCode,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CampaignFilter {
    pub state: Option<CampaignState>,
}

#[derive(Deserialize)]
pub struct AlertQuery {
    pub campaign_id: Option<String>,
    pub limit: Option<u32>,
    pub before: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Error / replay mapping
// ─────────────────────────────────────────────────────────

pub struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), "Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            code: self.0.code(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn keyed<T: Serialize>(executed: Executed<T>, fresh: StatusCode) -> Response {
    match executed {
        Executed::Fresh(result) => (fresh, Json(KeyedResponse { replayed: false, result })).into_response(),
        Executed::Replayed(result) => {
            (StatusCode::OK, Json(KeyedResponse { replayed: true, result })).into_response()
        }
        Executed::Mismatched(result) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "code": "DUPLICATE_REQUEST",
                "error": "idempotency key was already used with a different payload",
                "replayed": true,
                "result": result,
            })),
        )
            .into_response(),
        Executed::Processing => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "replayed": true, "status": "processing" })),
        )
            .into_response(),
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError(EscrowError::Validation(format!(
                "{IDEMPOTENCY_HEADER} header is required"
            )))
        })
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /state-machine/transitions`
pub async fn transitions() -> impl IntoResponse {
    Json(state_machine::transition_table())
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateCampaignBody>,
) -> ApiResult {
    let campaign = state.service.create_campaign(body.campaign, &body.actor).await?;
    Ok((StatusCode::CREATED, Json(campaign)).into_response())
}

/// `GET /campaigns?state=`
pub async fn list_campaigns(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<CampaignFilter>,
) -> ApiResult {
    let campaigns = state.service.campaigns(filter.state).await?;
    Ok(Json(ListResponse::from(campaigns)).into_response())
}

/// `GET /campaigns/:id`
pub async fn get_campaign(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.service.campaign(&id).await?).into_response())
}

/// `GET /campaigns/:id/escrow`
pub async fn escrow_summary(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.service.escrow_summary(&id).await?).into_response())
}

/// `GET /campaigns/:id/commitments`
pub async fn list_commitments(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let commitments = state.service.commitments(&id).await?;
    Ok(Json(ListResponse::from(commitments)).into_response())
}

/// `POST /campaigns/:id/commitments`
///
/// Any `amount` in the body is ignored.
pub async fn commit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommitRequest>,
) -> ApiResult {
    let key = idempotency_key(&headers)?;
    let executed = state.service.commit(&id, body, &key).await?;
    Ok(keyed(executed, StatusCode::CREATED))
}

/// `POST /campaigns/:id/refund`
pub async fn refund_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActorBody>,
) -> ApiResult {
    let key = idempotency_key(&headers)?;
    let executed = state.service.refund_campaign(&id, &body.actor, &key).await?;
    Ok(keyed(executed, StatusCode::OK))
}

/// `POST /campaigns/:id/release`
pub async fn release_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActorBody>,
) -> ApiResult {
    let key = idempotency_key(&headers)?;
    let executed = state.service.release_campaign(&id, &body.actor, &key).await?;
    Ok(keyed(executed, StatusCode::OK))
}

/// `POST /campaigns/:id/transition`
pub async fn transition(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> ApiResult {
    let campaign = state
        .service
        .transition(&id, body.to, &body.actor, &body.reason)
        .await?;
    Ok(Json(campaign).into_response())
}

/// `POST /campaigns/:id/actions`
pub async fn perform_action(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ActionBody>,
) -> ApiResult {
    let campaign = state
        .service
        .perform_action(&id, body.action, &body.actor, body.reason.as_deref())
        .await?;
    Ok(Json(campaign).into_response())
}

/// `GET /campaigns/:id/ledger`
pub async fn campaign_ledger(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> ApiResult {
    let entries = state.service.ledger_page(Some(&id), page).await?;
    Ok(Json(ListResponse::from(entries)).into_response())
}

/// `GET /campaigns/:id/audit`
pub async fn campaign_audit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(page): Query<Page>,
) -> ApiResult {
    let logs = state.service.audit_page(Some(&id), page).await?;
    Ok(Json(ListResponse::from(logs)).into_response())
}

/// `GET /commitments/:id`
pub async fn get_commitment(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult {
    Ok(Json(state.service.commitment(&id).await?).into_response())
}

/// `GET /commitments/:id/balance`
pub async fn commitment_balance(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let balance = state.service.commitment_balance(&id).await?;
    Ok(Json(serde_json::json!({ "commitment_id": id, "balance": balance })).into_response())
}

/// `GET /commitments/reference/:reference`
pub async fn commitment_by_reference(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
) -> ApiResult {
    Ok(Json(state.service.commitment_by_reference(&reference).await?).into_response())
}

/// `GET /ledger`
pub async fn ledger(State(state): State<Arc<ApiState>>, Query(page): Query<Page>) -> ApiResult {
    let entries = state.service.ledger_page(None, page).await?;
    Ok(Json(ListResponse::from(entries)).into_response())
}

/// `GET /audit`
pub async fn audit_log(State(state): State<Arc<ApiState>>, Query(page): Query<Page>) -> ApiResult {
    let logs = state.service.audit_page(None, page).await?;
    Ok(Json(ListResponse::from(logs)).into_response())
}

/// `GET /alerts?campaign_id=`
pub async fn open_alerts(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AlertQuery>,
) -> ApiResult {
    let page = Page {
        limit: query.limit,
        before: query.before,
    };
    let alerts = state
        .service
        .open_alerts(query.campaign_id.as_deref(), page)
        .await?;
    Ok(Json(ListResponse::from(alerts)).into_response())
}

/// `POST /alerts/:id/resolve`
pub async fn resolve_alert(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(body): Json<ActorBody>,
) -> ApiResult {
    Ok(Json(state.service.resolve_alert(id, &body.actor).await?).into_response())
}
