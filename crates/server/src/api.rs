//! Conversation controller routes.
//!
//! Chat and session endpoints:
//! - `POST /session`                              start a session for a user
//! - `POST /chat/message`                         process one user turn
//! - `GET  /session/{session_id}`                 current session state
//!
//! Flow and catalogue lookups:
//! - `GET  /flows`                                registered flows
//! - `GET  /flows/{flow_id}/schema`               step and field layout of a flow
//! - `GET  /products`, `GET /products/{id}`       catalogue passthrough
//! - `GET  /payments/{transaction_ref}/status`    payment status passthrough
//!
//! Human handoff:
//! - `POST /escalations`                          escalate a session
//! - `GET  /escalations/{session_id}`             escalation status
//! - `POST /escalations/{session_id}/agent`       an agent takes the session
//! - `POST /escalations/{session_id}/end`         return control to the bot

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use insureflow_core::domain::escalation::EscalationStatus;
use insureflow_core::domain::payment::PaymentStatus;
use insureflow_core::flows::{FieldSpec, Reply, StepAction, Turn, TurnKind};
use insureflow_core::{
    ApplicationError, ConversationState, EscalationReason, EscalationRecord, EscalationService, FlowEngine,
    FlowStatus, Product, Session, SessionId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
const MAX_CORRELATION_LEN: usize = 128;

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<FlowEngine>,
    escalation: Arc<EscalationService>,
}

impl ApiState {
    pub fn new(engine: Arc<FlowEngine>, escalation: Arc<EscalationService>) -> Self {
        Self { engine, escalation }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/{session_id}", get(get_session))
        .route("/chat/message", post(chat_message))
        .route("/flows", get(list_flows))
        .route("/flows/{flow_id}/schema", get(flow_schema))
        .route("/products", get(list_products))
        .route("/products/{product_id}", get(get_product))
        .route("/payments/{transaction_ref}/status", get(payment_status))
        .route("/escalations", post(create_escalation))
        .route("/escalations/{session_id}", get(escalation_status))
        .route("/escalations/{session_id}/agent", post(agent_join))
        .route("/escalations/{session_id}/end", post(end_escalation))
        .with_state(state)
}

/// Caller-supplied `X-Correlation-Id`, or a fresh one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CorrelationId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(correlation_id_from(&parts.headers)))
    }
}

pub fn correlation_id_from(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_CORRELATION_LEN)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub session_id: Option<String>,
    pub message: Option<String>,
    pub form_data: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: SessionId,
    pub state: ConversationState,
    pub kind: TurnKind,
    pub response: Reply,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub user_id: String,
    pub current_flow: Option<String>,
    pub current_step: usize,
    pub step_name: Option<String>,
    pub steps_total: Option<usize>,
    pub flow_status: FlowStatus,
    pub escalated: bool,
    pub agent_id: Option<String>,
    pub escalation_reason: Option<String>,
    pub collected_keys: Vec<String>,
    pub state_version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub display_name: String,
    pub steps_total: usize,
}

#[derive(Debug, Serialize)]
pub struct FlowSchema {
    pub flow_id: String,
    pub display_name: String,
    pub product_category: Option<String>,
    pub steps: Vec<StepSchema>,
}

#[derive(Debug, Serialize)]
pub struct StepSchema {
    pub step_name: String,
    pub prompt: String,
    pub required_fields: Vec<String>,
    pub fields: Vec<FieldSpec>,
    pub action: StepAction,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusResponse {
    pub transaction_ref: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
pub struct EscalationRequest {
    pub session_id: String,
    pub reason: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AgentJoinRequest {
    pub agent_id: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_session(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let request = body(payload, &correlation_id)?;
    let user_id = required(&request.user_id, "user_id", &correlation_id)?;

    let session = state
        .engine
        .start_session(user_id, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id: session.session_id, user_id: session.user_id }),
    ))
}

async fn chat_message(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request = body(payload, &correlation_id)?;
    let user_id = required(&request.user_id, "user_id", &correlation_id)?;
    let fail = |error| ApiError::from_application(error, &correlation_id);

    let session_id = match request.session_id.as_deref().map(str::trim) {
        Some(session_id) if !session_id.is_empty() => {
            let session_id = SessionId::from(session_id);
            let session = state.engine.session(&session_id).await.map_err(fail)?;
            // Another user's session is reported the same way as a missing one.
            if session.user_id != user_id {
                warn!(
                    event_name = "api.chat.session_owner_mismatch",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    "chat turn rejected for a session owned by another user"
                );
                return Err(fail(ApplicationError::SessionNotFound(session_id)));
            }
            session_id
        }
        _ => state.engine.start_session(user_id, &correlation_id).await.map_err(fail)?.session_id,
    };

    let turn = Turn { message: request.message, form_data: request.form_data };
    let outcome = state.engine.handle_turn(&session_id, turn, &correlation_id).await.map_err(fail)?;

    info!(
        event_name = "api.chat.turn",
        correlation_id = %correlation_id,
        session_id = %session_id,
        kind = ?outcome.kind,
        "chat turn processed"
    );

    Ok(Json(ChatResponse {
        session_id: outcome.session.session_id.clone(),
        state: outcome.session.conversation_state(),
        kind: outcome.kind,
        response: outcome.reply,
    }))
}

async fn get_session(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .engine
        .session(&SessionId::from(session_id))
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(session_view(&state.engine, session)))
}

async fn list_flows(State(state): State<ApiState>) -> Json<Vec<FlowSummary>> {
    let flows = state
        .engine
        .registry()
        .flows()
        .map(|flow| FlowSummary {
            flow_id: flow.flow_id.clone(),
            display_name: flow.display_name.clone(),
            steps_total: flow.steps_total(),
        })
        .collect();
    Json(flows)
}

async fn flow_schema(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(flow_id): Path<String>,
) -> Result<Json<FlowSchema>, ApiError> {
    let flow = state.engine.registry().get(&flow_id).ok_or_else(|| {
        ApiError::from_application(
            insureflow_core::ApplicationError::FlowNotFound(flow_id.clone()),
            &correlation_id,
        )
    })?;

    Ok(Json(FlowSchema {
        flow_id: flow.flow_id.clone(),
        display_name: flow.display_name.clone(),
        product_category: flow.product_category.clone(),
        steps: flow
            .steps
            .iter()
            .map(|step| StepSchema {
                step_name: step.step_name.clone(),
                prompt: step.prompt.clone(),
                required_fields: step.required_fields().into_iter().map(str::to_owned).collect(),
                fields: step.fields.clone(),
                action: step.action.clone(),
            })
            .collect(),
    }))
}

async fn list_products(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
) -> Result<Json<Vec<Product>>, ApiError> {
    let products = state
        .engine
        .gateway()
        .list_products()
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    Ok(Json(products))
}

async fn get_product(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(product_id): Path<String>,
) -> Result<Json<Product>, ApiError> {
    let product = state
        .engine
        .gateway()
        .get_product(&product_id)
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    Ok(Json(product))
}

async fn payment_status(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(transaction_ref): Path<String>,
) -> Result<Json<PaymentStatusResponse>, ApiError> {
    let status = state
        .engine
        .gateway()
        .check_status(&transaction_ref)
        .await
        .map_err(|error| ApiError::from_application(error.into(), &correlation_id))?;
    Ok(Json(PaymentStatusResponse { transaction_ref, status }))
}

async fn create_escalation(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    payload: Result<Json<EscalationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EscalationRecord>), ApiError> {
    let request = body(payload, &correlation_id)?;
    let session_id = required(&request.session_id, "session_id", &correlation_id)?;
    let reason = required(&request.reason, "reason", &correlation_id)?;

    let record = state
        .escalation
        .escalate_to_human(
            &SessionId::from(session_id),
            EscalationReason::parse(reason),
            request.metadata,
            &correlation_id,
        )
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn escalation_status(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(session_id): Path<String>,
) -> Result<Json<EscalationStatus>, ApiError> {
    let status = state
        .escalation
        .status(&SessionId::from(session_id))
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(status))
}

async fn agent_join(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(session_id): Path<String>,
    payload: Result<Json<AgentJoinRequest>, JsonRejection>,
) -> Result<Json<SessionView>, ApiError> {
    let request = body(payload, &correlation_id)?;
    let agent_id = required(&request.agent_id, "agent_id", &correlation_id)?;

    let session = state
        .escalation
        .agent_join(&SessionId::from(session_id), agent_id, &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(session_view(&state.engine, session)))
}

async fn end_escalation(
    State(state): State<ApiState>,
    CorrelationId(correlation_id): CorrelationId,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .escalation
        .end_escalation(&SessionId::from(session_id), &correlation_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(session_view(&state.engine, session)))
}

fn session_view(engine: &FlowEngine, session: Session) -> SessionView {
    let flow = session.current_flow.as_deref().and_then(|flow_id| engine.registry().get(flow_id));
    let step_name = flow
        .and_then(|flow| flow.step(session.current_step))
        .map(|step| step.step_name.clone());

    SessionView {
        step_name,
        steps_total: flow.map(|flow| flow.steps_total()),
        collected_keys: session.collected_data.keys().cloned().collect(),
        session_id: session.session_id,
        user_id: session.user_id,
        current_flow: session.current_flow,
        current_step: session.current_step,
        flow_status: session.flow_status,
        escalated: session.escalated,
        agent_id: session.agent_id,
        escalation_reason: session.escalation_reason,
        state_version: session.state_version,
        updated_at: session.updated_at,
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>, correlation_id: &str) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text(), correlation_id))
}

fn required<'a>(value: &'a str, field: &str, correlation_id: &str) -> Result<&'a str, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!("`{field}` must not be empty"), correlation_id));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::bootstrap::tests::{memory_app, memory_config};
    use crate::bootstrap::bootstrap_with_config;

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-correlation-id", "test-correlation")
            .body(body.map_or_else(Body::empty, |value| Body::from(value.to_string())))
            .expect("request should build");

        let response = app.clone().oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let payload = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("body should be json")
        };
        (status, payload)
    }

    async fn chat(app: &Router, session_id: &str, turn: Value) -> (StatusCode, Value) {
        let mut body = json!({ "user_id": "u1", "session_id": session_id });
        if let (Some(target), Some(source)) = (body.as_object_mut(), turn.as_object()) {
            target.extend(source.clone());
        }
        send(app, "POST", "/chat/message", Some(body)).await
    }

    async fn new_session(app: &Router) -> String {
        let (status, body) = send(app, "POST", "/session", Some(json!({ "user_id": "u1" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user_id"], "u1");
        body["session_id"].as_str().expect("session id").to_owned()
    }

    #[tokio::test]
    async fn travel_purchase_over_http() {
        let app = memory_app().await.router();
        let session_id = new_session(&app).await;

        let (status, body) =
            chat(&app, &session_id, json!({ "message": "I want travel insurance" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "flow_started");
        assert!(body["response"]["products"].as_array().is_some_and(|products| !products.is_empty()));

        let (_, session) = send(&app, "GET", &format!("/session/{session_id}"), None).await;
        assert_eq!(session["current_flow"], "travel_insurance");
        assert_eq!(session["current_step"], 0);
        assert_eq!(session["step_name"], "product_selection");

        let (_, body) =
            chat(&app, &session_id, json!({ "form_data": { "product_id": "worldwide_essential" } })).await;
        assert_eq!(body["kind"], "step_advanced");
        assert_eq!(body["response"]["next_step"]["step_name"], "about_you");

        let (status, body) = chat(
            &app,
            &session_id,
            json!({ "form_data": { "first_name": "Jane", "surname": "Doe", "phone_number": "0772123456" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "step_rejected");
        let errors = body["response"]["errors"].as_array().expect("field errors");
        assert!(errors.iter().any(|error| error["field"] == "email"));

        let (_, session) = send(&app, "GET", &format!("/session/{session_id}"), None).await;
        assert_eq!(session["current_step"], 1);

        for form in [
            json!({ "first_name": "Jane", "surname": "Doe", "phone_number": "0772123456", "email": "jane@example.com" }),
            json!({
                "departure_country": "Uganda",
                "destination_country": "Kenya",
                "departure_date": "2030-01-10",
                "return_date": "2030-01-20",
                "num_travellers": 1
            }),
            json!({ "consent": true }),
        ] {
            let (_, body) = chat(&app, &session_id, json!({ "form_data": form })).await;
            assert_eq!(body["kind"], "step_advanced", "unexpected turn: {body}");
        }

        let (_, body) = chat(
            &app,
            &session_id,
            json!({ "form_data": { "payment_method": "mobile_money", "payer_phone": "0772123456" } }),
        )
        .await;
        assert_eq!(body["kind"], "flow_completed");
        assert_eq!(body["state"]["state"], "completed");
        let transaction_ref =
            body["response"]["summary"]["transaction_ref"].as_str().expect("transaction ref").to_owned();
        assert!(!transaction_ref.is_empty());

        let (status, first) =
            send(&app, "GET", &format!("/payments/{transaction_ref}/status"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = send(&app, "GET", &format!("/payments/{transaction_ref}/status"), None).await;
        assert_eq!(first["status"], second["status"]);
    }

    #[tokio::test]
    async fn chat_without_session_creates_one() {
        let app = memory_app().await.router();

        let (status, body) =
            send(&app, "POST", "/chat/message", Some(json!({ "user_id": "u9", "message": "hello" }))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "answered");
        let session_id = body["session_id"].as_str().expect("session id");
        let (status, session) = send(&app, "GET", &format!("/session/{session_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["user_id"], "u9");
    }

    #[tokio::test]
    async fn form_without_active_flow_is_unprocessable() {
        let app = memory_app().await.router();
        let session_id = new_session(&app).await;

        let (status, body) = chat(&app, &session_id, json!({ "form_data": { "email": "a@b.co" } })).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "validation_failed");
        assert_eq!(body["correlation_id"], "test-correlation");
        assert_eq!(body["field_errors"][0]["field"], "form_data");
    }

    #[tokio::test]
    async fn empty_turn_and_bad_json_are_bad_requests() {
        let app = memory_app().await.router();
        let session_id = new_session(&app).await;

        let (status, body) = chat(&app, &session_id, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, _) = send(&app, "POST", "/session", Some(json!({ "user": "u1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/session", Some(json!({ "user_id": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_on_another_users_session_is_not_found() {
        let app = memory_app().await.router();
        let session_id = new_session(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/chat/message",
            Some(json!({ "user_id": "u2", "session_id": session_id, "message": "I want travel insurance" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (_, session) = send(&app, "GET", &format!("/session/{session_id}"), None).await;
        assert_eq!(session["user_id"], "u1");
        assert_eq!(session["current_flow"], Value::Null);
        assert_eq!(session["state_version"], 0);
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let app = memory_app().await.router();

        let (status, body) = send(&app, "GET", "/session/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = send(&app, "GET", "/flows/life_insurance/schema", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/products/does-not-exist", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn flows_and_schema_describe_the_registry() {
        let app = memory_app().await.router();

        let (status, flows) = send(&app, "GET", "/flows", None).await;
        assert_eq!(status, StatusCode::OK);
        let travel = flows
            .as_array()
            .and_then(|flows| flows.iter().find(|flow| flow["flow_id"] == "travel_insurance"))
            .expect("travel flow listed");
        assert_eq!(travel["steps_total"], 5);

        let (status, schema) = send(&app, "GET", "/flows/travel_insurance/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(schema["steps"][1]["step_name"], "about_you");
        let required = schema["steps"][1]["required_fields"].as_array().expect("required fields");
        assert!(required.iter().any(|field| field == "email"));
        assert!(!required.iter().any(|field| field == "middle_name"));
        assert_eq!(schema["steps"][4]["action"]["kind"], "initiate_payment");
    }

    #[tokio::test]
    async fn escalation_lifecycle_over_http() {
        let app = memory_app().await.router();
        let session_id = new_session(&app).await;
        chat(&app, &session_id, json!({ "message": "travel insurance please" })).await;

        let (status, record) = send(
            &app,
            "POST",
            "/escalations",
            Some(json!({ "session_id": session_id, "reason": "user_requested", "metadata": { "channel": "web" } })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["reason"], "user_requested");

        let (_, body) =
            chat(&app, &session_id, json!({ "form_data": { "product_id": "worldwide_essential" } })).await;
        assert_eq!(body["kind"], "escalation_active");

        let (status, joined) = send(
            &app,
            "POST",
            &format!("/escalations/{session_id}/agent"),
            Some(json!({ "agent_id": "agent-7" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(joined["agent_id"], "agent-7");

        let (_, status_body) = send(&app, "GET", &format!("/escalations/{session_id}"), None).await;
        assert_eq!(status_body["escalated"], true);

        let (status, ended) =
            send(&app, "POST", &format!("/escalations/{session_id}/end"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["escalated"], false);
        assert_eq!(ended["current_step"], 0);

        let (status, body) = send(&app, "POST", &format!("/escalations/{session_id}/end"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn api_keys_guard_everything_but_health() {
        let mut config = memory_config();
        config.api.api_keys = vec!["secret-key".to_owned().into()];
        let app = bootstrap_with_config(config).await.expect("bootstrap").router();

        let (status, body) = send(&app, "GET", "/flows", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .uri("/flows")
            .header("x-api-key", "secret-key")
            .body(Body::empty())
            .expect("request should build");
        let response = app.clone().oneshot(request).await.expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
