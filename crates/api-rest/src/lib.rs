//! # API REST
//!
//! REST API implementation for the Visia workflow engine.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON serialization, CORS, error mapping)
//!
//! The router is exposed so the workspace's `visia-run` binary can embed it
//! alongside the background sweep task; `src/main.rs` runs it standalone.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use visia_api_shared::{actor_from_headers, HealthRes, ACTOR_NAME_HEADER, ACTOR_ROLE_HEADER};
use visia_core::{
    Actor, Case, ConsentOutcome, ConsentType, Phase, PhasePayload, ResolveAck, ResourceKey,
    ResourceType, SlaDeadline, Subject, WorkflowCoordinator, WorkflowError,
};
use visia_types::{CaseId, ChannelRef, SubjectId};

/// Application state for the REST API server
///
/// Contains shared state that needs to be accessible to all request
/// handlers: the coordinator owning every workflow component.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<WorkflowCoordinator>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        register_case,
        list_cases,
        get_case,
        advance_case,
        request_consent,
        get_consent,
        resolve_consent,
        define_resource,
        case_deadlines,
        list_overdue,
        run_sweep,
    ),
    components(schemas(
        HealthRes,
        RegisterCaseReq,
        CaseRes,
        PhaseRecordRes,
        ListCasesRes,
        AdvanceReq,
        ResourceKeyDto,
        ConsentReq,
        ConsentRequestRes,
        ResolveReq,
        ResolveRes,
        DefineResourceReq,
        DeadlineRes,
        DeadlinesRes,
        SweepRes,
        ErrorRes,
    ))
)]
pub struct ApiDoc;

/// Builds the full application router, Swagger UI included.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cases", post(register_case))
        .route("/cases", get(list_cases))
        .route("/cases/:id", get(get_case))
        .route("/cases/:id/advance", post(advance_case))
        .route("/cases/:id/consent", post(request_consent))
        .route("/cases/:id/consent/:consent_type", get(get_consent))
        .route("/cases/:id/deadlines", get(case_deadlines))
        .route("/consent/resolve", post(resolve_consent))
        .route("/resources", post(define_resource))
        .route("/deadlines/overdue", get(list_overdue))
        .route("/sweep", post(run_sweep))
        .merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    /// Stable machine-readable discriminant, e.g. `invalid_transition`.
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterCaseReq {
    /// Reuse an existing subject id (e.g. a re-screening in a later year);
    /// omitted for a brand new subject.
    #[serde(default)]
    pub subject_id: Option<String>,
    pub name: String,
    /// ISO date, `YYYY-MM-DD`.
    pub birth_date: String,
    pub school: String,
    /// Guardian contact handle consent requests are sent to.
    pub guardian_contact: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PhaseRecordRes {
    pub phase: String,
    pub entered_at: String,
    pub actor_name: String,
    pub actor_role: String,
    /// The payload captured at entry, in its tagged JSON form.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CaseRes {
    pub case_id: String,
    pub subject_id: String,
    pub status: String,
    pub phase: String,
    pub history: Vec<PhaseRecordRes>,
    pub reservations: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListCasesRes {
    pub cases: Vec<CaseRes>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResourceKeyDto {
    /// `appointment_slot` or `inventory_unit`.
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdvanceReq {
    /// Target phase, in its snake_case wire form.
    pub target: String,
    /// Phase payload in its tagged JSON form; omit for phases that carry
    /// none.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Option<serde_json::Value>,
    /// Resource to reserve-and-confirm around the transition.
    #[serde(default)]
    pub resource: Option<ResourceKeyDto>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConsentReq {
    /// `assessment` or `dispensing`.
    pub consent_type: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConsentRequestRes {
    pub request_id: String,
    pub consent_type: String,
    pub status: String,
    pub sent_at: String,
    pub expires_at: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveReq {
    /// The channel reference carried by the provider callback.
    pub channel_ref: String,
    /// `granted` or `denied`.
    pub outcome: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResolveRes {
    /// Whether this callback changed anything; duplicates report `false`.
    pub applied: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DefineResourceReq {
    pub kind: String,
    pub id: String,
    pub capacity: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeadlineRes {
    pub deadline_id: String,
    pub case_id: String,
    pub kind: String,
    pub due_at: String,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeadlinesRes {
    pub deadlines: Vec<DeadlineRes>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SweepRes {
    pub expired_consents: usize,
    pub lapsed_reservations: usize,
    pub breached_deadlines: Vec<DeadlineRes>,
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

type ApiError = (StatusCode, Json<ErrorRes>);

/// Maps an engine error onto the HTTP contract: validation errors are 400,
/// unknown records 404, gate/concurrency refusals 409, a lapsed hold 410,
/// and outbound channel trouble 502.
fn error_response(err: WorkflowError) -> ApiError {
    let status = match &err {
        WorkflowError::InvalidTransition { .. } | WorkflowError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        WorkflowError::Serialization(_) | WorkflowError::YamlDeserialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        WorkflowError::CaseNotFound(_)
        | WorkflowError::ReservationNotFound(_)
        | WorkflowError::ConsentRequestNotFound => StatusCode::NOT_FOUND,
        WorkflowError::PreconditionUnmet(_)
        | WorkflowError::CapacityExceeded { .. }
        | WorkflowError::ConcurrentModification
        | WorkflowError::CaseClosed(_)
        | WorkflowError::SubjectHasActiveCase(_) => StatusCode::CONFLICT,
        WorkflowError::ReservationExpired(_) => StatusCode::GONE,
        WorkflowError::ExternalChannelUnavailable(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorRes {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorRes {
            kind: "invalid_input".into(),
            message: message.into(),
        }),
    )
}

fn actor_from(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let name = headers
        .get(ACTOR_NAME_HEADER)
        .and_then(|v| v.to_str().ok());
    let role = headers
        .get(ACTOR_ROLE_HEADER)
        .and_then(|v| v.to_str().ok());
    actor_from_headers(name, role).map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorRes {
                kind: "missing_actor".into(),
                message: e.to_string(),
            }),
        )
    })
}

fn parse_case_id(raw: &str) -> Result<CaseId, ApiError> {
    raw.parse()
        .map_err(|_| bad_request(format!("invalid case id: {raw}")))
}

fn parse_resource_key(dto: &ResourceKeyDto) -> Result<ResourceKey, ApiError> {
    let kind = match dto.kind.as_str() {
        "appointment_slot" => ResourceType::AppointmentSlot,
        "inventory_unit" => ResourceType::InventoryUnit,
        other => return Err(bad_request(format!("unknown resource kind: {other}"))),
    };
    Ok(ResourceKey::new(kind, dto.id.as_str()))
}

fn parse_consent_type(raw: &str) -> Result<ConsentType, ApiError> {
    match raw {
        "assessment" => Ok(ConsentType::Assessment),
        "dispensing" => Ok(ConsentType::Dispensing),
        other => Err(bad_request(format!("unknown consent type: {other}"))),
    }
}

fn case_to_res(case: Case) -> CaseRes {
    CaseRes {
        case_id: case.id.to_string(),
        subject_id: case.subject_id.to_string(),
        status: format!("{:?}", case.status).to_lowercase(),
        phase: case.current_phase().to_string(),
        history: case
            .history
            .into_iter()
            .map(|record| PhaseRecordRes {
                phase: record.phase.to_string(),
                entered_at: record.entered_at.to_rfc3339(),
                actor_name: record.actor.name.to_string(),
                actor_role: record.actor.role.to_string(),
                payload: serde_json::to_value(&record.payload)
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect(),
        reservations: case
            .reservations
            .into_iter()
            .map(|id| id.to_string())
            .collect(),
    }
}

fn deadline_to_res(deadline: SlaDeadline) -> DeadlineRes {
    DeadlineRes {
        deadline_id: deadline.id.to_string(),
        case_id: deadline.case_id.to_string(),
        kind: deadline.kind.to_string(),
        due_at: deadline.due_at.to_rfc3339(),
        status: format!("{:?}", deadline.status).to_lowercase(),
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used for monitoring and load balancer health checks.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(visia_api_shared::HealthService::check_health())
}

#[utoipa::path(
    post,
    path = "/cases",
    request_body = RegisterCaseReq,
    responses(
        (status = 201, description = "Case registered", body = CaseRes),
        (status = 400, description = "Invalid subject details", body = ErrorRes),
        (status = 409, description = "Subject already has an active case", body = ErrorRes)
    )
)]
/// Register a screened child and open their pathway case
///
/// # Errors
/// Returns `409 Conflict` if the subject already has an active case.
#[axum::debug_handler]
async fn register_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterCaseReq>,
) -> Result<(StatusCode, Json<CaseRes>), ApiError> {
    let actor = actor_from(&headers)?;

    let subject_id = match &req.subject_id {
        Some(raw) => raw
            .parse::<SubjectId>()
            .map_err(|_| bad_request(format!("invalid subject id: {raw}")))?,
        None => SubjectId::new(),
    };
    let birth_date = req
        .birth_date
        .parse()
        .map_err(|_| bad_request(format!("invalid birth date: {}", req.birth_date)))?;
    let subject = Subject {
        id: subject_id,
        name: req
            .name
            .parse()
            .map_err(|e| bad_request(format!("invalid name: {e}")))?,
        birth_date,
        school: req
            .school
            .parse()
            .map_err(|e| bad_request(format!("invalid school: {e}")))?,
        guardian_contact: req
            .guardian_contact
            .parse()
            .map_err(|e| bad_request(format!("invalid guardian contact: {e}")))?,
    };

    let case = state
        .coordinator
        .register_case(subject, actor, Utc::now())
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(case_to_res(case))))
}

#[utoipa::path(
    get,
    path = "/cases",
    responses(
        (status = 200, description = "All cases", body = ListCasesRes)
    )
)]
/// List every case, active and closed
#[axum::debug_handler]
async fn list_cases(State(state): State<AppState>) -> Json<ListCasesRes> {
    let mut cases = state.coordinator.list_cases();
    cases.sort_by_key(|c| c.first_entered_at(Phase::Registered));
    Json(ListCasesRes {
        cases: cases.into_iter().map(case_to_res).collect(),
    })
}

#[utoipa::path(
    get,
    path = "/cases/{id}",
    responses(
        (status = 200, description = "Case with full phase history", body = CaseRes),
        (status = 404, description = "No such case", body = ErrorRes)
    )
)]
/// Fetch one case with its complete phase history
#[axum::debug_handler]
async fn get_case(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<CaseRes>, ApiError> {
    let case_id = parse_case_id(&id)?;
    let case = state.coordinator.get_case(case_id).map_err(error_response)?;
    Ok(Json(case_to_res(case)))
}

#[utoipa::path(
    post,
    path = "/cases/{id}/advance",
    request_body = AdvanceReq,
    responses(
        (status = 200, description = "Transition committed", body = CaseRes),
        (status = 400, description = "Illegal transition or malformed payload", body = ErrorRes),
        (status = 404, description = "No such case", body = ErrorRes),
        (status = 409, description = "A precondition is unmet or a concurrent write won", body = ErrorRes),
        (status = 410, description = "The backing reservation lapsed", body = ErrorRes)
    )
)]
/// Advance a case to the named target phase
///
/// Validates the transition against the pathway graph, reserving and
/// confirming the named resource around it when one is given. A
/// manufacturing order given without an explicit resource draws one
/// inventory unit from the bucket of the issued prescription.
#[axum::debug_handler]
async fn advance_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<AdvanceReq>,
) -> Result<Json<CaseRes>, ApiError> {
    let actor = actor_from(&headers)?;
    let case_id = parse_case_id(&id)?;
    let target: Phase = req
        .target
        .parse()
        .map_err(|_| bad_request(format!("unknown phase: {}", req.target)))?;
    let payload = match req.payload {
        None => PhasePayload::None,
        Some(value) => serde_json::from_value(value)
            .map_err(|e| bad_request(format!("malformed payload: {e}")))?,
    };
    let resource = req
        .resource
        .as_ref()
        .map(parse_resource_key)
        .transpose()?;
    let now = Utc::now();

    let order_reference = match &payload {
        PhasePayload::ManufacturingOrder(data)
            if target == Phase::ManufacturingOrdered && resource.is_none() =>
        {
            Some(data.order_reference.clone())
        }
        _ => None,
    };
    let result = match order_reference {
        Some(order_reference) => {
            state
                .coordinator
                .order_manufacturing(case_id, actor, order_reference, now)
        }
        None => state
            .coordinator
            .advance(case_id, target, actor, payload, resource.as_ref(), now),
    };
    result.map(|case| Json(case_to_res(case))).map_err(error_response)
}

#[utoipa::path(
    post,
    path = "/cases/{id}/consent",
    request_body = ConsentReq,
    responses(
        (status = 202, description = "Consent request dispatched (or already pending)", body = ConsentRequestRes),
        (status = 404, description = "No such case", body = ErrorRes),
        (status = 502, description = "Outbound channel unavailable", body = ErrorRes)
    )
)]
/// Send a consent request to the case's guardian
///
/// Idempotent while a request is pending: repeating the call returns the
/// outstanding request instead of messaging the guardian again.
#[axum::debug_handler]
async fn request_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<ConsentReq>,
) -> Result<(StatusCode, Json<ConsentRequestRes>), ApiError> {
    let actor = actor_from(&headers)?;
    let case_id = parse_case_id(&id)?;
    let consent_type = parse_consent_type(&req.consent_type)?;
    let now = Utc::now();

    state
        .coordinator
        .request_consent(case_id, consent_type, actor, now)
        .map_err(error_response)?;
    let request = state
        .coordinator
        .consent_request(case_id, consent_type, now)
        .ok_or(WorkflowError::ConsentRequestNotFound)
        .map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ConsentRequestRes {
            request_id: request.id.to_string(),
            consent_type: request.consent_type.to_string(),
            status: request.status.to_string(),
            sent_at: request.sent_at.to_rfc3339(),
            expires_at: request.expires_at.to_rfc3339(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/cases/{id}/consent/{consent_type}",
    responses(
        (status = 200, description = "Latest consent request state", body = ConsentRequestRes),
        (status = 404, description = "No request was ever sent", body = ErrorRes)
    )
)]
/// Read the latest consent request state for a case
#[axum::debug_handler]
async fn get_consent(
    State(state): State<AppState>,
    AxumPath((id, consent_type)): AxumPath<(String, String)>,
) -> Result<Json<ConsentRequestRes>, ApiError> {
    let case_id = parse_case_id(&id)?;
    let consent_type = parse_consent_type(&consent_type)?;
    let request = state
        .coordinator
        .consent_request(case_id, consent_type, Utc::now())
        .ok_or(WorkflowError::ConsentRequestNotFound)
        .map_err(error_response)?;
    Ok(Json(ConsentRequestRes {
        request_id: request.id.to_string(),
        consent_type: request.consent_type.to_string(),
        status: request.status.to_string(),
        sent_at: request.sent_at.to_rfc3339(),
        expires_at: request.expires_at.to_rfc3339(),
    }))
}

#[utoipa::path(
    post,
    path = "/consent/resolve",
    request_body = ResolveReq,
    responses(
        (status = 200, description = "Callback applied (or acknowledged as a duplicate)", body = ResolveRes),
        (status = 400, description = "Malformed callback", body = ErrorRes),
        (status = 404, description = "Channel reference matches no request", body = ErrorRes)
    )
)]
/// Webhook for inbound consent callbacks from the messaging provider
///
/// Tolerates the provider's at-least-once delivery: duplicates and
/// callbacks for superseded requests are acknowledged with `applied: false`.
#[axum::debug_handler]
async fn resolve_consent(
    State(state): State<AppState>,
    Json(req): Json<ResolveReq>,
) -> Result<Json<ResolveRes>, ApiError> {
    let channel_ref: ChannelRef = req
        .channel_ref
        .parse()
        .map_err(|_| bad_request(format!("invalid channel ref: {}", req.channel_ref)))?;
    let outcome = match req.outcome.as_str() {
        "granted" => ConsentOutcome::Granted,
        "denied" => ConsentOutcome::Denied,
        other => return Err(bad_request(format!("unknown consent outcome: {other}"))),
    };

    let ack = state
        .coordinator
        .resolve_consent(&channel_ref, outcome, Utc::now())
        .map_err(error_response)?;
    Ok(Json(ResolveRes {
        applied: matches!(ack, ResolveAck::Applied { .. }),
    }))
}

#[utoipa::path(
    post,
    path = "/resources",
    request_body = DefineResourceReq,
    responses(
        (status = 201, description = "Resource declared"),
        (status = 400, description = "Duplicate key or zero capacity", body = ErrorRes)
    )
)]
/// Declare an additional reservable resource (e.g. a newly published clinic
/// date or inventory bucket)
#[axum::debug_handler]
async fn define_resource(
    State(state): State<AppState>,
    Json(req): Json<DefineResourceReq>,
) -> Result<StatusCode, ApiError> {
    let key = parse_resource_key(&ResourceKeyDto {
        kind: req.kind,
        id: req.id,
    })?;
    state
        .coordinator
        .define_resource(key, req.capacity)
        .map_err(error_response)?;
    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    get,
    path = "/cases/{id}/deadlines",
    responses(
        (status = 200, description = "Deadlines derived for this case", body = DeadlinesRes)
    )
)]
/// List the SLA deadlines tracked for one case
#[axum::debug_handler]
async fn case_deadlines(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DeadlinesRes>, ApiError> {
    let case_id = parse_case_id(&id)?;
    Ok(Json(DeadlinesRes {
        deadlines: state
            .coordinator
            .deadlines_for_case(case_id)
            .into_iter()
            .map(deadline_to_res)
            .collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/deadlines/overdue",
    responses(
        (status = 200, description = "Breached and past-due deadlines", body = DeadlinesRes)
    )
)]
/// List deadlines needing attention right now
#[axum::debug_handler]
async fn list_overdue(State(state): State<AppState>) -> Json<DeadlinesRes> {
    Json(DeadlinesRes {
        deadlines: state
            .coordinator
            .list_overdue(Utc::now())
            .into_iter()
            .map(deadline_to_res)
            .collect(),
    })
}

#[utoipa::path(
    post,
    path = "/sweep",
    responses(
        (status = 200, description = "Maintenance pass report", body = SweepRes)
    )
)]
/// Run one maintenance pass immediately
///
/// The same pass runs on a timer in `visia-run`; this endpoint exists for
/// operational tooling. Every step is idempotent.
#[axum::debug_handler]
async fn run_sweep(State(state): State<AppState>) -> Json<SweepRes> {
    let report = state.coordinator.run_sweep(Utc::now());
    Json(SweepRes {
        expired_consents: report.expired_consents,
        lapsed_reservations: report.lapsed_reservations,
        breached_deadlines: report
            .breached_deadlines
            .into_iter()
            .map(deadline_to_res)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;
    use visia_core::{
        CoreConfig, EventSink, LoggingConsentChannel, ResourceSpec, TracingEventSink,
    };

    fn test_state() -> AppState {
        let config = CoreConfig::new(
            chrono::Duration::days(14),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
            vec![visia_core::config::delivery_sla_rule(14)],
            vec![ResourceSpec {
                key: ResourceKey::new(ResourceType::AppointmentSlot, "slot-1"),
                capacity: 1,
            }],
        )
        .expect("valid config");
        AppState {
            coordinator: Arc::new(WorkflowCoordinator::new(
                &config,
                Arc::new(LoggingConsentChannel),
                Arc::new(TracingEventSink) as Arc<dyn EventSink>,
            )),
        }
    }

    fn register_body() -> serde_json::Value {
        serde_json::json!({
            "name": "S. Adeyemi",
            "birth_date": "2016-01-30",
            "school": "Oakfield Primary",
            "guardian_contact": "+44700900042"
        })
    }

    async fn response_json(res: axum::response::Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let json = response_json(res).await;
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn register_requires_actor_headers() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cases")
                    .header("content-type", "application/json")
                    .body(Body::from(register_body().to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_then_read_back() {
        let state = test_state();
        let app = router(state);
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cases")
                    .header("content-type", "application/json")
                    .header(ACTOR_NAME_HEADER, "T. Byrne")
                    .header(ACTOR_ROLE_HEADER, "Coordinator")
                    .body(Body::from(register_body().to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::CREATED);
        let created = response_json(res).await;
        assert_eq!(created["phase"], "registered");
        let case_id = created["case_id"].as_str().expect("case id").to_string();

        let res = app
            .oneshot(
                Request::builder()
                    .uri(format!("/cases/{case_id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let fetched = response_json(res).await;
        assert_eq!(fetched["case_id"], case_id.as_str());
        assert_eq!(fetched["history"].as_array().expect("history").len(), 1);
    }

    #[tokio::test]
    async fn illegal_advance_maps_to_bad_request() {
        let state = test_state();
        let app = router(state);
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cases")
                    .header("content-type", "application/json")
                    .header(ACTOR_NAME_HEADER, "T. Byrne")
                    .header(ACTOR_ROLE_HEADER, "Coordinator")
                    .body(Body::from(register_body().to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let case_id = response_json(res).await["case_id"]
            .as_str()
            .expect("case id")
            .to_string();

        // Jumping straight to `decided` is not an edge in the graph.
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/cases/{case_id}/advance"))
                    .header("content-type", "application/json")
                    .header(ACTOR_NAME_HEADER, "T. Byrne")
                    .header(ACTOR_ROLE_HEADER, "Coordinator")
                    .body(Body::from(
                        serde_json::json!({
                            "target": "decided",
                            "payload": {"kind": "decision", "outcome": "glasses_needed"}
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let err = response_json(res).await;
        assert_eq!(err["kind"], "invalid_transition");
    }

    #[tokio::test]
    async fn unknown_case_is_not_found() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .uri(format!("/cases/{}", CaseId::new()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn misdirected_consent_callback_is_not_found() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/consent/resolve")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "channel_ref": ChannelRef::new().to_string(),
                            "outcome": "granted"
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
