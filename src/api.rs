//! HTTP endpoints for players and administrators.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::abuse::{rate_limit_middleware, AbuseConfig};
use crate::auth::{Admin, AuthError, Caller};
use crate::chat::{ChatError, ReplyEvent};
use crate::events;
use crate::geo::GeoError;
use crate::protocol::*;
use crate::state::{
    AdminError, AppState, HintTarget, MissionUpdate, ModerationError, NewProfile,
    NewRegenerativeAction, PlayerError, PositionFix, SubmissionError, ValidationError,
    ValidationOutcome,
};
use crate::types::*;
use crate::ws;

/// Error body returned by every endpoint: `{ "error": code, "message": text }`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// Adds `"validated": false` (photo validation endpoint)
    validation: bool,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            validation: false,
        }
    }

    fn for_validation(mut self) -> Self {
        self.validation = true;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.code, "message": self.message });
        if self.validation {
            body["validated"] = serde_json::Value::Bool(false);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingIdentity => {
                ApiError::new(StatusCode::UNAUTHORIZED, "unauthenticated", e.to_string())
            }
            AuthError::Forbidden(_) => ApiError::new(StatusCode::FORBIDDEN, "forbidden", e.to_string()),
        }
    }
}

impl From<PlayerError> for ApiError {
    fn from(e: PlayerError) -> Self {
        let (status, code) = match &e {
            PlayerError::UnknownPlayer(_) => (StatusCode::NOT_FOUND, "unknown_player"),
            PlayerError::EmailTaken(_) => (StatusCode::CONFLICT, "email_taken"),
            PlayerError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        };
        ApiError::new(status, code, e.to_string())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(e: SubmissionError) -> Self {
        let (status, code) = match &e {
            SubmissionError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            SubmissionError::UnknownMission(_) => (StatusCode::NOT_FOUND, "unknown_mission"),
            SubmissionError::UnknownPlayer(_) => (StatusCode::FORBIDDEN, "unknown_player"),
            SubmissionError::InvalidPosition(..) => (StatusCode::BAD_REQUEST, "invalid_position"),
            SubmissionError::LocationRequired => {
                (StatusCode::UNPROCESSABLE_ENTITY, "location_required")
            }
            SubmissionError::OutsideGeofence { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "outside_geofence")
            }
            SubmissionError::StorageUploadFailed(_) => {
                (StatusCode::BAD_GATEWAY, "storage_upload_failed")
            }
            SubmissionError::PersistenceFailed { storage_key, .. } => {
                tracing::error!("Orphaned proof blob {}/{}", PROOF_BUCKET, storage_key);
                (StatusCode::INTERNAL_SERVER_ERROR, "persistence_failed")
            }
        };
        ApiError::new(status, code, e.to_string())
    }
}

impl From<ModerationError> for ApiError {
    fn from(e: ModerationError) -> Self {
        let (status, code) = match &e {
            ModerationError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ModerationError::AlreadyDecided(_) => (StatusCode::CONFLICT, "already_decided"),
            ModerationError::UpdateFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "update_failed"),
        };
        ApiError::new(status, code, e.to_string())
    }
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        let (status, code) = match &e {
            AdminError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AdminError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            AdminError::Storage(_) => (StatusCode::BAD_GATEWAY, "storage_failed"),
            AdminError::UserNotFound(_) => (StatusCode::NOT_FOUND, "user_not_found"),
            AdminError::AlreadyAdmin => (StatusCode::CONFLICT, "already_admin"),
            AdminError::AdminLimitReached(_) => (StatusCode::CONFLICT, "admin_limit_reached"),
            AdminError::LastAdmin => (StatusCode::CONFLICT, "last_admin"),
        };
        ApiError::new(status, code, e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        let (status, code) = match &e {
            ValidationError::InsufficientCredits => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            ValidationError::UnknownMission(_) => (StatusCode::NOT_FOUND, "unknown_mission"),
            ValidationError::SubmissionNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ValidationError::ProviderUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
            }
            ValidationError::AlreadyReviewed(_) => (StatusCode::CONFLICT, "already_decided"),
        };
        ApiError::new(status, code, e.to_string()).for_validation()
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        let (status, code) = match &e {
            ChatError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limit"),
            ChatError::InsufficientCredits => (StatusCode::PAYMENT_REQUIRED, "insufficient_credits"),
            ChatError::CommunicationFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "chat_failed"),
        };
        ApiError::new(status, code, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Players read and write their own records; admins read anyone's
async fn ensure_self_or_admin(state: &AppState, caller: &str, user_id: &str) -> ApiResult<()> {
    if caller == user_id || state.is_admin(caller).await {
        Ok(())
    } else {
        Err(AuthError::Forbidden(caller.to_string()).into())
    }
}

// Player routes

/// POST /api/profiles
pub async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewProfile>,
) -> ApiResult<(StatusCode, Json<Profile>)> {
    let profile = state.create_profile(new).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// GET /api/missions
pub async fn list_missions(State(state): State<Arc<AppState>>) -> Json<Vec<MissionConfig>> {
    Json(state.list_missions().await)
}

/// POST /api/missions/{id}/proofs?lat=&lng=
///
/// Body is the raw image, typed by Content-Type. Auto-validation runs in the
/// background when enabled.
pub async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Path(mission_id): Path<MissionId>,
    Query(query): Query<ProofQuery>,
    headers: HeaderMap,
    image: Bytes,
) -> ApiResult<(StatusCode, Json<Submission>)> {
    let submission = state
        .submit_proof(crate::state::ProofUpload {
            mission_id,
            user_id,
            image,
            content_type: content_type(&headers),
            position: query.position(),
        })
        .await?;

    if state.config.auto_validate_on_upload && state.llm.is_some() {
        events::spawn_auto_validation(state.clone(), submission.id.clone());
    }
    Ok((StatusCode::CREATED, Json(submission)))
}

/// POST /api/positions
pub async fn report_position(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Json(request): Json<PositionRequest>,
) -> ApiResult<Json<PositionResponse>> {
    if let Some(code) = request.error_code {
        state
            .report_position_error(&user_id, GeoError::from_platform_code(code))
            .await?;
        return Ok(Json(PositionResponse {
            recorded: false,
            geofence: None,
        }));
    }

    let (Some(latitude), Some(longitude)) = (request.latitude, request.longitude) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "latitude and longitude are required",
        ));
    };
    let geofence = state
        .report_position(
            &user_id,
            PositionFix {
                latitude,
                longitude,
                accuracy: request.accuracy,
            },
            request.mission_context,
        )
        .await?;
    Ok(Json(PositionResponse {
        recorded: true,
        geofence,
    }))
}

/// GET /api/players/{id}
pub async fn player_overview(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<crate::state::PlayerOverview>> {
    ensure_self_or_admin(&state, &caller, &user_id).await?;
    Ok(Json(state.player_overview(&user_id).await?))
}

/// GET /api/players/{id}/messages
pub async fn player_messages(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(user_id): Path<UserId>,
) -> ApiResult<Json<Vec<ChatMessageRecord>>> {
    ensure_self_or_admin(&state, &caller, &user_id).await?;
    Ok(Json(state.chat_history(&user_id).await))
}

/// POST /api/players/{id}/actions
pub async fn record_action(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(user_id): Path<UserId>,
    Json(action): Json<NewRegenerativeAction>,
) -> ApiResult<(StatusCode, Json<RegenerativeAction>)> {
    ensure_self_or_admin(&state, &caller, &user_id).await?;
    let record = state.record_regenerative_action(&user_id, action).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /api/validate-photo
///
/// Scores a photo against the mission's reference images. With a
/// `submissionId`, the verdict is stored and a passing photo is approved.
pub async fn validate_photo(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidatePhotoRequest>,
) -> ApiResult<Json<ValidationOutcome>> {
    let Some(submission_id) = request.submission_id else {
        let outcome = state
            .auto_validate(&request.mission_id, &request.submission_photo_url)
            .await?;
        return Ok(Json(outcome));
    };

    let submission = state
        .get_submission(&submission_id)
        .await
        .ok_or_else(|| ValidationError::SubmissionNotFound(submission_id.clone()))?;
    if submission.mission_id != request.mission_id
        || submission.photo_url != request.submission_photo_url
    {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "submission does not match the photo and mission given",
        )
        .for_validation());
    }

    let run = state.auto_validate_submission(&submission_id).await?;
    Ok(Json(run.outcome))
}

fn chat_event(item: Result<ReplyEvent, ChatError>) -> Event {
    match item {
        Ok(ReplyEvent::Update { delta, .. }) => Event::default().data(
            serde_json::json!({ "choices": [{ "delta": { "content": delta } }] }).to_string(),
        ),
        Ok(ReplyEvent::Done) => Event::default().data("[DONE]"),
        Err(e) => {
            tracing::warn!("Guide chat stream failed: {}", e);
            let error = ApiError::from(e);
            Event::default().event("error").data(
                serde_json::json!({ "error": error.code, "message": error.message }).to_string(),
            )
        }
    }
}

/// POST /api/guardian-chat
///
/// Relays the guide's reply as server-sent events, one
/// `{"choices":[{"delta":{"content":..}}]}` frame per fragment, then `[DONE]`.
pub async fn guardian_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GuardianChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let relay = state.chat_relay().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "chat_unavailable",
            "La Voix de la Lumière est indisponible.",
        )
    })?;
    let replies = relay
        .stream_reply(request.messages, &request.user_progress)
        .await?;

    let events = replies.map(|item| Ok::<_, Infallible>(chat_event(item)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// Admin routes

/// GET /api/admin/submissions?status=
pub async fn list_submissions(
    State(state): State<Arc<AppState>>,
    Admin(_admin): Admin,
    Query(query): Query<StatusQuery>,
) -> Json<Vec<SubmissionWithProfile>> {
    Json(state.list_by_status(query.status).await)
}

/// POST /api/admin/submissions/{id}/decision
pub async fn decide_submission(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(submission_id): Path<SubmissionId>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<Submission>> {
    Ok(Json(
        state.decide(&admin, &submission_id, request.approve).await?,
    ))
}

/// POST /api/admin/submissions/{id}/override
pub async fn override_submission(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(submission_id): Path<SubmissionId>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<Submission>> {
    Ok(Json(
        state
            .override_status(&admin, &submission_id, request.status)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct AutoValidateResponse {
    #[serde(flatten)]
    pub outcome: ValidationOutcome,
    pub submission: Submission,
}

/// POST /api/admin/submissions/{id}/auto-validate
pub async fn auto_validate_submission(
    State(state): State<Arc<AppState>>,
    Admin(_admin): Admin,
    Path(submission_id): Path<SubmissionId>,
) -> ApiResult<Json<AutoValidateResponse>> {
    let run = state.auto_validate_submission(&submission_id).await?;
    Ok(Json(AutoValidateResponse {
        outcome: run.outcome,
        submission: run.submission,
    }))
}

/// PUT /api/admin/missions/{id}
pub async fn update_mission(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(mission_id): Path<MissionId>,
    Json(update): Json<MissionUpdate>,
) -> ApiResult<Json<MissionConfig>> {
    Ok(Json(
        state.update_mission(&admin, &mission_id, update).await?,
    ))
}

/// GET /api/admin/missions/{id}/references
pub async fn list_references(
    State(state): State<Arc<AppState>>,
    Admin(_admin): Admin,
    Path(mission_id): Path<MissionId>,
) -> Json<Vec<ReferenceImage>> {
    Json(state.list_reference_images(&mission_id).await)
}

/// POST /api/admin/missions/{id}/references?tags= (raw image body)
pub async fn add_reference(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(mission_id): Path<MissionId>,
    Query(query): Query<ReferenceQuery>,
    headers: HeaderMap,
    image: Bytes,
) -> ApiResult<(StatusCode, Json<ReferenceImage>)> {
    let reference = state
        .add_reference_image(
            &admin,
            &mission_id,
            image,
            &content_type(&headers),
            query.tags(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reference)))
}

/// DELETE /api/admin/references/{id}
pub async fn delete_reference(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(reference_id): Path<ReferenceImageId>,
) -> ApiResult<StatusCode> {
    state.delete_reference_image(&admin, &reference_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/admins
pub async fn list_admins(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
) -> Json<Vec<AdminEntry>> {
    Json(state.list_admins(&admin).await)
}

/// POST /api/admin/admins
pub async fn add_admin(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Json(request): Json<AddAdminRequest>,
) -> ApiResult<(StatusCode, Json<AdminEntry>)> {
    let entry = state.add_admin(&admin, &request.email).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// DELETE /api/admin/admins/{user_id}
pub async fn remove_admin(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(user_id): Path<UserId>,
) -> ApiResult<StatusCode> {
    state.remove_admin(&admin, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/teams
pub async fn list_teams(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
) -> Json<Vec<TeamSummary>> {
    Json(state.list_teams(&admin).await)
}

/// POST /api/admin/hints
pub async fn send_hint(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Json(request): Json<HintRequest>,
) -> ApiResult<Json<HintResponse>> {
    let target = match request.team {
        Some(team) if !team.trim().is_empty() => HintTarget::Team(team.trim().to_string()),
        _ => HintTarget::All,
    };
    let recipients = state.send_hint(&admin, target, &request.message).await?;
    Ok(Json(HintResponse { recipients }))
}

/// POST /api/admin/players/{id}/bonus
pub async fn award_bonus(
    State(state): State<Arc<AppState>>,
    Admin(admin): Admin,
    Path(user_id): Path<UserId>,
    Json(request): Json<BonusRequest>,
) -> ApiResult<Json<PlayerScore>> {
    Ok(Json(
        state.award_bonus(&admin, &user_id, request.points).await?,
    ))
}

/// All API routes plus the dashboard websocket
pub fn router(state: Arc<AppState>, abuse: Arc<AbuseConfig>) -> Router {
    // Uploads and model calls are rate limited per caller
    let limited = Router::new()
        .route("/api/missions/{id}/proofs", post(submit_proof))
        .route("/api/validate-photo", post(validate_photo))
        .route("/api/guardian-chat", post(guardian_chat))
        .layer(middleware::from_fn_with_state(abuse, rate_limit_middleware));

    let admin = Router::new()
        .route("/api/admin/submissions", get(list_submissions))
        .route("/api/admin/submissions/{id}/decision", post(decide_submission))
        .route("/api/admin/submissions/{id}/override", post(override_submission))
        .route(
            "/api/admin/submissions/{id}/auto-validate",
            post(auto_validate_submission),
        )
        .route("/api/admin/missions/{id}", put(update_mission))
        .route(
            "/api/admin/missions/{id}/references",
            get(list_references).post(add_reference),
        )
        .route("/api/admin/references/{id}", delete(delete_reference))
        .route("/api/admin/admins", get(list_admins).post(add_admin))
        .route("/api/admin/admins/{user_id}", delete(remove_admin))
        .route("/api/admin/teams", get(list_teams))
        .route("/api/admin/hints", post(send_hint))
        .route("/api/admin/players/{id}/bonus", post(award_bonus));

    Router::new()
        .route("/api/profiles", post(create_profile))
        .route("/api/missions", get(list_missions))
        .route("/api/positions", post(report_position))
        .route("/api/players/{id}", get(player_overview))
        .route("/api/players/{id}/messages", get(player_messages))
        .route("/api/players/{id}/actions", post(record_action))
        .merge(limited)
        .merge(admin)
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
