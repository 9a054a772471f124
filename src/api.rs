use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::info;

use crate::auth::{self, TokenData};
use crate::config::Config;
use crate::connections::ConnectionRegistry;
use crate::db::DbHandle;
use crate::jobs::{Job, JobQueue};
use crate::models::{AnalysisResultsList, Repository, RepositoryDetail};
use crate::ratelimit::ConnectAdmissionLimiter;
use crate::urls::extract_repo_slug;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<ConnectAdmissionLimiter>,
    pub jobs: JobQueue,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RepositoryCreateRequest {
    pub url: String,
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = Json(serde_json::json!({"detail": message}));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

// ── Authentication extractor ──────────────────────────────────────────

/// The current user, resolved from the `Authorization: Bearer` header.
/// The token must verify and the account must still exist.
pub struct AuthUser(pub TokenData);

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;
        let data = auth::verify_token(&state.config.secret_key, token)
            .map_err(|_| ApiError::Unauthorized("Could not validate credentials".to_string()))?;

        let username = data.username.clone();
        let user = state
            .db
            .call(move |db| db.get_user_by_username(&username))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        match user {
            Some(user) => Ok(AuthUser(TokenData {
                id: user.id,
                username: user.username,
            })),
            None => Err(ApiError::Unauthorized(
                "Could not validate credentials".to_string(),
            )),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(health_check))
        .route("/api/v1/login/token", post(login_for_access_token))
        .route(
            "/api/v1/repositories",
            get(read_repositories).post(create_repository_analysis_request),
        )
        .route("/api/v1/repositories/{id}", get(read_repository))
        .route(
            "/api/v1/repositories/{id}/analysis",
            get(read_repository_analysis),
        )
        .route(
            "/api/v1/repositories/analysis/{analysis_id}/narrative",
            get(read_analysis_narrative),
        )
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Attach a repository's analysis results, as the read endpoints serve it.
async fn with_analysis_results(
    state: &SharedState,
    repository: Repository,
) -> Result<RepositoryDetail, ApiError> {
    let repository_id = repository.id;
    let analysis_results = state
        .db
        .call(move |db| db.analysis_results_for_repository(repository_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(RepositoryDetail {
        repository,
        analysis_results,
    })
}

/// Load a repository and enforce that it belongs to the current user.
async fn load_owned_repository(
    state: &SharedState,
    repository_id: i64,
    user: &TokenData,
    forbidden_message: &str,
) -> Result<Repository, ApiError> {
    let repository = state
        .db
        .call(move |db| db.get_repository(repository_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Repository not found".to_string()))?;
    if repository.owner_id != user.id {
        return Err(ApiError::Forbidden(forbidden_message.to_string()));
    }
    Ok(repository)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Welcome to the Storyteller API!"
    }))
}

async fn login_for_access_token(
    State(state): State<SharedState>,
    axum::Form(form): axum::Form<LoginForm>,
) -> Result<impl IntoResponse, ApiError> {
    let username = form.username.clone();
    let user = state
        .db
        .call(move |db| db.get_user_by_username(&username))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let user = user
        .filter(|u| auth::verify_password(&form.password, &u.hashed_password))
        .ok_or_else(|| ApiError::Unauthorized("Incorrect username or password".to_string()))?;

    let token = auth::create_access_token(
        &state.config.secret_key,
        user.id,
        &user.username,
        state.config.access_token_expire_minutes,
    )
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "access_token": token,
        "token_type": "bearer"
    })))
}

/// Accept a repository URL for analysis.
///
/// Returns the existing record (200) when the URL is already known,
/// otherwise creates it with status PENDING (201) and enqueues the
/// analyze job.
async fn create_repository_analysis_request(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Json(req): Json<RepositoryCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = req.url.trim().to_string();
    let name = extract_repo_slug(&url).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let lookup_url = url.clone();
    let existing = state
        .db
        .call(move |db| db.get_repository_by_url(&lookup_url))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(repository) = existing {
        let detail = with_analysis_results(&state, repository).await?;
        return Ok((StatusCode::OK, Json(detail)));
    }

    let owner_id = user.id;
    let repository = state
        .db
        .call(move |db| db.create_repository(&url, &name, owner_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!(
        "queued analysis for repository {} ({})",
        repository.id, repository.name
    );
    state.jobs.enqueue(Job::Analyze {
        repository_id: repository.id,
    });

    let detail = with_analysis_results(&state, repository).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn read_repositories(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Query(pagination): Query<Pagination>,
) -> Result<impl IntoResponse, ApiError> {
    let owner_id = user.id;
    let repositories = state
        .db
        .call(move |db| db.list_repositories_by_owner(owner_id, pagination.skip, pagination.limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut details = Vec::with_capacity(repositories.len());
    for repository in repositories {
        details.push(with_analysis_results(&state, repository).await?);
    }
    Ok(Json(details))
}

async fn read_repository(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let repository =
        load_owned_repository(&state, id, &user, "Not authorized to access this repository")
            .await?;
    let detail = with_analysis_results(&state, repository).await?;
    Ok(Json(detail))
}

async fn read_repository_analysis(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_repository(
        &state,
        id,
        &user,
        "Not authorized to access this repository's analysis",
    )
    .await?;
    let analysis_results = state
        .db
        .call(move |db| db.analysis_results_for_repository(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(AnalysisResultsList { analysis_results }))
}

async fn read_analysis_narrative(
    State(state): State<SharedState>,
    AuthUser(user): AuthUser,
    Path(analysis_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .db
        .call(move |db| db.get_analysis_result(analysis_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound("Analysis result not found".to_string()))?;

    // Ownership is checked through the parent repository; a missing parent
    // is treated as unauthorized, same as a mismatched owner.
    let repository_id = result.repository_id;
    let repository = state
        .db
        .call(move |db| db.get_repository(repository_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match repository {
        Some(repo) if repo.owner_id == user.id => {}
        _ => {
            return Err(ApiError::Forbidden(
                "Not authorized to access this analysis narrative".to_string(),
            ));
        }
    }

    match result.narrative {
        Some(narrative) => Ok(Json(narrative)),
        None => Err(ApiError::NotFound(
            "Narrative not available for this analysis result".to_string(),
        )),
    }
}
