use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use gwf_core::branch::DestinationBranch;
use gwf_core::config::RepoSettings;
use gwf_core::jobs::{Job, JobKind, JobQueue};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex as TokioMutex;

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct AuthQuery {
    pub access_token: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RepoQuery {
    pub repo: Option<String>,
    pub session: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CreateBranchBody {
    /// Branch or commit the new destination starts from.
    pub from: String,
}

#[derive(Deserialize)]
pub(crate) struct WebhookBody {
    pub repo: Option<String>,
    pub event: String,
    pub pr_id: Option<u64>,
    pub sha: Option<String>,
    pub branch: Option<String>,
}

// ── Session handling ──────────────────────────────────────────────────────

pub type Sessions = Arc<TokioMutex<HashMap<String, String>>>;

fn new_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| format!("{:x}", rng.gen_range(0..16)))
        .collect()
}

async fn authorized(state: &AppState, session: &Option<String>) -> bool {
    // Local mode: no token configured, everything is allowed.
    if state.config.api_token.is_empty() {
        return true;
    }
    let Some(session) = session else {
        return false;
    };
    state.sessions.lock().await.contains_key(session)
}

/// GET /api/auth?access_token=…
pub(crate) async fn auth(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
) -> Result<Json<Value>, StatusCode> {
    let token = query.access_token.unwrap_or_default();
    if state.config.api_token.is_empty() || token != state.config.api_token {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let session = new_session_id();
    state
        .sessions
        .lock()
        .await
        .insert(session.clone(), "api".to_string());
    Ok(Json(json!({ "session": session })))
}

// ── Repository resolution ─────────────────────────────────────────────────

pub struct RepoHandle {
    pub settings: RepoSettings,
    pub queue: Arc<JobQueue>,
}

fn resolve<'a>(
    state: &'a AppState,
    repo: &Option<String>,
) -> Result<&'a RepoHandle, StatusCode> {
    match repo {
        Some(key) => state.repos.get(key).ok_or(StatusCode::NOT_FOUND),
        None if state.repos.len() == 1 => {
            state.repos.values().next().ok_or(StatusCode::NOT_FOUND)
        }
        None => Err(StatusCode::BAD_REQUEST),
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────

/// GET /api/jobs
pub(crate) async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<Vec<Job>>, StatusCode> {
    if !authorized(&state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let handle = resolve(&state, &query.repo)?;
    Ok(Json(handle.queue.history()))
}

/// GET /api/jobs/:id
pub(crate) async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<Job>, StatusCode> {
    if !authorized(&state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let handle = resolve(&state, &query.repo)?;
    handle.queue.get(id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/pull-requests/:id — enqueue a re-evaluation.
pub(crate) async fn enqueue_pull_request(
    State(state): State<Arc<AppState>>,
    Path(pr_id): Path<u64>,
    Query(query): Query<RepoQuery>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !authorized(&state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let handle = resolve(&state, &query.repo)?;
    match handle.queue.enqueue(JobKind::PullRequest { pr_id }, None) {
        Some(id) => Ok((StatusCode::ACCEPTED, Json(json!({ "job": id })))),
        None => Ok((StatusCode::ACCEPTED, Json(json!({ "deduplicated": true })))),
    }
}

// ── GitWaterFlow management ───────────────────────────────────────────────

/// POST /api/gwf/branches/*branch
pub(crate) async fn create_branch(
    State(state): State<Arc<AppState>>,
    Path(branch): Path<String>,
    Query(query): Query<RepoQuery>,
    Json(body): Json<CreateBranchBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !authorized(&state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if DestinationBranch::parse(&branch).is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = resolve(&state, &query.repo)?;
    let id = handle
        .queue
        .enqueue(
            JobKind::CreateBranch {
                branch,
                from: body.from,
            },
            None,
        )
        .ok_or_else(|| internal("enqueue failed"))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": id }))))
}

/// DELETE /api/gwf/branches/*branch
pub(crate) async fn delete_branch(
    State(state): State<Arc<AppState>>,
    Path(branch): Path<String>,
    Query(query): Query<RepoQuery>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !authorized(&state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if DestinationBranch::parse(&branch).is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let handle = resolve(&state, &query.repo)?;
    let id = handle
        .queue
        .enqueue(JobKind::DeleteBranch { branch }, None)
        .ok_or_else(|| internal("enqueue failed"))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": id }))))
}

/// POST /api/gwf/queues — rebuild the queue from scratch.
pub(crate) async fn rebuild_queues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepoQuery>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    queue_job(&state, &query, JobKind::QueueRebuild).await
}

/// DELETE /api/gwf/queues — wipe the queue.
pub(crate) async fn delete_queues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepoQuery>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    queue_job(&state, &query, JobKind::DeleteQueues).await
}

/// PATCH /api/gwf/queues — promote everything, ignoring builds.
pub(crate) async fn force_merge(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepoQuery>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    queue_job(&state, &query, JobKind::ForceMerge).await
}

async fn queue_job(
    state: &AppState,
    query: &RepoQuery,
    kind: JobKind,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if !authorized(state, &query.session).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let handle = resolve(state, &query.repo)?;
    let id = handle
        .queue
        .enqueue(kind, None)
        .ok_or_else(|| internal("enqueue failed"))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": id }))))
}

// ── Webhook intake ────────────────────────────────────────────────────────

/// POST /webhook — normalized host events decoded into jobs.
pub(crate) async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebhookBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let handle = resolve(&state, &body.repo)?;
    let kind = match body.event.as_str() {
        "pull_request" => JobKind::PullRequest {
            pr_id: body.pr_id.ok_or(StatusCode::BAD_REQUEST)?,
        },
        "commit" => JobKind::Commit {
            sha: body.sha.unwrap_or_default(),
            branch: body.branch.ok_or(StatusCode::BAD_REQUEST)?,
        },
        "build_status" => JobKind::BuildStatus {
            sha: body.sha.unwrap_or_default(),
            branch: body.branch.ok_or(StatusCode::BAD_REQUEST)?,
        },
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    let job = handle.queue.enqueue(kind, None);
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}
