use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use warp::http::StatusCode;
use warp::hyper::body::Buf;
use warp::multipart::{FormData, Part};
use warp::{reject, reply, Rejection, Reply};

use revlens_core::database::DatabasePool;
use revlens_core::error::AppError;
use revlens_core::models::{AnalysisSession, SessionMessage, SessionStatus};
use revlens_services::services::llm::ReviewClassifier;
use revlens_services::services::orchestrator::{
    AnalysisOrchestrator, Submission, UploadedFile,
};
use revlens_services::services::reconcile;
use revlens_services::services::registry::SessionRegistry;

/// Number of sessions returned by the listing endpoint
const RECENT_SESSIONS_LIMIT: i64 = 100;

/// Size cap for non-file multipart fields (matches the JSON body limit)
const FIELD_BYTES_LIMIT: u64 = 10 * 1024 * 1024;

/// Process start, for the liveness payload
pub static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Everything the request handlers need
#[derive(Clone)]
pub struct AppContext {
    pub pool: DatabasePool,
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
    pub reviewer: Option<Arc<dyn ReviewClassifier>>,
    pub max_file_size: u64,
}

// ── Response shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub status: String,
    pub files_count: i32,
    pub comment: Option<String>,
    pub metadata: Option<Value>,
    pub files_data: Option<Value>,
    pub report_text: Option<String>,
    pub report_structured: Option<Value>,
    pub stats: Option<Value>,
    pub llm_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<AnalysisSession> for SessionView {
    fn from(session: AnalysisSession) -> Self {
        SessionView {
            session_id: session.session_id,
            status: session.status,
            files_count: session.files_count,
            comment: session.comment,
            metadata: session.metadata,
            files_data: session.files_data,
            report_text: session.report_text,
            report_structured: session.report_structured,
            stats: session.stats,
            llm_status: session.llm_status,
            created_at: session.created_at,
            completed_at: session.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub role: String,
    pub content: Value,
    pub order: i32,
    pub created_at: DateTime<Utc>,
}

impl From<SessionMessage> for MessageView {
    fn from(message: SessionMessage) -> Self {
        MessageView {
            role: message.role,
            content: message.content,
            order: message.message_order,
            created_at: message.created_at,
        }
    }
}

// ── Liveness ──────────────────────────────────────────────────────────────────

/// `/health`: liveness only; touches neither the database nor upstreams.
pub async fn health() -> Result<impl Reply, std::convert::Infallible> {
    Ok(reply::json(&json!({
        "status": "healthy",
        "service": "revlens-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": STARTED_AT.elapsed().as_secs(),
    })))
}

pub async fn ping() -> Result<impl Reply, std::convert::Infallible> {
    Ok(reply::with_status("pong", StatusCode::OK))
}

// ── Submission ────────────────────────────────────────────────────────────────

struct ParsedSubmission {
    files: Vec<UploadedFile>,
    comment: Option<String>,
    metadata: Option<Value>,
    session_id: Option<String>,
}

async fn collect_part_bytes(part: Part, limit: u64, label: &str) -> Result<Vec<u8>, AppError> {
    let mut out: Vec<u8> = Vec::new();
    let mut stream = Box::pin(part.stream());

    while let Some(mut chunk) = stream
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            out.extend_from_slice(bytes);
            let advanced = bytes.len();
            chunk.advance(advanced);
        }
        if out.len() as u64 > limit {
            return Err(AppError::FileTooLarge(label.to_string()));
        }
    }

    Ok(out)
}

async fn collect_part_text(part: Part) -> Result<String, AppError> {
    let name = part.name().to_string();
    let bytes = collect_part_bytes(part, FIELD_BYTES_LIMIT, &name).await?;
    String::from_utf8(bytes)
        .map_err(|_| AppError::BadRequest(format!("Field `{}` is not valid UTF-8", name)))
}

async fn parse_submission(
    form: FormData,
    max_file_size: u64,
) -> Result<ParsedSubmission, AppError> {
    let mut parsed = ParsedSubmission {
        files: Vec::new(),
        comment: None,
        metadata: None,
        session_id: None,
    };

    let mut form = Box::pin(form);
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let field = part.name().to_string();
        match field.as_str() {
            "files" => {
                let name = part
                    .filename()
                    .unwrap_or("upload.bin")
                    .to_string();
                let mime = part
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = collect_part_bytes(part, max_file_size, &name).await?;
                parsed.files.push(UploadedFile { name, mime, bytes });
            }
            "comment" => {
                parsed.comment = Some(collect_part_text(part).await?);
            }
            "metadata" => {
                let text = collect_part_text(part).await?;
                parsed.metadata = serde_json::from_str(&text).ok();
            }
            "sessionId" => {
                let text = collect_part_text(part).await?;
                let trimmed = text.trim().to_string();
                if !trimmed.is_empty() {
                    parsed.session_id = Some(trimmed);
                }
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    Ok(parsed)
}

/// `POST /api/analysis`: accept a submission, claim the session, start the
/// background pipeline and answer 202 immediately.
pub async fn submit_analysis(form: FormData, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let parsed = parse_submission(form, ctx.max_file_size)
        .await
        .map_err(reject::custom)?;

    if parsed.files.is_empty() {
        return Err(reject::custom(AppError::FilesRequired));
    }
    if let Some(comment) = &parsed.comment {
        AnalysisSession::validate_comment(comment).map_err(reject::custom)?;
    }

    let session_id = parsed
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let Some(claim) = ctx.registry.claim(&session_id) else {
        return Err(reject::custom(AppError::AnalysisInProgress(session_id)));
    };

    tracing::info!(session = %session_id, files = parsed.files.len(), "Submission accepted");

    ctx.orchestrator.spawn(
        Submission {
            session_id: session_id.clone(),
            comment: parsed.comment,
            metadata: parsed.metadata,
            files: parsed.files,
        },
        claim,
    );

    Ok(reply::with_status(
        reply::json(&json!({
            "sessionId": session_id,
            "status": SessionStatus::Generating.to_string(),
        })),
        StatusCode::ACCEPTED,
    ))
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// `GET /api/reports`: the most recent sessions, newest first, each
/// reconciled against the provider when stale.
pub async fn list_reports(ctx: AppContext) -> Result<impl Reply, Rejection> {
    let sessions = AnalysisSession::list_recent(&ctx.pool, RECENT_SESSIONS_LIMIT)
        .await
        .map_err(reject::custom)?;

    let sessions = reconcile::refresh_all(&ctx.pool, ctx.reviewer.as_deref(), sessions).await;
    let views: Vec<SessionView> = sessions.into_iter().map(SessionView::from).collect();

    Ok(reply::json(&views))
}

/// `GET /api/reports/:sessionId`
pub async fn get_report(session_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let session = AnalysisSession::get(&ctx.pool, &session_id)
        .await
        .map_err(reject::custom)?
        .ok_or_else(|| reject::custom(AppError::ReportNotFound(session_id.clone())))?;

    let session = reconcile::refresh_session(&ctx.pool, ctx.reviewer.as_deref(), session).await;

    Ok(reply::json(&SessionView::from(session)))
}

/// `GET /api/reports/:sessionId/messages`
pub async fn get_messages(session_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    AnalysisSession::get(&ctx.pool, &session_id)
        .await
        .map_err(reject::custom)?
        .ok_or_else(|| reject::custom(AppError::ReportNotFound(session_id.clone())))?;

    let messages = SessionMessage::for_session(&ctx.pool, &session_id)
        .await
        .map_err(reject::custom)?;
    let views: Vec<MessageView> = messages.into_iter().map(MessageView::from).collect();

    Ok(reply::json(&views))
}

/// `DELETE /api/reports/:sessionId`: cascade to files, messages and the
/// in-process state.
pub async fn delete_report(session_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    let deleted = AnalysisSession::delete_cascade(&ctx.pool, &session_id)
        .await
        .map_err(reject::custom)?;

    if !deleted {
        return Err(reject::custom(AppError::ReportNotFound(session_id)));
    }

    ctx.registry.forget(&session_id);
    tracing::info!(session = %session_id, "Session deleted");

    Ok(reply::with_status(reply::reply(), StatusCode::NO_CONTENT))
}
