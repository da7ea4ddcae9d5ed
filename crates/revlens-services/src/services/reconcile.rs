//! Best-effort status reconciliation against the LLM provider.
//!
//! A session can be left `generating` forever if the process died between
//! issuing the review call and the terminal upsert. When such a session
//! carries a provider response id, readers ask the provider for the
//! response's state and write terminal outcomes back. Idempotent and safe to
//! call repeatedly; non-`generating` sessions are returned untouched.

use chrono::Utc;

use revlens_core::database::DatabasePool;
use revlens_core::error::AppResult;
use revlens_core::models::{
    AnalysisSession, LlmRunStatus, SessionPatch, SessionStatus,
};

use crate::services::llm::{ProviderStatus, ReviewClassifier};

/// Refresh one session from the provider when it is stale. Fetch failures
/// are logged and leave the session as it was.
pub async fn refresh_session(
    pool: &DatabasePool,
    reviewer: Option<&dyn ReviewClassifier>,
    session: AnalysisSession,
) -> AnalysisSession {
    if session.session_status() != SessionStatus::Generating {
        return session;
    }
    let (Some(reviewer), Some(response_id)) = (reviewer, session.llm_response_id.clone()) else {
        return session;
    };

    let status = match reviewer.fetch_status(&response_id).await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(session = %session.session_id, error = %e,
                "Provider status fetch failed; leaving session as-is");
            return session;
        }
    };

    let patch = match status {
        Some(ProviderStatus::Completed) => {
            let mut patch = SessionPatch::new();
            patch.status = Some(SessionStatus::Completed.to_string());
            patch.completed_at = Some(Utc::now());
            patch.llm_status = Some(LlmRunStatus::Completed.to_string());
            patch
        }
        Some(ProviderStatus::Failed) => {
            let mut patch = SessionPatch::new();
            patch.status = Some(SessionStatus::Failed.to_string());
            patch.completed_at = Some(Utc::now());
            patch.llm_status = Some(LlmRunStatus::Failed.to_string());
            patch.report_text = Some("LLM review did not finish".to_string());
            patch
        }
        Some(ProviderStatus::InProgress) | None => return session,
    };

    match AnalysisSession::upsert_report(pool, &session.session_id, patch).await {
        Ok(updated) => {
            tracing::info!(session = %updated.session_id, status = %updated.status,
                "Reconciled session from provider state");
            updated
        }
        Err(e) => {
            tracing::warn!(session = %session.session_id, error = %e,
                "Reconciliation write failed; returning stale row");
            session
        }
    }
}

/// Refresh a whole listing; readers pay the provider round-trip only for
/// stale sessions.
pub async fn refresh_all(
    pool: &DatabasePool,
    reviewer: Option<&dyn ReviewClassifier>,
    sessions: Vec<AnalysisSession>,
) -> Vec<AnalysisSession> {
    let mut refreshed = Vec::with_capacity(sessions.len());
    for session in sessions {
        refreshed.push(refresh_session(pool, reviewer, session).await);
    }
    refreshed
}
