use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::database::DatabasePool;
use crate::error::{AppError, AppResult};
use crate::schema::analysis_sessions;

/// Maximum length of the free-text comment attached to a submission (10 KiB)
pub const MAX_COMMENT_BYTES: usize = 10 * 1024;

/// A single analysis submission and its durable report state
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = analysis_sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AnalysisSession {
    pub session_id: String,
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: String,
    pub files_count: i32,
    pub files_data: Option<serde_json::Value>,
    pub report_text: Option<String>,
    pub report_structured: Option<serde_json::Value>,
    pub stats: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub llm_status: Option<String>,
    pub llm_response_id: Option<String>,
}

/// Initial row for a freshly accepted submission
#[derive(Debug, Clone, Insertable, Validate, Deserialize)]
#[diesel(table_name = analysis_sessions)]
pub struct NewAnalysisSession {
    #[validate(length(min = 1, max = 255))]
    pub session_id: String,
    #[validate(length(max = 10240))]
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: String,
    pub files_count: i32,
    pub files_data: Option<serde_json::Value>,
    pub report_text: Option<String>,
    pub report_structured: Option<serde_json::Value>,
    pub stats: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub llm_status: Option<String>,
    pub llm_response_id: Option<String>,
}

/// Partial update applied through the report upsert.
///
/// `None` fields are left untouched on conflict, which gives the
/// COALESCE-on-update semantics the pipeline relies on: repeated upserts with
/// progressively richer payloads never erase previously written fields.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = analysis_sessions)]
pub struct SessionPatch {
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub status: Option<String>,
    pub files_count: Option<i32>,
    pub files_data: Option<serde_json::Value>,
    pub report_text: Option<String>,
    pub report_structured: Option<serde_json::Value>,
    pub stats: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
    pub llm_status: Option<String>,
    pub llm_response_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionPatch {
    /// An empty patch that only bumps `updated_at`
    pub fn new() -> Self {
        SessionPatch {
            comment: None,
            metadata: None,
            status: None,
            files_count: None,
            files_data: None,
            report_text: None,
            report_structured: None,
            stats: None,
            completed_at: None,
            llm_status: None,
            llm_response_id: None,
            updated_at: Utc::now(),
        }
    }
}

impl Default for SessionPatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Generating,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Generating => write!(f, "generating"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

impl From<&str> for SessionStatus {
    fn from(s: &str) -> Self {
        match s {
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            _ => SessionStatus::Generating,
        }
    }
}

/// Outcome of the LLM review step, orthogonal to the session status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LlmRunStatus {
    Skipped,
    Completed,
    Partial,
    Failed,
}

impl std::fmt::Display for LlmRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmRunStatus::Skipped => write!(f, "skipped"),
            LlmRunStatus::Completed => write!(f, "completed"),
            LlmRunStatus::Partial => write!(f, "partial"),
            LlmRunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl AnalysisSession {
    pub fn session_status(&self) -> SessionStatus {
        SessionStatus::from(self.status.as_str())
    }

    /// Insert or update the session row with COALESCE-on-update semantics.
    ///
    /// A terminal status never regresses: once a row reads `completed` or
    /// `failed`, status/completed_at in the incoming patch are dropped. The
    /// pipeline's finalize write and reader-driven reconciliation can hit
    /// the same row concurrently, so the guard read locks the row
    /// (`FOR UPDATE`) and the pair runs in one transaction.
    pub async fn upsert_report(
        pool: &DatabasePool,
        session_id: &str,
        patch: SessionPatch,
    ) -> AppResult<AnalysisSession> {
        use crate::schema::analysis_sessions::dsl;
        use diesel_async::scoped_futures::ScopedFutureExt;
        use diesel_async::AsyncConnection;

        let session_id = session_id.to_string();
        let mut conn = pool.get().await?;

        let session = conn
            .transaction::<AnalysisSession, AppError, _>(|conn| {
                async move {
                    let mut patch = patch;

                    let existing: Option<AnalysisSession> = dsl::analysis_sessions
                        .filter(dsl::session_id.eq(session_id.as_str()))
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;

                    if let Some(existing) = &existing {
                        if existing.session_status().is_terminal() {
                            patch.status = None;
                            patch.completed_at = None;
                        }
                    }

                    let insert_row = NewAnalysisSession {
                        session_id: session_id.clone(),
                        comment: patch.comment.clone(),
                        metadata: patch.metadata.clone(),
                        status: patch
                            .status
                            .clone()
                            .unwrap_or_else(|| SessionStatus::Generating.to_string()),
                        files_count: patch.files_count.unwrap_or(0),
                        files_data: patch.files_data.clone(),
                        report_text: patch.report_text.clone(),
                        report_structured: patch.report_structured.clone(),
                        stats: patch.stats.clone(),
                        completed_at: patch.completed_at,
                        llm_status: patch.llm_status.clone(),
                        llm_response_id: patch.llm_response_id.clone(),
                    };

                    let session = diesel::insert_into(dsl::analysis_sessions)
                        .values(&insert_row)
                        .on_conflict(dsl::session_id)
                        .do_update()
                        .set(&patch)
                        .get_result::<AnalysisSession>(conn)
                        .await?;

                    Ok(session)
                }
                .scope_boxed()
            })
            .await?;

        Ok(session)
    }

    /// Fetch one session by id
    pub async fn get(pool: &DatabasePool, session_id: &str) -> AppResult<Option<AnalysisSession>> {
        use crate::schema::analysis_sessions::dsl;

        let mut conn = pool.get().await?;

        let session = dsl::analysis_sessions
            .filter(dsl::session_id.eq(session_id))
            .first::<AnalysisSession>(&mut conn)
            .await
            .optional()?;

        Ok(session)
    }

    /// List the most recent sessions, newest first
    pub async fn list_recent(pool: &DatabasePool, limit: i64) -> AppResult<Vec<AnalysisSession>> {
        use crate::schema::analysis_sessions::dsl;

        let mut conn = pool.get().await?;

        let sessions = dsl::analysis_sessions
            .order(dsl::created_at.desc())
            .limit(limit)
            .load::<AnalysisSession>(&mut conn)
            .await?;

        Ok(sessions)
    }

    /// Delete the session row; files and messages follow via FK cascade.
    /// Returns false when no such session exists.
    pub async fn delete_cascade(pool: &DatabasePool, session_id: &str) -> AppResult<bool> {
        use crate::schema::analysis_sessions::dsl;

        let mut conn = pool.get().await?;

        let deleted =
            diesel::delete(dsl::analysis_sessions.filter(dsl::session_id.eq(session_id)))
                .execute(&mut conn)
                .await?;

        Ok(deleted > 0)
    }

    /// Validate a client-supplied comment against the size bound
    pub fn validate_comment(comment: &str) -> AppResult<()> {
        if comment.len() > MAX_COMMENT_BYTES {
            return Err(AppError::ValidationError(format!(
                "Comment exceeds {} bytes",
                MAX_COMMENT_BYTES
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContainer;

    #[test]
    fn test_status_round_trip() {
        assert_eq!(SessionStatus::from("generating"), SessionStatus::Generating);
        assert_eq!(SessionStatus::from("completed"), SessionStatus::Completed);
        assert_eq!(SessionStatus::from("failed"), SessionStatus::Failed);
        assert_eq!(SessionStatus::from("bogus"), SessionStatus::Generating);
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Generating.is_terminal());
    }

    #[test]
    fn test_comment_bound() {
        assert!(AnalysisSession::validate_comment("hello").is_ok());
        let big = "x".repeat(MAX_COMMENT_BYTES + 1);
        assert!(AnalysisSession::validate_comment(&big).is_err());
    }

    #[tokio::test]
    #[serial_test::serial]
    #[ignore = "requires Docker or DATABASE_URL pointing at Postgres"]
    async fn test_upsert_is_idempotent_and_coalescing() {
        let container = TestContainer::new().await;
        let pool = container.pool();

        let mut first = SessionPatch::new();
        first.comment = Some("initial".to_string());
        first.files_count = Some(2);
        AnalysisSession::upsert_report(pool, "sess-upsert", first)
            .await
            .expect("initial upsert");

        // Second patch carries only the report; comment must survive.
        let mut second = SessionPatch::new();
        second.status = Some("completed".to_string());
        second.report_text = Some("done".to_string());
        second.completed_at = Some(Utc::now());
        let row = AnalysisSession::upsert_report(pool, "sess-upsert", second)
            .await
            .expect("second upsert");

        assert_eq!(row.comment.as_deref(), Some("initial"));
        assert_eq!(row.files_count, 2);
        assert_eq!(row.status, "completed");
        assert_eq!(row.report_text.as_deref(), Some("done"));
        assert!(row.completed_at.is_some());

        // Terminal status never regresses.
        let mut third = SessionPatch::new();
        third.status = Some("generating".to_string());
        let row = AnalysisSession::upsert_report(pool, "sess-upsert", third)
            .await
            .expect("third upsert");
        assert_eq!(row.status, "completed");

        AnalysisSession::delete_cascade(pool, "sess-upsert")
            .await
            .expect("cleanup");
    }

    #[tokio::test]
    #[serial_test::serial]
    #[ignore = "requires Docker or DATABASE_URL pointing at Postgres"]
    async fn test_delete_cascade_reports_absence() {
        let container = TestContainer::new().await;
        let pool = container.pool();

        assert!(!AnalysisSession::delete_cascade(pool, "missing-session")
            .await
            .expect("delete"));
    }
}
