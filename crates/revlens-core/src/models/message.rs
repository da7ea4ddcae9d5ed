use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::DatabasePool;
use crate::error::{AppError, AppResult};
use crate::schema::session_messages;

/// A durable conversational entry within a session
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = session_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SessionMessage {
    pub id: Uuid,
    pub session_id: String,
    pub role: String,
    pub content: serde_json::Value,
    pub message_order: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = session_messages)]
pub struct NewSessionMessage {
    pub session_id: String,
    pub role: String,
    pub content: serde_json::Value,
    pub message_order: i32,
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl SessionMessage {
    /// Append a message, allocating the next dense `message_order`.
    ///
    /// The unique (session_id, message_order) constraint guards the
    /// allocation; on a collision the read-and-insert pair is retried.
    pub async fn append(
        pool: &DatabasePool,
        session_id: &str,
        role: MessageRole,
        content: serde_json::Value,
    ) -> AppResult<SessionMessage> {
        use crate::schema::session_messages::dsl;

        let mut conn = pool.get().await?;

        for _ in 0..3 {
            let current: Option<i32> = dsl::session_messages
                .filter(dsl::session_id.eq(session_id))
                .select(diesel::dsl::max(dsl::message_order))
                .first(&mut conn)
                .await?;

            let new_message = NewSessionMessage {
                session_id: session_id.to_string(),
                role: role.to_string(),
                content: content.clone(),
                message_order: current.unwrap_or(0) + 1,
            };

            match diesel::insert_into(dsl::session_messages)
                .values(&new_message)
                .get_result::<SessionMessage>(&mut conn)
                .await
            {
                Ok(message) => return Ok(message),
                Err(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::UniqueViolation,
                    _,
                )) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::InternalError(format!(
            "Could not allocate message order for session {}",
            session_id
        )))
    }

    /// All messages of a session in causal order
    pub async fn for_session(
        pool: &DatabasePool,
        session_id: &str,
    ) -> AppResult<Vec<SessionMessage>> {
        use crate::schema::session_messages::dsl;

        let mut conn = pool.get().await?;

        let messages = dsl::session_messages
            .filter(dsl::session_id.eq(session_id))
            .order(dsl::message_order.asc())
            .load::<SessionMessage>(&mut conn)
            .await?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{AnalysisSession, SessionPatch};
    use crate::test_utils::TestContainer;
    use serde_json::json;

    #[test]
    fn test_role_rendering() {
        assert_eq!(MessageRole::User.to_string(), "user");
        assert_eq!(MessageRole::Assistant.to_string(), "assistant");
    }

    #[tokio::test]
    #[serial_test::serial]
    #[ignore = "requires Docker or DATABASE_URL pointing at Postgres"]
    async fn test_append_allocates_dense_orders() {
        let container = TestContainer::new().await;
        let pool = container.pool();

        AnalysisSession::upsert_report(pool, "sess-msg", SessionPatch::new())
            .await
            .expect("session row");

        let first = SessionMessage::append(pool, "sess-msg", MessageRole::User, json!({"q": 1}))
            .await
            .expect("first message");
        let second =
            SessionMessage::append(pool, "sess-msg", MessageRole::Assistant, json!({"a": 1}))
                .await
                .expect("second message");

        assert_eq!(first.message_order, 1);
        assert_eq!(second.message_order, 2);

        let all = SessionMessage::for_session(pool, "sess-msg")
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
        assert!(all.windows(2).all(|w| w[0].message_order < w[1].message_order));

        AnalysisSession::delete_cascade(pool, "sess-msg")
            .await
            .expect("cleanup");
    }
}
