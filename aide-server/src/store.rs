//! Session store — durable users / sessions / messages on Postgres
//!
//! Expected tables (schema managed externally, reference DDL in `schema.sql`):
//! - `users(id, username UNIQUE, password_hash, created_at)`
//! - `sessions(id, user_id, title NULL, created_at)`
//! - `messages(id, session_id, role, content, created_at)`
//! - `knowledge_fragments(id, filename, source UNIQUE, page, content, created_at)`
//!
//! Messages are append-only; session titles are set at most once
//! (`set_title` guards with `WHERE title IS NULL`). Session creation is an
//! atomic create-if-absent so two concurrent first turns on the same fresh id
//! cannot produce duplicate rows.

use aide_core::models::{Message, MessageRole, Session, SessionSummary, User};
use sqlx::PgPool;
use uuid::Uuid;

/// Strip embedded null bytes before storage. Postgres `text` columns reject
/// `\0` sequences, and prompts occasionally carry them from pasted binary.
pub fn sanitize_text(text: &str) -> String {
    if text.contains('\0') {
        text.replace('\0', "")
    } else {
        text.to_string()
    }
}

// ============================================================================
// Users
// ============================================================================

/// Insert a new user. Returns `false` if the username is already taken.
pub async fn create_user(
    pool: &PgPool,
    username: &str,
    password_hash: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (id, username, password_hash)
        VALUES ($1, $2, $3)
        ON CONFLICT (username) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(password_hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_user(pool: &PgPool, username: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, username, password_hash, created_at
        FROM users
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

// ============================================================================
// Sessions
// ============================================================================

/// Atomic create-if-absent. Returns `true` when this call materialized the
/// session (the "first turn" marker for the orchestrator).
pub async fn create_session_if_absent(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Unknown id is a normal outcome (sessions materialize lazily), not an error.
pub async fn get_session(pool: &PgPool, session_id: Uuid) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(
        r#"
        SELECT id, user_id, title, created_at
        FROM sessions
        WHERE id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

/// Set-once title write: a no-op when a title is already present, so the
/// first completed title generation wins and later turns never overwrite it.
pub async fn set_title(pool: &PgPool, session_id: Uuid, title: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET title = $2
        WHERE id = $1 AND title IS NULL
        "#,
    )
    .bind(session_id)
    .bind(sanitize_text(title))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Sessions for a user, oldest first.
pub async fn list_sessions(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<SessionSummary>, sqlx::Error> {
    sqlx::query_as::<_, SessionSummary>(
        r#"
        SELECT id, title, created_at
        FROM sessions
        WHERE user_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// Messages
// ============================================================================

/// Append one message to the session's durable log. Content is null-byte
/// sanitized here so every caller gets the same guarantee.
pub async fn append_message(
    pool: &PgPool,
    session_id: Uuid,
    role: MessageRole,
    content: &str,
) -> Result<Uuid, sqlx::Error> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO messages (id, session_id, role, content)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(session_id)
    .bind(role.as_str())
    .bind(sanitize_text(content))
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Full message log for a session in creation order.
pub async fn list_messages(pool: &PgPool, session_id: Uuid) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(
        r#"
        SELECT id, session_id, role, content, created_at
        FROM messages
        WHERE session_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
}

// ============================================================================
// TESTS
// ============================================================================
