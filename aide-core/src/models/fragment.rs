use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One retrievable unit of ingested document text (typically one page).
/// Immutable once ingested; the orchestrator only ever reads these.
/// Uniqueness on `source` is enforced by the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KnowledgeFragment {
    pub id: Uuid,
    pub filename: String,
    /// Original path or object key the fragment came from.
    pub source: String,
    pub page: i32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
