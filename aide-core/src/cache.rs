//! Continuation-token cache — fast ephemeral state, separate from the durable log
//!
//! Ollama reports an opaque `context` blob when a generation completes; feeding
//! it back on the next turn resumes the conversation without resending history.
//! The blob lives in Redis keyed by session id and is overwritten on every
//! completed turn. Losing an entry only degrades continuity (the model starts
//! fresh), so callers treat every cache failure as "no token".

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Abstraction over the continuation-token store.
#[async_trait]
pub trait ContinuationCache: Send + Sync {
    /// Most recent completion state for the session, or `None` for "start fresh".
    async fn get(&self, session_id: Uuid) -> Result<Option<serde_json::Value>, CacheError>;

    /// Overwrite (not append) the stored token for the session.
    async fn set(&self, session_id: Uuid, token: &serde_json::Value) -> Result<(), CacheError>;
}

fn context_key(session_id: Uuid) -> String {
    format!("session:{}:context", session_id)
}

// ============================================================================
// RedisContinuationCache
// ============================================================================

/// Redis-backed cache. `ConnectionManager` reconnects on its own, so a handle
/// is pool-scoped and cloned per operation.
#[derive(Clone)]
pub struct RedisContinuationCache {
    conn: ConnectionManager,
}

impl RedisContinuationCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ContinuationCache for RedisContinuationCache {
    async fn get(&self, session_id: Uuid) -> Result<Option<serde_json::Value>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(context_key(session_id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, session_id: Uuid, token: &serde_json::Value) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(token)?;
        let _: () = conn.set(context_key(session_id), raw).await?;
        Ok(())
    }
}

// ============================================================================
// InMemoryContinuationCache
// ============================================================================

/// Process-local cache for tests and cache-less development setups.
#[derive(Default)]
pub struct InMemoryContinuationCache {
    entries: Mutex<HashMap<Uuid, serde_json::Value>>,
}

impl InMemoryContinuationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuationCache for InMemoryContinuationCache {
    async fn get(&self, session_id: Uuid) -> Result<Option<serde_json::Value>, CacheError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&session_id).cloned())
    }

    async fn set(&self, session_id: Uuid, token: &serde_json::Value) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(session_id, token.clone());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_get_missing_returns_none() {
        let cache = InMemoryContinuationCache::new();
        let token = cache.get(Uuid::new_v4()).await.unwrap();
        assert!(token.is_none(), "Unseen session must have no token");
    }

    #[tokio::test]
    async fn test_in_memory_set_then_get_roundtrip() {
        let cache = InMemoryContinuationCache::new();
        let sid = Uuid::new_v4();
        let token = serde_json::json!([1, 2, 3, 42]);

        cache.set(sid, &token).await.unwrap();
        let fetched = cache.get(sid).await.unwrap();
        assert_eq!(fetched, Some(token));
    }

    #[tokio::test]
    async fn test_in_memory_set_overwrites_previous_token() {
        let cache = InMemoryContinuationCache::new();
        let sid = Uuid::new_v4();

        cache.set(sid, &serde_json::json!([1])).await.unwrap();
        cache.set(sid, &serde_json::json!([2, 3])).await.unwrap();

        let fetched = cache.get(sid).await.unwrap();
        assert_eq!(
            fetched,
            Some(serde_json::json!([2, 3])),
            "Last completed turn must win"
        );
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let cache = InMemoryContinuationCache::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        cache.set(a, &serde_json::json!([7])).await.unwrap();

        assert!(cache.get(b).await.unwrap().is_none());
        assert_eq!(cache.get(a).await.unwrap(), Some(serde_json::json!([7])));
    }

    #[test]
    fn test_context_key_format() {
        let sid = Uuid::nil();
        assert_eq!(
            context_key(sid),
            "session:00000000-0000-0000-0000-000000000000:context"
        );
    }
}
