//! Conversation orchestrator — the full chat request lifecycle
//!
//! `converse` drives one turn end to end:
//! 1. resolve the session (atomic create-if-absent marks the first turn)
//! 2. append the user message to the durable log before any backend call
//! 3. read the continuation token from the cache (loss degrades, never fails)
//! 4. optionally build a retrieval grounding block, under a bounded timeout
//! 5. on the first turn, detach a bounded title-generation task
//! 6. stream partial text to the caller while accumulating it, and overwrite
//!    the cached continuation token when the backend reports completion
//! 7. persist the accumulated assistant message once the stream ends
//!
//! The producer task owns clones of the pool and cache, so persistence at
//! step 7 does not depend on the request handler still being alive. Backend
//! failures never break the transport: they become a single user-facing line
//! yielded as if it were model output, and whatever text was accumulated
//! (possibly just that line) is persisted as the assistant turn.
//!
//! Known race, accepted by design: two concurrent turns on the same session
//! interleave freely — message order is arrival order and the last writer to
//! the continuation cache wins. Session creation itself is atomic.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use aide_core::cache::ContinuationCache;
use aide_core::config::{ChatConfig, RetrievalConfig};
use aide_core::models::MessageRole;
use aide_core::ollama::{GenerateEvent, OllamaClient, OllamaError};
use bytes::Bytes;
use futures::StreamExt;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::store;
use crate::subsystems::{retrieve, title};

/// Shared handles for the chat path. The pool and cache are pool-scoped; the
/// producer task clones what it needs per request.
#[derive(Clone)]
pub struct ChatDeps {
    pub pool: PgPool,
    pub cache: Arc<dyn ContinuationCache>,
    pub ollama: OllamaClient,
    pub chat: ChatConfig,
    pub retrieval: RetrievalConfig,
}

pub struct ConverseParams {
    pub username: String,
    pub prompt: String,
    pub model: Option<String>,
    pub session_id: Option<Uuid>,
    pub use_retrieval: bool,
}

/// A live turn: the resolved session id travels out-of-band (`X-Session-Id`)
/// while `stream` carries the text body.
pub struct Conversation {
    pub session_id: Uuid,
    pub first_turn: bool,
    pub stream: ReceiverStream<Result<Bytes, Infallible>>,
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Usuario no encontrado")]
    UnknownUser,

    #[error("La sesión pertenece a otro usuario")]
    ForeignSession,

    #[error("El mensaje no puede estar vacío")]
    EmptyPrompt,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Buffered chunks between the producer task and the HTTP body.
const CHANNEL_CAPACITY: usize = 32;

pub async fn converse(deps: &ChatDeps, params: ConverseParams) -> Result<Conversation, ChatError> {
    let prompt = params.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ChatError::EmptyPrompt);
    }

    let user = store::get_user(&deps.pool, &params.username)
        .await?
        .ok_or(ChatError::UnknownUser)?;

    // Step 1: session resolution. A client-chosen id that the store has not
    // seen yet materializes here; `first_turn` is the insert flag. An existing
    // session must belong to the requesting user — otherwise a guessed id
    // would read another user's continuation state and append to their log.
    let session_id = params.session_id.unwrap_or_else(Uuid::new_v4);
    let first_turn = store::create_session_if_absent(&deps.pool, session_id, user.id).await?;
    if !first_turn {
        match store::get_session(&deps.pool, session_id).await? {
            Some(session) if session.user_id == user.id => {}
            _ => return Err(ChatError::ForeignSession),
        }
    }

    // Step 2: the user message is durable before anything can fail downstream.
    store::append_message(&deps.pool, session_id, MessageRole::User, &prompt).await?;

    // Step 3: continuation lookup. Cache trouble means "start fresh".
    let continuation = match deps.cache.get(session_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "Continuation lookup failed — starting fresh");
            None
        }
    };

    let model = params
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| deps.chat.default_model.clone());

    // Step 4: optional grounding, bounded so retrieval can never stall the turn.
    let mut backend_prompt = prompt.clone();
    if params.use_retrieval {
        let deadline = Duration::from_secs(deps.retrieval.timeout_seconds);
        match tokio::time::timeout(deadline, grounded_prompt(deps, &prompt)).await {
            Ok(Ok(Some(grounded))) => backend_prompt = grounded,
            Ok(Ok(None)) => tracing::debug!(%session_id, "No matching fragments — prompt unchanged"),
            Ok(Err(e)) => {
                tracing::warn!(%session_id, error = %e, "Retrieval failed — proceeding without grounding")
            }
            Err(_) => {
                tracing::warn!(%session_id, "Retrieval timed out — proceeding without grounding")
            }
        }
    }

    // Step 5: first-turn title, detached and bounded.
    if first_turn {
        title::spawn_title_task(
            deps.ollama.clone(),
            deps.pool.clone(),
            session_id,
            Arc::from(model.as_str()),
            prompt.clone(),
            Duration::from_secs(deps.chat.title_timeout_seconds),
        );
    }

    // Steps 6 and 7 run in the producer task so the stream starts immediately
    // and persistence survives the request handler going away.
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(CHANNEL_CAPACITY);
    let pool = deps.pool.clone();
    let cache = Arc::clone(&deps.cache);
    let ollama = deps.ollama.clone();

    tokio::spawn(async move {
        let assistant_text =
            run_generation(&tx, &ollama, &cache, session_id, &model, &backend_prompt, continuation)
                .await;
        drop(tx);

        if let Err(e) =
            store::append_message(&pool, session_id, MessageRole::Assistant, &assistant_text).await
        {
            tracing::error!(%session_id, error = %e, "Failed to persist assistant message");
        }
    });

    Ok(Conversation {
        session_id,
        first_turn,
        stream: ReceiverStream::new(rx),
    })
}

async fn grounded_prompt(deps: &ChatDeps, prompt: &str) -> anyhow::Result<Option<String>> {
    let keywords = retrieve::extract_keywords(prompt);
    if keywords.is_empty() {
        return Ok(None);
    }

    let fragments =
        retrieve::search_fragments(&deps.pool, &keywords, deps.retrieval.max_fragments as i64)
            .await?;
    if fragments.is_empty() {
        return Ok(None);
    }

    tracing::info!(count = fragments.len(), "Grounding prompt with fragments");
    Ok(Some(retrieve::augment_prompt(
        prompt,
        &fragments,
        deps.retrieval.fragment_budget_chars,
    )))
}

/// Consume the backend stream: forward each partial-text event, accumulate
/// the full text, store the continuation token on completion. Returns the
/// accumulated assistant text, which may be empty or a single error line.
async fn run_generation(
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    ollama: &OllamaClient,
    cache: &Arc<dyn ContinuationCache>,
    session_id: Uuid,
    model: &str,
    prompt: &str,
    continuation: Option<serde_json::Value>,
) -> String {
    let mut accumulated = String::new();

    let mut stream = match ollama.generate_stream(model, prompt, continuation.as_ref()).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(%session_id, error = %e, "Generation request failed");
            let line = user_facing_error(&e, model);
            let _ = tx.send(Ok(Bytes::from(line.clone()))).await;
            return line;
        }
    };

    while let Some(event) = stream.next().await {
        match event {
            Ok(GenerateEvent::Token(text)) => {
                if text.is_empty() {
                    continue;
                }
                accumulated.push_str(&text);
                if tx.send(Ok(Bytes::from(text))).await.is_err() {
                    // Client disconnected: dropping the stream aborts the
                    // backend read; the partial text still gets persisted.
                    tracing::info!(%session_id, "Client disconnected mid-stream — aborting generation");
                    break;
                }
            }
            Ok(GenerateEvent::Done { context }) => {
                if let Some(token) = context {
                    if let Err(e) = cache.set(session_id, &token).await {
                        tracing::warn!(%session_id, error = %e, "Failed to store continuation token");
                    }
                }
                break;
            }
            Err(e) => {
                tracing::error!(%session_id, error = %e, "Generation failed mid-stream");
                let line = user_facing_error(&e, model);
                accumulated.push_str(&line);
                let _ = tx.send(Ok(Bytes::from(line))).await;
                break;
            }
        }
    }

    accumulated
}

/// One human-readable line per failure class, yielded in place of model
/// output so the client-visible stream always terminates cleanly.
pub fn user_facing_error(error: &OllamaError, model: &str) -> String {
    match error {
        OllamaError::ModelNotFound { .. } => format!(
            "El modelo '{model}' no está instalado en el backend de inferencia. \
             Descárgalo con `ollama pull {model}` e inténtalo de nuevo."
        ),
        OllamaError::ResourceExhausted { .. } => "El backend de inferencia se quedó sin recursos \
             para atender la petición. Prueba con un modelo más pequeño o inténtalo más tarde."
            .to_string(),
        _ => "No se pudo obtener respuesta del backend de inferencia. Comprueba que el servicio \
             esté en marcha e inténtalo de nuevo."
            .to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_not_found_message_names_the_model() {
        let error = OllamaError::ModelNotFound {
            model: "mistral".to_string(),
        };
        let line = user_facing_error(&error, "mistral");
        assert!(line.contains("'mistral'"));
        assert!(line.contains("ollama pull mistral"));
    }

    #[test]
    fn test_failure_classes_have_distinct_messages() {
        let not_found = user_facing_error(
            &OllamaError::ModelNotFound {
                model: "llama3".to_string(),
            },
            "llama3",
        );
        let exhausted = user_facing_error(
            &OllamaError::ResourceExhausted {
                message: "oom".to_string(),
            },
            "llama3",
        );
        let generic = user_facing_error(
            &OllamaError::Api {
                code: 500,
                message: "boom".to_string(),
            },
            "llama3",
        );

        assert_ne!(not_found, exhausted);
        assert_ne!(exhausted, generic);
        assert_ne!(not_found, generic);
    }
}
