//! Title generation — first turn only, bounded and never fatal
//!
//! On the first turn of a session a buffered generation call summarizes the
//! opening prompt into a short title. The task runs detached from the main
//! streaming response under a timeout; every failure path logs and leaves the
//! title unset, so the session list falls back to the configured default.

use std::sync::Arc;
use std::time::Duration;

use aide_core::ollama::OllamaClient;
use sqlx::PgPool;
use uuid::Uuid;

use crate::store;

pub fn title_prompt(prompt: &str) -> String {
    format!(
        "Genera un título muy corto (máximo 5 palabras) que resuma esto: '{}'. \
         Devuelve solo el título, nada más.",
        prompt
    )
}

/// Strip surrounding quotes and whitespace from the model's reply.
pub fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '«' || c == '»')
        .trim()
        .to_string()
}

/// Run one bounded title generation and persist the result. Returns whether
/// a title was actually written (the set-once guard in the store means a
/// concurrent winner also reports `false` here).
pub async fn generate_title(
    ollama: &OllamaClient,
    pool: &PgPool,
    session_id: Uuid,
    model: &str,
    prompt: &str,
    timeout: Duration,
) -> anyhow::Result<bool> {
    let full_prompt = title_prompt(prompt);
    let request = ollama.generate_once(model, &full_prompt);
    let raw = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| anyhow::anyhow!("title generation timed out after {:?}", timeout))??;

    let title = clean_title(&raw);
    if title.is_empty() {
        anyhow::bail!("backend returned an empty title");
    }

    let written = store::set_title(pool, session_id, &title).await?;
    Ok(written)
}

/// Detached first-turn task: the streaming response never waits on this.
pub fn spawn_title_task(
    ollama: OllamaClient,
    pool: PgPool,
    session_id: Uuid,
    model: Arc<str>,
    prompt: String,
    timeout: Duration,
) {
    tokio::spawn(async move {
        match generate_title(&ollama, &pool, session_id, &model, &prompt, timeout).await {
            Ok(true) => tracing::info!(%session_id, "Session title generated"),
            Ok(false) => tracing::debug!(%session_id, "Session title already set — skipped"),
            Err(e) => tracing::warn!(%session_id, error = %e, "Title generation failed — keeping default"),
        }
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_title_strips_double_quotes() {
        assert_eq!(clean_title("\"Capital de Francia\""), "Capital de Francia");
    }

    #[test]
    fn test_clean_title_strips_single_quotes_and_whitespace() {
        assert_eq!(clean_title("  'Resumen breve'  \n"), "Resumen breve");
    }

    #[test]
    fn test_clean_title_strips_guillemets() {
        assert_eq!(clean_title("«Plan de viaje»"), "Plan de viaje");
    }

    #[test]
    fn test_clean_title_plain_text_untouched() {
        assert_eq!(clean_title("Dudas sobre facturación"), "Dudas sobre facturación");
    }

    #[test]
    fn test_clean_title_only_quotes_becomes_empty() {
        assert_eq!(clean_title("\"\""), "");
    }

    #[test]
    fn test_title_prompt_embeds_user_prompt() {
        let p = title_prompt("¿Cuál es la capital de Francia?");
        assert!(p.contains("¿Cuál es la capital de Francia?"));
        assert!(p.contains("máximo 5 palabras"));
    }
}
