//! Retrieval subsystem — naive keyword search over ingested document fragments
//!
//! Deliberately coarse, matching the ingestion side's contract:
//! - keywords are whitespace tokens longer than 4 characters, lowercased
//! - a fragment matches when its content contains ANY keyword as a
//!   case-insensitive substring (OR across keywords, not AND)
//! - ranking is storage order (ingestion time, then id) truncated to the
//!   limit; there is no relevance score
//!
//! Matching fragments are folded into a grounding block that cites filename,
//! source locator and page for every fragment and tells the model citation
//! is mandatory.

use aide_core::models::KnowledgeFragment;
use sqlx::PgPool;

/// Tokens must be strictly longer than this to count as keywords.
const MIN_KEYWORD_CHARS: usize = 4;

/// Extract search keywords from a free-text prompt. Coarse by design: no
/// stopword list, just a length cutoff after trimming punctuation.
pub fn extract_keywords(prompt: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in prompt.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if token.chars().count() <= MIN_KEYWORD_CHARS {
            continue;
        }
        let token = token.to_lowercase();
        if !keywords.contains(&token) {
            keywords.push(token);
        }
    }
    keywords
}

/// Escape `%`, `_` and `\` so a keyword cannot act as a LIKE wildcard.
fn like_pattern(keyword: &str) -> String {
    let escaped = keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// First `limit` fragments (in ingestion order) whose content contains any
/// of the keywords, case-insensitively.
pub async fn search_fragments(
    pool: &PgPool,
    keywords: &[String],
    limit: i64,
) -> Result<Vec<KnowledgeFragment>, sqlx::Error> {
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let patterns: Vec<String> = keywords.iter().map(|k| like_pattern(k)).collect();

    sqlx::query_as::<_, KnowledgeFragment>(
        r#"
        SELECT id, filename, source, page, content, created_at
        FROM knowledge_fragments
        WHERE content ILIKE ANY($1)
        ORDER BY created_at, id
        LIMIT $2
        "#,
    )
    .bind(&patterns)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Truncate fragment content to the per-fragment budget, in characters so a
/// multi-byte sequence is never split.
fn truncate_content(content: &str, budget_chars: usize) -> String {
    if content.chars().count() <= budget_chars {
        content.to_string()
    } else {
        content.chars().take(budget_chars).collect()
    }
}

/// Prepend a grounding block to the user prompt. Every fragment is cited with
/// filename, source locator and page; the instruction makes citation
/// mandatory in the answer.
pub fn augment_prompt(
    prompt: &str,
    fragments: &[KnowledgeFragment],
    budget_chars: usize,
) -> String {
    if fragments.is_empty() {
        return prompt.to_string();
    }

    let mut block = String::from(
        "Usa la siguiente información de la base de conocimiento para responder. \
         Es obligatorio citar en tu respuesta el documento y la página de donde \
         proviene cada dato.\n",
    );

    for fragment in fragments {
        block.push_str(&format!(
            "\n[Documento: {} | Origen: {} | Página: {}]\n{}\n",
            fragment.filename,
            fragment.source,
            fragment.page,
            truncate_content(&fragment.content, budget_chars),
        ));
    }

    block.push_str("\nPregunta del usuario: ");
    block.push_str(prompt);
    block
}

// ============================================================================
// TESTS
// ============================================================================
