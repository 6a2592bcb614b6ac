//! Document analysis — buffered, non-streaming `/analyze` support
//!
//! The upload must be a PDF; text extraction happens upstream (the ingestion
//! side ships the extracted text as the part body), so this subsystem only
//! validates the upload, rejects empty extractions, and issues one buffered
//! generation over the text.

use aide_core::ollama::{OllamaClient, OllamaError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Solo se admiten archivos PDF")]
    NotPdf,

    #[error("El PDF no contiene texto extraíble")]
    EmptyText,

    #[error(transparent)]
    Backend(#[from] OllamaError),
}

/// A file counts as a PDF when either the filename extension or the declared
/// content type says so. Checked before any backend call.
pub fn is_pdf_upload(filename: &str, content_type: Option<&str>) -> bool {
    filename.to_ascii_lowercase().ends_with(".pdf")
        || content_type
            .map(|ct| ct.eq_ignore_ascii_case("application/pdf"))
            .unwrap_or(false)
}

fn analysis_prompt(filename: &str, text: &str, query: Option<&str>) -> String {
    let task = match query {
        Some(q) if !q.trim().is_empty() => format!(
            "Responde a la siguiente pregunta usando únicamente el documento: {}",
            q.trim()
        ),
        _ => "Resume los puntos clave del documento.".to_string(),
    };

    format!(
        "Eres un analista de documentos. A continuación tienes el texto extraído \
         del documento '{}'.\n\n{}\n\n---\n{}\n",
        filename, task, text
    )
}

/// Validate the upload and run one buffered analysis call. Returns the JSON
/// body for the HTTP layer.
pub async fn analyze_document(
    ollama: &OllamaClient,
    model: &str,
    filename: &str,
    content_type: Option<&str>,
    text: &str,
    query: Option<&str>,
) -> Result<serde_json::Value, AnalyzeError> {
    if !is_pdf_upload(filename, content_type) {
        return Err(AnalyzeError::NotPdf);
    }

    let text = text.trim();
    if text.is_empty() {
        return Err(AnalyzeError::EmptyText);
    }

    let prompt = analysis_prompt(filename, text, query);
    let analysis = ollama.generate_once(model, &prompt).await?;

    Ok(serde_json::json!({
        "filename": filename,
        "model": model,
        "analysis": analysis,
    }))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_pdf_detection_by_extension() {
        assert!(is_pdf_upload("informe.PDF", None));
        assert!(is_pdf_upload("informe.pdf", Some("application/octet-stream")));
        assert!(!is_pdf_upload("informe.docx", None));
    }

    #[test]
    fn test_pdf_detection_by_content_type() {
        assert!(is_pdf_upload("upload", Some("application/pdf")));
        assert!(!is_pdf_upload("upload", Some("text/plain")));
    }

    #[tokio::test]
    async fn test_non_pdf_rejected_before_backend_call() {
        // Unreachable backend: the validation error must win.
        let ollama = OllamaClient::with_base_url("http://127.0.0.1:1".to_string());

        let result =
            analyze_document(&ollama, "llama3", "notas.txt", Some("text/plain"), "hola", None)
                .await;

        assert!(matches!(result, Err(AnalyzeError::NotPdf)));
    }

    #[tokio::test]
    async fn test_empty_extracted_text_rejected() {
        let ollama = OllamaClient::with_base_url("http://127.0.0.1:1".to_string());

        let result =
            analyze_document(&ollama, "llama3", "vacio.pdf", None, "   \n\t ", None).await;

        assert!(matches!(result, Err(AnalyzeError::EmptyText)));
    }

    #[tokio::test]
    async fn test_analysis_returns_json_result() {
        let mock_server = MockServer::start().await;
        let ollama = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "El contrato vence en 2027.",
                "done": true
            })))
            .mount(&mock_server)
            .await;

        let result = analyze_document(
            &ollama,
            "llama3",
            "contrato.pdf",
            Some("application/pdf"),
            "Cláusula 4: vigencia hasta 2027...",
            Some("¿cuándo vence?"),
        )
        .await
        .unwrap();

        assert_eq!(result["filename"], "contrato.pdf");
        assert_eq!(result["model"], "llama3");
        assert_eq!(result["analysis"], "El contrato vence en 2027.");
    }

    #[test]
    fn test_analysis_prompt_uses_query_when_present() {
        let p = analysis_prompt("a.pdf", "texto", Some("¿quién firma?"));
        assert!(p.contains("¿quién firma?"));
        assert!(!p.contains("Resume los puntos clave"));
    }

    #[test]
    fn test_analysis_prompt_defaults_to_summary() {
        let p = analysis_prompt("a.pdf", "texto", None);
        assert!(p.contains("Resume los puntos clave"));
    }
}
