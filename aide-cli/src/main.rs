//! aide-cli — terminal frontend for the Aide personal-assistant API
//!
//! # Subcommands
//! - `register <username>`            — create a user (prompts for password via arg)
//! - `login <username>`               — verify credentials
//! - `sessions <username>`            — list a user's conversations
//! - `chat <prompt> -u <username>`    — one streamed chat turn; prints the
//!   session id on stderr so follow-up turns can pass `--session`
//! - `status`                         — show server health

use std::io::{Read, Write};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "aide-cli",
    version,
    about = "Aide personal assistant — terminal client"
)]
struct Cli {
    /// Aide HTTP server URL (overrides AIDE_HTTP_URL env var)
    #[arg(long, env = "AIDE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register a new user
    Register {
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// Verify credentials against the server
    Login {
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// List a user's conversations, oldest first
    Sessions { username: String },

    /// Send one chat turn and stream the reply to stdout
    Chat {
        /// Prompt text to send
        prompt: String,

        /// Username the turn belongs to
        #[arg(short, long)]
        username: String,

        /// Model name on the inference backend
        #[arg(short, long, default_value = "llama3")]
        model: String,

        /// Existing session id to continue (omit to start a new one)
        #[arg(short, long)]
        session: Option<String>,

        /// Ground the prompt with the knowledge base
        #[arg(long)]
        retrieval: bool,
    },

    /// Show Aide server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionEntry {
    id: String,
    description: String,
    created_at: String,
}

// ============================================================================
// Rendering helpers
// ============================================================================

fn render_session_row(entry: &SessionEntry) -> String {
    format!("{}  {}  {}", entry.id, entry.created_at, entry.description)
}

fn render_error(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.to_string());
    format!("Error ({}): {}", status, detail)
}

// ============================================================================
// Commands
// ============================================================================

fn post_credentials(server: &str, path: &str, username: &str, password: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("{}{}", server, path))
        .json(&serde_json::json!({ "username": username, "password": password }))
        .send()?;

    let status = response.status();
    let body = response.text()?;
    if status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or(body);
        println!("✅ {}", message);
        Ok(())
    } else {
        anyhow::bail!("{}", render_error(status.as_u16(), &body))
    }
}

fn list_sessions(server: &str, username: &str) -> anyhow::Result<()> {
    let response = reqwest::blocking::get(format!("{}/sessions/{}", server, username))?;
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        anyhow::bail!("{}", render_error(status.as_u16(), &body));
    }

    let sessions: Vec<SessionEntry> = serde_json::from_str(&body)?;
    if sessions.is_empty() {
        println!("No hay conversaciones todavía.");
        return Ok(());
    }
    for entry in &sessions {
        println!("{}", render_session_row(entry));
    }
    Ok(())
}

fn chat(
    server: &str,
    username: &str,
    prompt: &str,
    model: &str,
    session: Option<String>,
    retrieval: bool,
) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(None) // streaming responses stay open for the whole generation
        .build()?;

    let mut response = client
        .post(format!("{}/chat", server))
        .json(&serde_json::json!({
            "username": username,
            "prompt": prompt,
            "model": model,
            "session_id": session,
            "use_retrieval": retrieval,
        }))
        .send()?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text()?;
        anyhow::bail!("{}", render_error(status.as_u16(), &body));
    }

    let session_id = response
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    // Forward the body chunk-by-chunk as it arrives.
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 1024];
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n])?;
        stdout.flush()?;
    }
    println!();

    if let Some(id) = session_id {
        eprintln!("session: {}", id);
    }
    Ok(())
}

fn status(server: &str) -> anyhow::Result<()> {
    let response = reqwest::blocking::get(format!("{}/health", server))?;
    let status = response.status();
    let body: serde_json::Value = response.json()?;

    if status.is_success() {
        println!("✅ Aide server healthy");
        if let Some(pg) = body.get("postgresql").and_then(|v| v.as_str()) {
            println!("   postgresql: {}", pg);
        }
        if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
            println!("   version: {}", version);
        }
        Ok(())
    } else {
        anyhow::bail!(
            "❌ Server unhealthy: {}",
            body.get("error").and_then(|e| e.as_str()).unwrap_or("?")
        )
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Register { username, password } => {
            post_credentials(&cli.server, "/register", &username, &password)
        }
        Commands::Login { username, password } => {
            post_credentials(&cli.server, "/login", &username, &password)
        }
        Commands::Sessions { username } => list_sessions(&cli.server, &username),
        Commands::Chat {
            prompt,
            username,
            model,
            session,
            retrieval,
        } => chat(&cli.server, &username, &prompt, &model, session, retrieval),
        Commands::Status => status(&cli.server),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_session_row() {
        let entry = SessionEntry {
            id: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
            description: "Nueva conversación".to_string(),
            created_at: "2026-08-25T10:00:00Z".to_string(),
        };
        let row = render_session_row(&entry);
        assert!(row.starts_with("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee"));
        assert!(row.ends_with("Nueva conversación"));
    }

    #[test]
    fn test_render_error_extracts_json_detail() {
        let rendered = render_error(409, "{\"error\":\"El usuario ya existe\"}");
        assert_eq!(rendered, "Error (409): El usuario ya existe");
    }

    #[test]
    fn test_render_error_falls_back_to_raw_body() {
        let rendered = render_error(502, "bad gateway");
        assert_eq!(rendered, "Error (502): bad gateway");
    }
}
