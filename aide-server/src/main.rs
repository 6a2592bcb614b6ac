use std::sync::Arc;

use aide_core::cache::{ContinuationCache, RedisContinuationCache};
use aide_core::ollama::OllamaClient;
use aide_core::AideConfig;
use aide_server::subsystems::orchestrate::ChatDeps;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "aide.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match AideConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match aide_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match aide_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match RedisContinuationCache::connect(&config.cache.url).await {
            Ok(_) => println!("✅ Redis cache reachable at {}", config.cache.url),
            Err(e) => {
                println!("❌ Redis connection failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Aide health check passed");
        return Ok(());
    }

    // Continuation cache. ConnectionManager reconnects on its own afterwards;
    // entries may still be lost, which only degrades conversational continuity.
    let cache: Arc<dyn ContinuationCache> =
        match RedisContinuationCache::connect(&config.cache.url).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                eprintln!("Failed to connect to Redis at {}: {}", config.cache.url, e);
                std::process::exit(1);
            }
        };

    let ollama = match OllamaClient::new(&config.ollama) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build Ollama client: {}", e);
            std::process::exit(1);
        }
    };

    let deps = Arc::new(ChatDeps {
        pool,
        cache,
        ollama,
        chat: config.chat.clone(),
        retrieval: config.retrieval.clone(),
    });

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    aide_server::http::start_http_server(deps, &config.http, tx.subscribe()).await?;

    Ok(())
}
