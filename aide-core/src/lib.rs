pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ollama;

pub use cache::{ContinuationCache, InMemoryContinuationCache, RedisContinuationCache};
pub use config::AideConfig;
pub use error::AideError;
pub use ollama::{GenerateEvent, OllamaClient, OllamaError};
