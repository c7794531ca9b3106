pub mod types;
pub mod prompt;
pub mod parser;
pub mod ollama;

pub use types::*;
pub use prompt::*;
pub use parser::*;
pub use ollama::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Ollama is not running at {0}")]
    OllamaConnection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    OllamaError { status: u16, body: String },

    #[error("Model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}
