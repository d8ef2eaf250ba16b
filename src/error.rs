use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for poml-render operations
#[derive(Error, Debug)]
pub enum PomlError {
    /// IO error when reading documents or referenced files
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// File not found error with specific path
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Path traversal security error
    #[error("Path traversal detected (trying to access files outside base directory): {path}")]
    PathTraversal { path: PathBuf },

    /// Referenced file exceeds the configured limit
    #[error("File size exceeds limit of {max_size} bytes: {path} ({size} bytes)")]
    FileSizeExceeded {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    /// Malformed XML markup
    #[error("XML syntax error{}: {message}", .position.map(|p| format!(" at byte {p}")).unwrap_or_default())]
    Xml {
        message: String,
        position: Option<u64>,
    },

    /// Document does not start with a `<poml>` element
    #[error("Expected <poml> root element, found <{found}>")]
    MissingRoot { found: String },

    /// Input ended before the markup was complete
    #[error("Unexpected end of document: expected {expected}")]
    UnexpectedEof { expected: String },

    /// Template expression could not be parsed or evaluated
    #[error("Expression error at position {position} in `{expression}`: {message}")]
    Expression {
        expression: String,
        position: usize,
        message: String,
    },

    /// Template expression referenced a name that is not in scope
    #[error("Undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Element body or attribute was expected to hold JSON
    #[error("Invalid JSON in {context}: {message}")]
    InvalidJson { context: String, message: String },

    /// Unknown output format name
    #[error(
        "Unsupported format '{value}' (expected one of: message_dict, dict, openai_chat, langchain, pydantic)"
    )]
    UnsupportedFormat { value: String },

    /// Malformed `if`/`for` directive or `let` binding
    #[error("Invalid {directive}: {message}")]
    InvalidDirective { directive: String, message: String },

    /// Structural validation failed
    #[error("POML validation failed: {}", .issues.join("; "))]
    Validation { issues: Vec<String> },

    /// No template engine is registered under the requested name
    #[error("Template engine '{name}' is not available. {hint}")]
    EngineUnavailable { name: String, hint: String },

    /// A template engine with the same name was already registered
    #[error("Template engine already registered: {name}")]
    EngineExists { name: String },

    /// `data:` URI could not be decoded
    #[error("Invalid data URI: {reason}")]
    InvalidDataUri { reason: String },

    /// Regex compilation error
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<quick_xml::Error> for PomlError {
    fn from(err: quick_xml::Error) -> Self {
        PomlError::Xml {
            message: err.to_string(),
            position: None,
        }
    }
}

impl From<quick_xml::events::attributes::AttrError> for PomlError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        PomlError::Xml {
            message: format!("Invalid attribute: {err}"),
            position: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PomlError>;
