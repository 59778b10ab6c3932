//! Error types shared by the sync pipeline, the stores and the read API.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A Notion property is absent or does not carry the expected type.
    #[error("Property {name} {problem}")]
    Property { name: String, problem: String },

    /// A remote service answered with a non-success status.
    #[error("{service} responded {status}: {body}")]
    Remote {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid note key: {0}")]
    NoteKey(String),

    #[error("No entity url found: {0}")]
    NoEntityUrl(String),
}

impl Error {
    pub(crate) fn property(name: &str, problem: impl Into<String>) -> Self {
        Error::Property {
            name: name.to_string(),
            problem: problem.into(),
        }
    }
}
