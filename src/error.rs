use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the upload pipeline, grouped by how the run reacts
/// to them: transient and quota errors are retried, authentication errors
/// stop the run, local errors skip a single job.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("platform API rate limit reached")]
    RateLimited,

    #[error("supplied authorization code is not valid, acquire a new one at {authorize_url}")]
    InvalidAuthorizationCode { authorize_url: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("platform API failure '{message}' ({})", describe_code(.code))]
    Transient { message: String, code: Option<u16> },

    #[error("no authorization code supplied and no saved credential at {}", .0.display())]
    MissingAuthorizationCode(PathBuf),

    #[error("saved credential {} is unusable: {reason}", path.display())]
    CredentialFile { path: PathBuf, reason: String },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Errors that no amount of retrying or refreshing can resolve.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidAuthorizationCode { .. }
                | UploadError::Authentication(_)
                | UploadError::MissingAuthorizationCode(_)
                | UploadError::CredentialFile { .. }
        )
    }

    pub fn credential_file(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        UploadError::CredentialFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UploadError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        UploadError::Json {
            path: path.into(),
            source,
        }
    }
}

fn describe_code(code: &Option<u16>) -> String {
    match code {
        Some(code) => format!("HTTP {code}"),
        None => "network".to_string(),
    }
}
