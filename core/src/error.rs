use thiserror::Error;

/// HTTP statuses the transport treats as transient.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

const BODY_SNIPPET_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("API key validation failed: {status} {body}")]
    Authentication { status: u16, body: String },

    #[error("fetch error: {status} {body}")]
    Extraction { status: u16, body: String },

    #[error("unexpected HTTP status: {status} {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not persist watermark: {0}")]
    Persistence(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted by user")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds an `UnexpectedStatus` with the body cut down to a log-friendly snippet.
    pub fn unexpected_status(status: u16, body: &str) -> Self {
        Error::UnexpectedStatus {
            status,
            body: snippet(body),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UnexpectedStatus { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Database(e) => is_transient_database_error(e),
            Error::Io(_) => true,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => 130,
            _ => 1,
        }
    }
}

fn is_transient_database_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

/// Connection exceptions, serialization failures and admin shutdowns.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code == "40001" || code == "57P01"
}

pub fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_CHARS).collect()
}
