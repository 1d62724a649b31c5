use serde_json::Value;
use thiserror::Error;

/// Error kinds surfaced by the connector, per the propagation policy:
/// per-event/per-attribute failures are captured into a result wrapper,
/// per-instance failures are logged and drop that instance's batch, and
/// only `export()` and ad-hoc queries propagate to the caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown MISP instance: {0}")]
    Config(String),

    /// `body` carries the response body parsed as JSON, when the failure
    /// came from a non-2xx HTTP response and the body parsed cleanly;
    /// `export.rs` uses it to recover MISP's own `message`/`error` fields.
    #[error("request to {endpoint} failed: {message}")]
    Fetch { endpoint: String, message: String, body: Option<Value> },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// `artifact` names the offending artifact (spec §7), e.g. the
    /// exported attribute's `type:value` or the event itself.
    #[error("export rejected for {artifact}: {message}")]
    Export { artifact: String, message: String },
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Fetch {
            endpoint: err.url().map(|u| u.to_string()).unwrap_or_default(),
            message: err.to_string(),
            body: None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse {
            what: "json".to_string(),
            message: err.to_string(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
