//! Application-wide error types.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Pledge/finalize/refund attempted on a campaign with no on-chain
    /// counterpart. Raised before any network call is made.
    #[error("Campaign is not deployed on-chain")]
    NotDeployed,

    /// The escrow node rejected a write; the reason is surfaced verbatim
    /// and the action is never retried automatically.
    #[error("Transaction reverted: {0}")]
    ChainRevert(String),

    /// A chain read came back with missing or unreadable critical fields.
    /// Local state is left untouched; a later poll retries.
    #[error("Stale chain read: {0}")]
    StaleRead(String),

    #[error("Event decode error: {0}")]
    EventDecode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl ReconcilerError {
    /// HTTP status the API layer maps this error to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotDeployed | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ChainRevert(_) => StatusCode::CONFLICT,
            Self::StaleRead(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::EventDecode(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcilerError>;
