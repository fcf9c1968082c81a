//! Error taxonomy for the gateway.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant is inactive: {0}")]
    TenantInactive(String),

    /// A single bad frame. Logged and dropped, never fatal to the connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Storage call failed. No ack is sent for the frame that caused it.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Connection-level faults end the socket after one `error` envelope.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::TenantNotFound(_) | GatewayError::TenantInactive(_)
        )
    }

    /// Message shown to the client in the `error` envelope.
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::TenantNotFound(_) => "tenant not found",
            GatewayError::TenantInactive(_) => "tenant inactive",
            GatewayError::MalformedFrame(_) => "malformed frame",
            GatewayError::SessionNotFound(_) => "session not found",
            GatewayError::Persistence(_) => "internal error",
            GatewayError::Config(_) => "internal error",
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for GatewayError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        GatewayError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::MalformedFrame(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
