use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by gateway operations.
///
/// Variants map onto the failure classes callers act on: input problems
/// (`Config`, `Validation`), alias resolution, policy rejections, backend
/// reachability and remote gateway failures. `kind()` gives a stable code that
/// audit records keep instead of the (possibly verbose) message.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Validation(String),
    #[error("unknown database alias: {0}")]
    UnknownAlias(String),
    #[error("no database alias specified and no default is configured")]
    AliasRequired,
    #[error("database not allowed for this credential: {0}")]
    AliasNotGranted(String),
    #[error("invalid or unknown credential")]
    UnknownCredential,
    #[error("credential has no database assigned")]
    NoDatabaseAssigned,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("statement not allowed: {0}")]
    StatementNotAllowed(String),
    #[error("unsupported dialect for direct execution: {0}")]
    UnsupportedDialect(String),
    #[error("database operation failed: {0}")]
    ConnectionFailure(String),
    #[error("remote gateway returned {status}: {detail}")]
    Remote { status: u16, detail: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::ConnectionFailure(err.to_string())
    }

    /// Stable machine-readable code for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) | GatewayError::Validation(_) => "validation_error",
            GatewayError::UnknownAlias(_) => "unknown_alias",
            GatewayError::AliasRequired => "alias_required",
            GatewayError::AliasNotGranted(_) => "alias_not_granted",
            GatewayError::UnknownCredential => "unknown_credential",
            GatewayError::NoDatabaseAssigned => "no_database_assigned",
            GatewayError::PermissionDenied(_) => "permission_denied",
            GatewayError::StatementNotAllowed(_) => "statement_not_allowed",
            GatewayError::UnsupportedDialect(_) => "unsupported_dialect",
            GatewayError::ConnectionFailure(_) => "connection_failure",
            GatewayError::Remote { .. } => "remote_failure",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status an outer transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Config(_)
            | GatewayError::Validation(_)
            | GatewayError::UnknownAlias(_)
            | GatewayError::AliasRequired
            | GatewayError::AliasNotGranted(_)
            | GatewayError::NoDatabaseAssigned
            | GatewayError::UnsupportedDialect(_) => 400,
            GatewayError::UnknownCredential => 401,
            GatewayError::PermissionDenied(_) | GatewayError::StatementNotAllowed(_) => 403,
            GatewayError::Remote { status, .. } => *status,
            GatewayError::ConnectionFailure(_) | GatewayError::Internal(_) => 500,
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_rejections_map_to_forbidden() {
        let denied = GatewayError::PermissionDenied("DELETE requires full".into());
        let refused = GatewayError::StatementNotAllowed("DROP".into());
        assert_eq!(denied.status_code(), 403);
        assert_eq!(refused.status_code(), 403);
        assert_eq!(denied.kind(), "permission_denied");
    }

    #[test]
    fn remote_errors_keep_status_and_detail() {
        let err = GatewayError::Remote {
            status: 409,
            detail: "conflict upstream".into(),
        };
        assert_eq!(err.status_code(), 409);
        assert!(err.to_string().contains("conflict upstream"));
    }
}
