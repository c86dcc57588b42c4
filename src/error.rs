//! Error handling for the audit engine
//!
//! Only infrastructure failures travel through [`AuditError`]. A broker that
//! fails to enforce a policy is reported as a failing
//! [`CheckResult`](crate::probes::CheckResult), never as an error.

use thiserror::Error;

/// Main error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Configuration error in `{field}`: {reason}")]
    Config { field: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unclassified result during {operation}: {detail}")]
    Unclassified { operation: String, detail: String },

    #[error("Probe [{probe}] aborted the run: {source}")]
    Probe {
        probe: String,
        #[source]
        source: Box<AuditError>,
    },

    #[error("Probe [{probe}] task failed: {reason}")]
    TaskFailed { probe: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Output error: {0}")]
    Output(String),
}

impl AuditError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AuditError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unclassified(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        AuditError::Unclassified {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Attribute this error to the probe that raised it
    pub fn in_probe(self, probe: &str) -> Self {
        match self {
            // already attributed
            e @ AuditError::Probe { .. } | e @ AuditError::TaskFailed { .. } => e,
            e => AuditError::Probe {
                probe: probe.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// Name of the probe the error is attributed to, if any
    pub fn probe_name(&self) -> Option<&str> {
        match self {
            AuditError::Probe { probe, .. } | AuditError::TaskFailed { probe, .. } => Some(probe),
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for AuditError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AuditError::Network("operation timed out".to_string())
    }
}

impl From<openssl::error::ErrorStack> for AuditError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        AuditError::Network(format!("OpenSSL setup failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_probe_attributes_once() {
        let err =
            AuditError::Network("connection refused".to_string()).in_probe("Client Authentication");
        assert_eq!(err.probe_name(), Some("Client Authentication"));

        let again = err.in_probe("Other");
        assert_eq!(again.probe_name(), Some("Client Authentication"));
    }

    #[test]
    fn test_config_error_names_field() {
        let err = AuditError::config(
            "limit.support_tls_versions",
            "unknown TLS version label `TLS9`",
        );
        let msg = err.to_string();
        assert!(msg.contains("limit.support_tls_versions"));
        assert!(msg.contains("TLS9"));
    }
}
