//! Security probes
//!
//! Each probe performs one independent check against the broker and returns
//! exactly one [`CheckResult`]. A broker that does not enforce a policy gives
//! a failing result; only infrastructure failures come back as `Err`.

pub mod client;
pub mod message;
pub mod port_scan;
pub mod transport;

pub use client::{
    ClientAuthentication, ClientIdLength, ConnectionCeiling, CredentialField, CredentialLength,
    Flapping,
};
pub use message::{DenyTopic, PayloadLength, TopicLength, TopicLevel};
pub use port_scan::HostPortScan;
pub use transport::{InvalidProtocol, TlsVersionMatrix};

use crate::client::{ClientIdentity, ConnectionFactory, Credentials, Session, Transport};
use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::outcome::{Outcome, RawAttempt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Verdict of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub pass: bool,
    pub messages: Vec<String>,
}

impl CheckResult {
    /// A passing result with no messages; any [`fail`](Self::fail) flips it
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pass: true,
            messages: Vec::new(),
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::new(name);
        result.fail(message);
        result
    }

    /// Record a policy violation
    pub fn fail(&mut self, message: impl Into<String>) {
        self.pass = false;
        self.messages.push(message.into());
    }
}

/// One security check
#[async_trait]
pub trait Probe: Send + Sync {
    /// Name used in the report
    fn name(&self) -> &'static str;

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult>;
}

/// Every probe that may run concurrently, in report order
///
/// The connection ceiling probe is not part of the suite; see
/// [`ceiling_probe`].
pub fn default_suite(config: &AuditConfig) -> Vec<Arc<dyn Probe>> {
    let mut suite: Vec<Arc<dyn Probe>> = vec![
        Arc::new(InvalidProtocol::mqtt()),
        Arc::new(InvalidProtocol::websocket()),
        Arc::new(ClientAuthentication),
        Arc::new(CredentialLength::new(CredentialField::Username)),
        Arc::new(CredentialLength::new(CredentialField::Password)),
        Arc::new(ClientIdLength),
        Arc::new(Flapping),
        Arc::new(DenyTopic),
        Arc::new(TopicLevel),
        Arc::new(TopicLength),
        Arc::new(PayloadLength),
        Arc::new(HostPortScan::default()),
    ];

    if config.broker.tls {
        suite.push(Arc::new(TlsVersionMatrix));
    }

    suite
}

/// The probe that saturates the broker's connection capacity
pub fn ceiling_probe() -> Arc<dyn Probe> {
    Arc::new(ConnectionCeiling)
}

/// Classify an attempt, turning an unrecognised result into an error
pub(crate) fn classify_known(
    probe: &str,
    operation: &str,
    attempt: &RawAttempt,
) -> crate::Result<Outcome> {
    match attempt.classify() {
        Outcome::Unknown => Err(AuditError::unclassified(
            format!("{} ({})", operation, probe),
            attempt.describe(),
        )),
        outcome => {
            log::debug!("[{}] {}: {}", probe, operation, outcome);
            Ok(outcome)
        }
    }
}

/// Connect a tagged client with the broker's credentials for a probe that
/// needs a working session; a refused connect is reported as a message
pub(crate) async fn open_session(config: &AuditConfig, tag: &str) -> Result<Session, String> {
    let factory = ConnectionFactory::new(&config.broker);
    let handle = factory.new_client(
        Transport::Tcp,
        ClientIdentity::Tagged(tag.to_string()),
        Credentials::from_broker(&config.broker),
    );

    let outcome = handle.connect(config.probe.op_timeout()).await;
    outcome
        .session
        .ok_or_else(|| format!("connect failed: {}", outcome.attempt.describe()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: bool) -> AuditConfig {
        let mut config = AuditConfig::from_json_str(
            r#"{
                "broker": {"host": "127.0.0.1"},
                "limit": {
                    "client_id_len": 23, "username_len": 16, "password_len": 16,
                    "topic_level": 4, "topic_len": 64, "payload_len": 128,
                    "connection": 10, "flapping": 3
                }
            }"#,
        )
        .unwrap();
        config.broker.tls = tls;
        config
    }

    #[test]
    fn test_check_result_fail_flips_pass() {
        let mut result = CheckResult::new("MQTT Topic Level");
        assert!(result.pass);
        result.fail("publish accepted");
        result.fail("second");
        assert!(!result.pass);
        assert_eq!(result.messages, vec!["publish accepted", "second"]);
    }

    #[test]
    fn test_suite_tls_gating_and_unique_names() {
        let with_tls = default_suite(&config(true));
        let without_tls = default_suite(&config(false));
        assert_eq!(with_tls.len(), without_tls.len() + 1);
        assert!(with_tls.iter().any(|p| p.name() == "TLS Version"));
        assert!(!without_tls.iter().any(|p| p.name() == "TLS Version"));

        let mut names: Vec<_> = with_tls.iter().map(|p| p.name()).collect();
        names.push(ceiling_probe().name());
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(!with_tls.iter().any(|p| p.name() == "MQTT Client Connection"));
    }

    #[test]
    fn test_unknown_outcome_is_error() {
        let refused = RawAttempt::transport(crate::outcome::TransportFailure::Refused);
        let err = classify_known("Client Authentication", "connect", &refused).unwrap_err();
        assert!(matches!(err, AuditError::Unclassified { .. }));

        let ok =
            classify_known("Client Authentication", "connect", &RawAttempt::accepted()).unwrap();
        assert_eq!(ok, Outcome::Accepted);
    }
}
