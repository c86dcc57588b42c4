//! mqtt-audit - active security auditing for MQTT broker deployments
//!
//! Probes a broker over the network and reports, per policy, whether it is
//! enforced: authentication, identifier and credential limits, flapping
//! bans, connection ceilings, topic and payload limits, protocol hygiene,
//! TLS versions and unexpected open ports.

pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod output;
pub mod probes;
pub mod scanner;
pub mod utils;

// Re-export commonly used types
pub use config::{AuditConfig, BrokerTarget, PolicyLimits, TlsVersion};
pub use error::AuditError;
pub use orchestrator::{AuditReport, Orchestrator};
pub use outcome::{classify, classify_handshake, Outcome, RawAttempt};
pub use probes::{CheckResult, Probe};
pub use scanner::{PortExclusions, PortScanner};

pub type Result<T> = std::result::Result<T, AuditError>;
