//! Outcome classification
//!
//! Protocol clients and TLS stacks report rejections as a mix of structured
//! codes, I/O error kinds and free text. Everything is funnelled through the
//! two pure functions here so probes can state their verdicts as
//! "expect `RejectedIdentifier`" and the broker vocabulary lives in one table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Normalized interpretation of a single connection/protocol attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    RejectedAuth,
    RejectedIdentifier,
    RejectedLimit,
    TimedOut,
    TransportClosed,
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Accepted => "accepted",
            Outcome::RejectedAuth => "rejected (authorization)",
            Outcome::RejectedIdentifier => "rejected (identifier)",
            Outcome::RejectedLimit => "rejected (resource limit)",
            Outcome::TimedOut => "timed out",
            Outcome::TransportClosed => "connection closed by peer",
            Outcome::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Transport-level failure observed during an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// Peer closed the stream (FIN / zero-length read)
    Eof,
    /// Peer reset or aborted the stream
    Reset,
    /// Nothing listening at the target
    Refused,
    /// Anything else, including name resolution failures
    Other(String),
}

impl TransportFailure {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => {
                TransportFailure::Eof
            }
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => TransportFailure::Reset,
            io::ErrorKind::ConnectionRefused => TransportFailure::Refused,
            _ => TransportFailure::Other(err.to_string()),
        }
    }
}

/// Structured rejection codes, mirroring MQTT CONNACK/SUBACK semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    UnsupportedProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    SubscriptionRefused,
    PacketTooLarge,
}

/// Protocol-level rejection, structured when the client exposes a code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Code(ReasonCode),
    Text(String),
}

/// Raw result of one network/protocol attempt, before interpretation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAttempt {
    pub timed_out: bool,
    pub transport: Option<TransportFailure>,
    pub rejection: Option<Rejection>,
}

impl RawAttempt {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn transport(failure: TransportFailure) -> Self {
        Self {
            transport: Some(failure),
            ..Self::default()
        }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        Self {
            rejection: Some(rejection),
            ..Self::default()
        }
    }

    pub fn classify(&self) -> Outcome {
        classify(self)
    }

    /// Human-readable description for diagnostics and error messages
    pub fn describe(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        match (&self.rejection, &self.transport) {
            (Some(Rejection::Code(code)), _) => format!("rejected with {:?}", code),
            (Some(Rejection::Text(text)), _) => format!("rejected: {}", text),
            (None, Some(TransportFailure::Eof)) => "connection closed by peer".to_string(),
            (None, Some(TransportFailure::Reset)) => "connection reset by peer".to_string(),
            (None, Some(TransportFailure::Refused)) => "connection refused".to_string(),
            (None, Some(TransportFailure::Other(detail))) => detail.clone(),
            (None, None) => "accepted".to_string(),
        }
    }
}

/// Rejection phrases seen in broker and client error text, lowercase
const REJECTION_VOCABULARY: &[(&str, Outcome)] = &[
    ("identifier rejected", Outcome::RejectedIdentifier),
    ("client identifier not valid", Outcome::RejectedIdentifier),
    ("bad client id", Outcome::RejectedIdentifier),
    ("badclientid", Outcome::RejectedIdentifier),
    ("not authorized", Outcome::RejectedAuth),
    ("notauthorized", Outcome::RejectedAuth),
    ("bad user name or password", Outcome::RejectedAuth),
    ("badusernamepassword", Outcome::RejectedAuth),
    ("banned", Outcome::RejectedAuth),
    ("server unavailable", Outcome::RejectedLimit),
    ("serviceunavailable", Outcome::RejectedLimit),
    ("server busy", Outcome::RejectedLimit),
    ("quota exceeded", Outcome::RejectedLimit),
    ("packet too large", Outcome::RejectedLimit),
];

fn classify_code(code: ReasonCode) -> Outcome {
    match code {
        ReasonCode::IdentifierRejected => Outcome::RejectedIdentifier,
        ReasonCode::BadCredentials
        | ReasonCode::NotAuthorized
        | ReasonCode::SubscriptionRefused => Outcome::RejectedAuth,
        ReasonCode::ServerUnavailable | ReasonCode::PacketTooLarge => Outcome::RejectedLimit,
        ReasonCode::UnsupportedProtocolVersion => Outcome::Unknown,
    }
}

fn classify_text(text: &str) -> Outcome {
    let lowered = text.to_lowercase();
    REJECTION_VOCABULARY
        .iter()
        .find(|(phrase, _)| lowered.contains(phrase))
        .map(|(_, outcome)| *outcome)
        .unwrap_or(Outcome::Unknown)
}

/// Map a raw attempt to its semantic outcome
pub fn classify(attempt: &RawAttempt) -> Outcome {
    if attempt.timed_out {
        return Outcome::TimedOut;
    }

    match &attempt.rejection {
        Some(Rejection::Code(code)) => return classify_code(*code),
        Some(Rejection::Text(text)) => return classify_text(text),
        None => {}
    }

    match &attempt.transport {
        None => Outcome::Accepted,
        Some(TransportFailure::Eof) | Some(TransportFailure::Reset) => Outcome::TransportClosed,
        Some(TransportFailure::Other(text)) => classify_text(text),
        Some(TransportFailure::Refused) => Outcome::Unknown,
    }
}

/// Result of a TLS handshake pinned to a single protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeOutcome {
    Established,
    VersionRejected,
    TimedOut,
    Unknown,
}

/// Failure text that means "this protocol version is not negotiable"
const VERSION_MISMATCH_VOCABULARY: &[&str] = &[
    "unsupported protocol",
    "unsupported_protocol",
    "wrong version number",
    "protocol version",
    "no protocols available",
    "version too low",
    "version too high",
    "no supported versions",
    "tlsv1 alert protocol version",
    "inappropriate fallback",
];

/// Classify a TLS handshake failure; `None` means the handshake completed
pub fn classify_handshake(timed_out: bool, failure: Option<&str>) -> HandshakeOutcome {
    if timed_out {
        return HandshakeOutcome::TimedOut;
    }
    match failure {
        None => HandshakeOutcome::Established,
        Some(text) => {
            let lowered = text.to_lowercase();
            if VERSION_MISMATCH_VOCABULARY.iter().any(|phrase| lowered.contains(phrase)) {
                HandshakeOutcome::VersionRejected
            } else {
                HandshakeOutcome::Unknown
            }
        }
    }
}
