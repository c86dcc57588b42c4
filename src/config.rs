//! Configuration module for the audit engine

use crate::error::AuditError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete audit configuration, loaded once and shared read-only by every probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Broker under test
    pub broker: BrokerTarget,

    /// Auxiliary hosts to port-scan
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Thresholds the broker is expected to enforce
    pub limit: PolicyLimits,

    /// Operational tuning for the probes
    #[serde(default)]
    pub probe: ProbeSettings,

    /// Port scan options
    #[serde(default)]
    pub scan: ScanSettings,
}

/// Broker address, per-transport ports and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTarget {
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default = "default_mqtts_port")]
    pub mqtts_port: u16,

    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    #[serde(default = "default_wss_port")]
    pub wss_port: u16,

    /// Whether the TLS version matrix is part of the suite
    #[serde(default = "default_true")]
    pub tls: bool,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Topics the broker must refuse subscriptions to
    #[serde(default)]
    pub deny_topics: Vec<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtts_port() -> u16 {
    8883
}

fn default_ws_port() -> u16 {
    8083
}

fn default_wss_port() -> u16 {
    8084
}

fn default_true() -> bool {
    true
}

impl BrokerTarget {
    /// All ports the broker is expected to expose
    pub fn ports(&self) -> [u16; 4] {
        [self.mqtt_port, self.mqtts_port, self.ws_port, self.wss_port]
    }
}

/// Limits the broker is expected to enforce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLimits {
    pub client_id_len: usize,
    pub username_len: usize,
    pub password_len: usize,
    pub topic_level: usize,
    pub topic_len: usize,
    pub payload_len: usize,
    /// Maximum concurrent connections
    pub connection: usize,
    /// Connect/disconnect cycles tolerated before blacklisting
    pub flapping: usize,
    #[serde(default)]
    pub support_tls_versions: Vec<TlsVersionSpec>,
    #[serde(default)]
    pub unsupported_tls_versions: Vec<TlsVersionSpec>,
}

/// A TLS version as written in the configuration: wire code or label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlsVersionSpec {
    Code(u16),
    Label(String),
}

/// Protocol versions the TLS matrix can probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Ssl3,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub const ALL: [TlsVersion; 5] = [
        TlsVersion::Ssl3,
        TlsVersion::Tls10,
        TlsVersion::Tls11,
        TlsVersion::Tls12,
        TlsVersion::Tls13,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "SSL3.0",
            TlsVersion::Tls10 => "TLS1.0",
            TlsVersion::Tls11 => "TLS1.1",
            TlsVersion::Tls12 => "TLS1.2",
            TlsVersion::Tls13 => "TLS1.3",
        }
    }

    /// Wire code as used in the ClientHello (0x0300..=0x0304)
    pub fn code(&self) -> u16 {
        match self {
            TlsVersion::Ssl3 => 768,
            TlsVersion::Tls10 => 769,
            TlsVersion::Tls11 => 770,
            TlsVersion::Tls12 => 771,
            TlsVersion::Tls13 => 772,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.code() == code)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != 'v' && *c != 'V')
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "SSL3.0" | "SSL3" => Some(TlsVersion::Ssl3),
            "TLS1.0" | "TLS1" => Some(TlsVersion::Tls10),
            "TLS1.1" => Some(TlsVersion::Tls11),
            "TLS1.2" => Some(TlsVersion::Tls12),
            "TLS1.3" => Some(TlsVersion::Tls13),
            other => other.parse::<u16>().ok().and_then(Self::from_code),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TlsVersionSpec {
    /// Resolve to a known version; `field` names the config entry on failure
    pub fn resolve(&self, field: &str) -> crate::Result<TlsVersion> {
        match self {
            TlsVersionSpec::Code(code) => TlsVersion::from_code(*code).ok_or_else(|| {
                AuditError::config(field, format!("unknown TLS version code {}", code))
            }),
            TlsVersionSpec::Label(label) => TlsVersion::from_label(label).ok_or_else(|| {
                AuditError::config(field, format!("unknown TLS version label `{}`", label))
            }),
        }
    }
}

impl From<TlsVersion> for TlsVersionSpec {
    fn from(version: TlsVersion) -> Self {
        TlsVersionSpec::Label(version.label().to_string())
    }
}

/// Timeouts, pool sizes and how far past each limit the probes go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Bound on each connect/publish/subscribe acknowledgement, in milliseconds
    pub op_timeout_ms: u64,
    /// Bound on each port-scan connect attempt, in milliseconds
    pub scan_timeout_ms: u64,
    /// Port scan worker pool size
    pub scan_workers: usize,
    /// Pause between flapping cycles, in milliseconds
    pub flapping_interval_ms: u64,
    /// Pause between opening background connections, in milliseconds
    pub connection_interval_ms: u64,
    pub client_id_overshoot: usize,
    pub username_overshoot: usize,
    pub password_overshoot: usize,
    pub flapping_overshoot: usize,
    pub connection_overshoot: usize,
    pub topic_level_overshoot: usize,
    pub topic_len_overshoot: usize,
    pub payload_overshoot: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            op_timeout_ms: 3000,
            scan_timeout_ms: 1000,
            scan_workers: 1000,
            flapping_interval_ms: 10,
            connection_interval_ms: 10,
            client_id_overshoot: 1000,
            username_overshoot: 10,
            password_overshoot: 10,
            flapping_overshoot: 10,
            connection_overshoot: 500,
            topic_level_overshoot: 5,
            topic_len_overshoot: 10,
            payload_overshoot: 1,
        }
    }
}

impl ProbeSettings {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn flapping_interval(&self) -> Duration {
        Duration::from_millis(self.flapping_interval_ms)
    }

    pub fn connection_interval(&self) -> Duration {
        Duration::from_millis(self.connection_interval_ms)
    }
}

/// Longest string an MQTT packet can carry behind its two-byte length prefix
pub const MAX_MQTT_STRING_LEN: usize = u16::MAX as usize;

/// `limit + overshoot`, refused when the result cannot be encoded as an MQTT string
fn encodable_len(field: &str, limit: usize, overshoot: usize) -> crate::Result<usize> {
    limit
        .checked_add(overshoot)
        .filter(|length| *length <= MAX_MQTT_STRING_LEN)
        .ok_or_else(|| {
            AuditError::config(
                field,
                format!(
                    "limit {} plus overshoot {} exceeds the MQTT string maximum of {} bytes",
                    limit, overshoot, MAX_MQTT_STRING_LEN
                ),
            )
        })
}

/// Port scan options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Additional ports to skip on the broker host, e.g. "22,8000-8100"
    pub extra_exclusions: Option<String>,
}

impl AuditConfig {
    /// Load configuration from a JSON or TOML file, chosen by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AuditError::config("config", format!("failed to read {}: {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            _ => Self::from_json_str(&content)?,
        };

        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(AuditError::config("broker.host", "host cannot be empty"));
        }

        for (field, port) in [
            ("broker.mqtt_port", self.broker.mqtt_port),
            ("broker.mqtts_port", self.broker.mqtts_port),
            ("broker.ws_port", self.broker.ws_port),
            ("broker.wss_port", self.broker.wss_port),
        ] {
            if port == 0 {
                return Err(AuditError::config(field, "port must be greater than 0"));
            }
        }

        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(AuditError::config("hosts", "host entries cannot be empty"));
        }

        if self.probe.scan_workers == 0 {
            return Err(AuditError::config(
                "probe.scan_workers",
                "worker count must be greater than 0",
            ));
        }

        if self.probe.op_timeout_ms == 0 || self.probe.scan_timeout_ms == 0 {
            return Err(AuditError::config("probe", "timeouts must be greater than 0"));
        }

        self.client_id_probe_len()?;
        self.username_probe_len()?;
        self.password_probe_len()?;
        self.topic_probe_len()?;
        self.topic_level_probe_count()?;

        self.supported_tls_versions()?;
        self.unsupported_tls_versions()?;

        Ok(())
    }

    /// Length of the over-long client id
    pub fn client_id_probe_len(&self) -> crate::Result<usize> {
        encodable_len(
            "limit.client_id_len",
            self.limit.client_id_len,
            self.probe.client_id_overshoot,
        )
    }

    pub fn username_probe_len(&self) -> crate::Result<usize> {
        encodable_len("limit.username_len", self.limit.username_len, self.probe.username_overshoot)
    }

    pub fn password_probe_len(&self) -> crate::Result<usize> {
        encodable_len("limit.password_len", self.limit.password_len, self.probe.password_overshoot)
    }

    /// Length of the over-long single-level topic filter
    pub fn topic_probe_len(&self) -> crate::Result<usize> {
        encodable_len("limit.topic_len", self.limit.topic_len, self.probe.topic_len_overshoot)
    }

    /// Level count of the over-deep topic; five characters per level plus separators
    pub fn topic_level_probe_count(&self) -> crate::Result<usize> {
        let levels = encodable_len(
            "limit.topic_level",
            self.limit.topic_level,
            self.probe.topic_level_overshoot,
        )?;
        encodable_len("limit.topic_level", levels.saturating_mul(6).saturating_sub(1), 0)?;
        Ok(levels)
    }

    pub fn supported_tls_versions(&self) -> crate::Result<Vec<TlsVersion>> {
        self.limit
            .support_tls_versions
            .iter()
            .map(|spec| spec.resolve("limit.support_tls_versions"))
            .collect()
    }

    pub fn unsupported_tls_versions(&self) -> crate::Result<Vec<TlsVersion>> {
        self.limit
            .unsupported_tls_versions
            .iter()
            .map(|spec| spec.resolve("limit.unsupported_tls_versions"))
            .collect()
    }
}
