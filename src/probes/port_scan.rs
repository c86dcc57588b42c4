//! Exposure check: no TCP port besides the broker listeners may be open

use super::{CheckResult, Probe};
use crate::config::AuditConfig;
use crate::scanner::{PortExclusions, PortScanner, FULL_PORT_RANGE};
use async_trait::async_trait;
use std::ops::RangeInclusive;

/// Scans the broker host (minus its MQTT listeners) and every auxiliary host
pub struct HostPortScan {
    ports: RangeInclusive<u16>,
}

impl Default for HostPortScan {
    fn default() -> Self {
        Self { ports: FULL_PORT_RANGE }
    }
}

impl HostPortScan {
    pub fn with_port_range(ports: RangeInclusive<u16>) -> Self {
        Self { ports }
    }

    fn broker_exclusions(config: &AuditConfig) -> crate::Result<PortExclusions> {
        let exclusions = PortExclusions::for_broker(&config.broker);
        match &config.scan.extra_exclusions {
            Some(extra) => {
                Ok(exclusions.merge(PortExclusions::parse(extra, "scan.extra_exclusions")?))
            }
            None => Ok(exclusions),
        }
    }
}

#[async_trait]
impl Probe for HostPortScan {
    fn name(&self) -> &'static str {
        "Host Port Scan"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let scanner = PortScanner::new(config.probe.scan_timeout(), config.probe.scan_workers)
            .with_port_range(self.ports.clone());

        let mut targets = vec![(config.broker.host.as_str(), Self::broker_exclusions(config)?)];
        targets.extend(config.hosts.iter().map(|host| (host.as_str(), PortExclusions::none())));

        let mut result = CheckResult::new(self.name());
        for (host, exclusions) in targets {
            for port in scanner.scan(host, &exclusions).await? {
                result.fail(format!("TCP port {} in host {} is open", port, host));
            }
        }

        Ok(result)
    }
}
