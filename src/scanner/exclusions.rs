//! Port exclusion sets passed to the scanner at call time

use crate::config::BrokerTarget;
use crate::error::AuditError;
use std::collections::HashSet;
use std::ops::RangeInclusive;

/// Ports MQTT brokers commonly listen on
pub const WELL_KNOWN_BROKER_PORTS: [u16; 5] = [1883, 8883, 8083, 8084, 8443];

/// Immutable set of ports and ranges the scanner must skip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortExclusions {
    excluded_ports: HashSet<u16>,
    excluded_ranges: Vec<RangeInclusive<u16>>,
}

impl PortExclusions {
    /// No exclusions
    pub fn none() -> Self {
        Self::default()
    }

    /// The broker's configured ports plus the well-known MQTT ports
    pub fn for_broker(broker: &BrokerTarget) -> Self {
        Self::none()
            .exclude_ports(WELL_KNOWN_BROKER_PORTS)
            .exclude_ports(broker.ports())
    }

    /// Add individual ports
    pub fn exclude_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.excluded_ports.extend(ports);
        self
    }

    /// Add port ranges
    pub fn exclude_ranges(mut self, ranges: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        self.excluded_ranges.extend(ranges);
        self
    }

    /// Merge another set into this one
    pub fn merge(mut self, other: PortExclusions) -> Self {
        self.excluded_ports.extend(other.excluded_ports);
        self.excluded_ranges.extend(other.excluded_ranges);
        self
    }

    /// Parse an exclusion string such as "22,80,443,1000-2000"
    pub fn parse(exclusions: &str, field: &str) -> crate::Result<Self> {
        let mut set = Self::none();

        for part in exclusions.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some((start, end)) = part.split_once('-') {
                let start: u16 = start
                    .trim()
                    .parse()
                    .map_err(|_| {
                        AuditError::config(field, format!("invalid start port: {}", start))
                    })?;
                let end: u16 = end
                    .trim()
                    .parse()
                    .map_err(|_| AuditError::config(field, format!("invalid end port: {}", end)))?;

                if start > end {
                    return Err(AuditError::config(
                        field,
                        format!("invalid range: start ({}) > end ({})", start, end),
                    ));
                }

                set.excluded_ranges.push(start..=end);
            } else {
                let port: u16 = part
                    .parse()
                    .map_err(|_| {
                        AuditError::config(field, format!("invalid port number: {}", part))
                    })?;
                set.excluded_ports.insert(port);
            }
        }

        log::debug!(
            "Port exclusions parsed: {} individual ports, {} ranges",
            set.excluded_ports.len(),
            set.excluded_ranges.len()
        );

        Ok(set)
    }

    /// Check if a port should be skipped
    pub fn is_excluded(&self, port: u16) -> bool {
        self.excluded_ports.contains(&port)
            || self.excluded_ranges.iter().any(|r| r.contains(&port))
    }

    pub fn is_empty(&self) -> bool {
        self.excluded_ports.is_empty() && self.excluded_ranges.is_empty()
    }
}
