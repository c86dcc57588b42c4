//! Bounded-concurrency TCP connect scanner
//!
//! A fixed pool of workers pulls port numbers from one shared queue. Open
//! ports go into a mutex-guarded collection that is read only after every
//! worker has finished, so the result does not depend on scheduling order.

pub mod exclusions;

pub use exclusions::{PortExclusions, WELL_KNOWN_BROKER_PORTS};

use crate::error::AuditError;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Full 16-bit port space, port 0 excluded
pub const FULL_PORT_RANGE: RangeInclusive<u16> = 1..=65535;

/// Decides whether a single port is open
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, target: IpAddr, port: u16) -> bool;

    fn name(&self) -> &str;
}

/// TCP connect probe; closes the stream immediately on success
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortProbe for TcpConnectProbe {
    async fn is_open(&self, target: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(target, port);
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            // refused, unreachable or filtered
            Ok(Err(_)) | Err(_) => false,
        }
    }

    fn name(&self) -> &str {
        "TCP Connect"
    }
}

/// Worker-pool port scanner
#[derive(Clone)]
pub struct PortScanner {
    probe: Arc<dyn PortProbe>,
    workers: usize,
    ports: RangeInclusive<u16>,
}

impl PortScanner {
    /// TCP connect scanner with the given per-port timeout and pool size
    pub fn new(timeout: Duration, workers: usize) -> Self {
        Self::with_probe(Arc::new(TcpConnectProbe::new(timeout)), workers)
    }

    pub fn with_probe(probe: Arc<dyn PortProbe>, workers: usize) -> Self {
        Self {
            probe,
            workers: workers.max(1),
            ports: FULL_PORT_RANGE,
        }
    }

    /// Restrict the scanned range
    pub fn with_port_range(mut self, ports: RangeInclusive<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Resolve `host` once and scan it
    pub async fn scan(
        &self,
        host: &str,
        exclusions: &PortExclusions,
    ) -> crate::Result<BTreeSet<u16>> {
        let target = resolve_host(host).await?;
        self.scan_addr(target, exclusions).await
    }

    /// Scan every non-excluded port of the range on `target`
    pub async fn scan_addr(
        &self,
        target: IpAddr,
        exclusions: &PortExclusions,
    ) -> crate::Result<BTreeSet<u16>> {
        let start = Instant::now();
        let span = (*self.ports.end() as usize).saturating_sub(*self.ports.start() as usize) + 1;
        let workers = self.workers.min(span);

        log::info!(
            "Scanning {} ports {}-{} with {} workers ({})",
            target,
            self.ports.start(),
            self.ports.end(),
            workers,
            self.probe.name()
        );

        let (tx, rx) = mpsc::channel::<u16>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let open_ports = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let open_ports = open_ports.clone();
            let probe = self.probe.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(port) = next else { break };

                    if probe.is_open(target, port).await {
                        log::debug!("Open port {}:{}", target, port);
                        open_ports.lock().await.push(port);
                    }
                }
            }));
        }

        let mut skipped = 0usize;
        for port in self.ports.clone() {
            if exclusions.is_excluded(port) {
                skipped += 1;
                continue;
            }
            if tx.send(port).await.is_err() {
                break;
            }
        }
        drop(tx);

        for joined in join_all(handles).await {
            joined.map_err(|e| {
                AuditError::Network(format!("scan worker for {} failed: {}", target, e))
            })?;
        }

        let result: BTreeSet<u16> = open_ports.lock().await.iter().copied().collect();
        log::info!(
            "Scan of {} finished in {:.2}s: {} open, {} excluded",
            target,
            start.elapsed().as_secs_f64(),
            result.len(),
            skipped
        );

        Ok(result)
    }
}

async fn resolve_host(host: &str) -> crate::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| AuditError::Network(format!("failed to resolve host {}: {}", host, e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| AuditError::Network(format!("host {} resolved to no addresses", host)))
}
