//! Port scanner coverage and accuracy

use async_trait::async_trait;
use mqtt_audit::config::AuditConfig;
use mqtt_audit::probes::{HostPortScan, Probe};
use mqtt_audit::scanner::{PortExclusions, PortProbe, PortScanner, WELL_KNOWN_BROKER_PORTS};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Records every attempt; reports the given ports as open
struct CountingProbe {
    attempts: Vec<AtomicU32>,
    open: Vec<u16>,
}

impl CountingProbe {
    fn new(open: Vec<u16>) -> Self {
        Self {
            attempts: (0..=u16::MAX as usize).map(|_| AtomicU32::new(0)).collect(),
            open,
        }
    }

    fn count(&self, port: u16) -> u32 {
        self.attempts[port as usize].load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProbe for CountingProbe {
    async fn is_open(&self, _target: IpAddr, port: u16) -> bool {
        self.attempts[port as usize].fetch_add(1, Ordering::SeqCst);
        self.open.contains(&port)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[tokio::test]
async fn test_every_port_attempted_exactly_once() {
    let probe = Arc::new(CountingProbe::new(vec![22, 65535]));
    let scanner = PortScanner::with_probe(probe.clone(), 1000);

    let open = scanner
        .scan_addr(IpAddr::V4(Ipv4Addr::LOCALHOST), &PortExclusions::none())
        .await
        .unwrap();

    assert_eq!(open.into_iter().collect::<Vec<_>>(), vec![22, 65535]);
    assert_eq!(probe.count(0), 0);
    assert!((1..=u16::MAX).all(|port| probe.count(port) == 1));
}

#[tokio::test]
async fn test_excluded_ports_never_attempted() {
    let probe = Arc::new(CountingProbe::new(vec![1883, 2222]));
    let scanner = PortScanner::with_probe(probe.clone(), 64);
    let exclusions = PortExclusions::none()
        .exclude_ports(WELL_KNOWN_BROKER_PORTS)
        .exclude_ranges([10_000..=20_000]);

    let open = scanner
        .scan_addr(IpAddr::V4(Ipv4Addr::LOCALHOST), &exclusions)
        .await
        .unwrap();

    assert_eq!(open.into_iter().collect::<Vec<_>>(), vec![2222]);
    for port in WELL_KNOWN_BROKER_PORTS {
        assert_eq!(probe.count(port), 0);
    }
    assert_eq!(probe.count(15_000), 0);
    assert_eq!(probe.count(9_999), 1);
}

#[tokio::test]
async fn test_single_open_port_found() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while listener.accept().await.is_ok() {}
    });

    let scanner = PortScanner::new(Duration::from_millis(500), 8).with_port_range(port..=port);
    let open = scanner.scan("127.0.0.1", &PortExclusions::none()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(open.contains(&port));
}

#[tokio::test]
async fn test_closed_port_not_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let scanner = PortScanner::new(Duration::from_millis(500), 8).with_port_range(port..=port);
    let open = scanner.scan("127.0.0.1", &PortExclusions::none()).await.unwrap();
    assert!(open.is_empty());
}

fn scan_config(extra_exclusions: Option<String>) -> AuditConfig {
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
    config.probe.scan_timeout_ms = 500;
    config.probe.scan_workers = 8;
    config.scan.extra_exclusions = extra_exclusions;
    config
}

#[tokio::test]
async fn test_host_port_scan_probe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while listener.accept().await.is_ok() {}
    });

    let probe = HostPortScan::with_port_range(port..=port);
    let result = probe.run(&scan_config(None)).await.unwrap();
    assert_eq!(result.name, "Host Port Scan");
    assert!(!result.pass);
    assert_eq!(result.messages, vec![format!("TCP port {} in host 127.0.0.1 is open", port)]);

    let excluded = probe.run(&scan_config(Some(port.to_string()))).await.unwrap();
    assert!(excluded.pass, "{:?}", excluded.messages);
}

#[tokio::test]
async fn test_host_port_scan_bad_exclusions_is_error() {
    let probe = HostPortScan::with_port_range(1..=1);
    let result = probe.run(&scan_config(Some("22-abc".to_string()))).await;
    assert!(result.is_err());
}
