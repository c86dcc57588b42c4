//! Transport hygiene probes: non-MQTT traffic and the TLS version matrix

use super::{classify_known, CheckResult, Probe};
use crate::client::Transport;
use crate::config::{AuditConfig, TlsVersion};
use crate::error::AuditError;
use crate::outcome::{classify_handshake, HandshakeOutcome, Outcome, RawAttempt, TransportFailure};
use async_trait::async_trait;
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use std::io;
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const NON_MQTT_PAYLOAD: &[u8] = b"Non-MQTT message";

/// A listener must close the connection on bytes that are not MQTT
pub struct InvalidProtocol {
    name: &'static str,
    transport: Transport,
}

impl InvalidProtocol {
    /// Plaintext MQTT listener
    pub fn mqtt() -> Self {
        Self {
            name: "Invalid MQTT Message",
            transport: Transport::Tcp,
        }
    }

    /// MQTT over websocket listener
    pub fn websocket() -> Self {
        Self {
            name: "Invalid Websocket Protocol",
            transport: Transport::Ws,
        }
    }

    fn port(&self, config: &AuditConfig) -> u16 {
        match self.transport {
            Transport::Tcp => config.broker.mqtt_port,
            Transport::Ws => config.broker.ws_port,
        }
    }
}

/// Write garbage, then see how the peer reacts to it
async fn send_garbage(addr: &str, wait: Duration) -> crate::Result<(RawAttempt, usize)> {
    let mut stream = timeout(wait, TcpStream::connect(addr))
        .await
        .map_err(|_| AuditError::Network(format!("connect to {} timed out", addr)))?
        .map_err(|e| AuditError::Network(format!("failed to connect to {}: {}", addr, e)))?;

    if let Err(e) = stream.write_all(NON_MQTT_PAYLOAD).await {
        return Ok((RawAttempt::transport(TransportFailure::from_io(&e)), 0));
    }

    let mut response = [0u8; 1024];
    let attempt = match timeout(wait, stream.read(&mut response)).await {
        Err(_) => (RawAttempt::timed_out(), 0),
        Ok(Ok(0)) => (RawAttempt::transport(TransportFailure::Eof), 0),
        Ok(Ok(n)) => (RawAttempt::accepted(), n),
        Ok(Err(e)) => (RawAttempt::transport(TransportFailure::from_io(&e)), 0),
    };
    Ok(attempt)
}

#[async_trait]
impl Probe for InvalidProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let port = self.port(config);
        let addr = format!("{}:{}", config.broker.host, port);
        let wait = config.probe.op_timeout();

        let (attempt, replied) = send_garbage(&addr, wait).await?;
        let mut result = CheckResult::new(self.name());

        match classify_known(self.name(), "non-MQTT exchange", &attempt)? {
            Outcome::TransportClosed => {}
            Outcome::Accepted => result.fail(format!(
                "port {} answered non-MQTT data with {} bytes instead of closing",
                port, replied
            )),
            Outcome::TimedOut => result.fail(format!(
                "port {} kept the connection open for {:?} after non-MQTT data",
                port, wait
            )),
            other => result.fail(format!("port {} accepted non-MQTT data: {}", port, other)),
        }

        Ok(result)
    }
}

/// Expected-supported TLS versions must negotiate and expected-unsupported
/// ones must be refused
pub struct TlsVersionMatrix;

#[async_trait]
impl Probe for TlsVersionMatrix {
    fn name(&self) -> &'static str {
        "TLS Version"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let supported = config.supported_tls_versions()?;
        let unsupported = config.unsupported_tls_versions()?;
        let host = &config.broker.host;
        let port = config.broker.mqtts_port;
        let wait = config.probe.op_timeout();

        let mut result = CheckResult::new(self.name());

        for version in supported {
            match handshake(host, port, version, wait).await? {
                HandshakeOutcome::VersionRejected => {
                    result.fail(format!("TLS version {} is not supported", version))
                }
                HandshakeOutcome::TimedOut => {
                    result.fail(format!("{} handshake timed out after {:?}", version, wait))
                }
                _ => {}
            }
        }

        for version in unsupported {
            match handshake(host, port, version, wait).await? {
                HandshakeOutcome::Established => {
                    result.fail(format!("unsafe TLS version {} is supported", version))
                }
                HandshakeOutcome::TimedOut => {
                    result.fail(format!("{} handshake timed out after {:?}", version, wait))
                }
                _ => {}
            }
        }

        Ok(result)
    }
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Ssl3 => SslVersion::SSL3,
        TlsVersion::Tls10 => SslVersion::TLS1,
        TlsVersion::Tls11 => SslVersion::TLS1_1,
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

/// One handshake pinned to `version`; never returns `Unknown`, that becomes an error
pub async fn handshake(
    host: &str,
    port: u16,
    version: TlsVersion,
    wait: Duration,
) -> crate::Result<HandshakeOutcome> {
    let host = host.to_string();
    let operation = format!("{} handshake with {}:{}", version, host, port);

    let (outcome, detail) =
        tokio::task::spawn_blocking(move || handshake_blocking(&host, port, version, wait))
            .await
        .map_err(|e| AuditError::TaskFailed {
            probe: "TLS Version".to_string(),
            reason: e.to_string(),
        })??;

    log::debug!("{}: {:?}", operation, outcome);
    match outcome {
        HandshakeOutcome::Unknown => {
            Err(AuditError::unclassified(operation, detail.unwrap_or_default()))
        }
        outcome => Ok(outcome),
    }
}

fn handshake_blocking(
    host: &str,
    port: u16,
    version: TlsVersion,
    wait: Duration,
) -> crate::Result<(HandshakeOutcome, Option<String>)> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| AuditError::Network(format!("failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| AuditError::Network(format!("{} resolved to no addresses", host)))?;

    let stream = StdTcpStream::connect_timeout(&addr, wait)
        .map_err(|e| AuditError::Network(format!("failed to connect to {}: {}", addr, e)))?;
    stream.set_read_timeout(Some(wait))?;
    stream.set_write_timeout(Some(wait))?;

    let protocol = ssl_version(version);
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    // legacy protocol versions need the legacy cipher suites
    builder.set_cipher_list("ALL:@SECLEVEL=0")?;
    if builder.set_min_proto_version(Some(protocol)).is_err()
        || builder.set_max_proto_version(Some(protocol)).is_err()
    {
        // the local library cannot even offer this version
        return Ok((HandshakeOutcome::VersionRejected, None));
    }

    let mut connect = builder.build().configure()?;
    connect.set_verify_hostname(false);
    connect.set_use_server_name_indication(false);

    match connect.connect(host, stream) {
        Ok(mut tls) => {
            let _ = tls.shutdown();
            Ok((classify_handshake(false, None), None))
        }
        Err(HandshakeError::WouldBlock(_)) => Ok((classify_handshake(true, None), None)),
        Err(HandshakeError::Failure(mid)) => {
            let timed_out = mid
                .error()
                .io_error()
                .map(|e| matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
                .unwrap_or(false);
            let text = mid.error().to_string();
            Ok((classify_handshake(timed_out, Some(&text)), Some(text)))
        }
        Err(HandshakeError::SetupFailure(stack)) => Err(stack.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_garbage_closed_by_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let (attempt, replied) = send_garbage(&addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(attempt.classify(), Outcome::TransportClosed);
        assert_eq!(replied, 0);
    }

    #[tokio::test]
    async fn test_garbage_echoed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (attempt, replied) = send_garbage(&addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(attempt.classify(), Outcome::Accepted);
        assert_eq!(replied, NON_MQTT_PAYLOAD.len());
    }

    #[tokio::test]
    async fn test_nothing_listening_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = send_garbage(&addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AuditError::Network(_))));
    }
}
