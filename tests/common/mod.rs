//! Loopback fixtures shared by the integration tests: an MQTT 3.1.1 broker
//! with configurable enforcement, plus config builders

#![allow(dead_code)]

use mqtt_audit::AuditConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNACK_ACCEPTED: u8 = 0x00;
const CONNACK_IDENTIFIER_REJECTED: u8 = 0x02;
const CONNACK_SERVER_UNAVAILABLE: u8 = 0x03;
const CONNACK_BAD_CREDENTIALS: u8 = 0x04;
const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

/// What the fake broker enforces; `None` means unlimited
#[derive(Debug, Clone, Default)]
pub struct BrokerPolicy {
    pub credentials: Option<(String, String)>,
    pub max_client_id_len: Option<usize>,
    /// Exceeding either closes the socket without a CONNACK
    pub max_username_len: Option<usize>,
    pub max_password_len: Option<usize>,
    /// Connects per client id before that id is refused
    pub flapping_limit: Option<usize>,
    pub max_connections: Option<usize>,
    pub deny_topics: Vec<String>,
    /// Exceeding closes the socket
    pub max_topic_levels: Option<usize>,
    pub max_topic_len: Option<usize>,
    pub max_payload: Option<usize>,
}

impl BrokerPolicy {
    /// A broker that enforces everything the audit checks
    pub fn strict() -> Self {
        Self {
            credentials: Some(("admin".to_string(), "public".to_string())),
            max_client_id_len: Some(64),
            max_username_len: Some(16),
            max_password_len: Some(16),
            flapping_limit: Some(5),
            max_connections: Some(20),
            deny_topics: vec!["$SYS/#".to_string(), "secret/#".to_string()],
            max_topic_levels: Some(4),
            max_topic_len: Some(64),
            max_payload: Some(128),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    connects: HashMap<String, usize>,
    active: usize,
}

/// Running fake broker; stops when the test runtime shuts down
pub struct FakeBroker {
    pub addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub async fn start(policy: BrokerPolicy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let policy = Arc::new(policy);

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = accept_state.clone();
                let policy = policy.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, policy, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn active_connections(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn connects_for(&self, client_id: &str) -> usize {
        self.state.lock().unwrap().connects.get(client_id).copied().unwrap_or(0)
    }
}

struct Connect {
    client_id: String,
    username: Option<String>,
    password: Option<String>,
}

async fn read_remaining_length(socket: &mut TcpStream) -> std::io::Result<usize> {
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = socket.read_u8().await?;
        length |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(length);
        }
        shift += 7;
        if shift > 21 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed remaining length",
            ));
        }
    }
}

fn take_u16(body: &[u8], pos: &mut usize) -> Option<u16> {
    let bytes = body.get(*pos..*pos + 2)?;
    *pos += 2;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_string(body: &[u8], pos: &mut usize) -> Option<String> {
    let len = take_u16(body, pos)? as usize;
    let bytes = body.get(*pos..*pos + len)?;
    *pos += len;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn parse_connect(body: &[u8]) -> Option<Connect> {
    let mut pos = 0;
    let _protocol = take_string(body, &mut pos)?;
    let _level = *body.get(pos)?;
    let flags = *body.get(pos + 1)?;
    pos += 2;
    let _keep_alive = take_u16(body, &mut pos)?;
    let client_id = take_string(body, &mut pos)?;

    if flags & 0x04 != 0 {
        take_string(body, &mut pos)?;
        take_string(body, &mut pos)?;
    }
    let username = if flags & 0x80 != 0 { Some(take_string(body, &mut pos)?) } else { None };
    let password = if flags & 0x40 != 0 { Some(take_string(body, &mut pos)?) } else { None };

    Some(Connect {
        client_id,
        username,
        password,
    })
}

enum Admission {
    Accept,
    Refuse(u8),
    Drop,
}

fn admit(connect: &Connect, policy: &BrokerPolicy, state: &Mutex<BrokerState>) -> Admission {
    if policy.max_client_id_len.map_or(false, |max| connect.client_id.len() > max) {
        return Admission::Refuse(CONNACK_IDENTIFIER_REJECTED);
    }

    let username_len = connect.username.as_ref().map_or(0, |u| u.len());
    let password_len = connect.password.as_ref().map_or(0, |p| p.len());
    if policy.max_username_len.map_or(false, |max| username_len > max)
        || policy.max_password_len.map_or(false, |max| password_len > max)
    {
        return Admission::Drop;
    }

    if let Some((username, password)) = &policy.credentials {
        match (&connect.username, &connect.password) {
            (Some(u), Some(p)) if u == username && p == password => {}
            (None, _) => return Admission::Refuse(CONNACK_NOT_AUTHORIZED),
            _ => return Admission::Refuse(CONNACK_BAD_CREDENTIALS),
        }
    }

    let mut state = state.lock().unwrap();
    let seen = state.connects.entry(connect.client_id.clone()).or_insert(0);
    *seen += 1;
    if policy.flapping_limit.map_or(false, |limit| *seen > limit) {
        return Admission::Refuse(CONNACK_NOT_AUTHORIZED);
    }

    if policy.max_connections.map_or(false, |max| state.active >= max) {
        return Admission::Refuse(CONNACK_SERVER_UNAVAILABLE);
    }

    state.active += 1;
    Admission::Accept
}

async fn serve(
    mut socket: TcpStream,
    policy: Arc<BrokerPolicy>,
    state: Arc<Mutex<BrokerState>>,
) -> std::io::Result<()> {
    let first = socket.read_u8().await?;
    if first >> 4 != 1 {
        // not CONNECT: close without answering
        return Ok(());
    }

    let length = read_remaining_length(&mut socket).await?;
    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await?;

    let Some(connect) = parse_connect(&body) else {
        return Ok(());
    };

    match admit(&connect, &policy, &state) {
        Admission::Drop => return Ok(()),
        Admission::Refuse(code) => {
            socket.write_all(&[0x20, 0x02, 0x00, code]).await?;
            return Ok(());
        }
        Admission::Accept => socket.write_all(&[0x20, 0x02, 0x00, CONNACK_ACCEPTED]).await?,
    }

    let result = session(&mut socket, &policy).await;
    state.lock().unwrap().active -= 1;
    result
}

async fn session(socket: &mut TcpStream, policy: &BrokerPolicy) -> std::io::Result<()> {
    loop {
        let header = socket.read_u8().await?;
        let length = read_remaining_length(socket).await?;
        let mut body = vec![0u8; length];
        socket.read_exact(&mut body).await?;

        match header >> 4 {
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let mut pos = 0;
                let Some(topic) = take_string(&body, &mut pos) else { return Ok(()) };
                let packet_id = if qos > 0 { take_u16(&body, &mut pos) } else { None };
                let payload_len = body.len().saturating_sub(pos);

                if policy.max_topic_levels.map_or(false, |max| topic.split('/').count() > max)
                    || policy.max_topic_len.map_or(false, |max| topic.len() > max)
                    || policy.max_payload.map_or(false, |max| payload_len > max)
                {
                    return Ok(());
                }

                if let Some(id) = packet_id {
                    let id = id.to_be_bytes();
                    socket.write_all(&[0x40, 0x02, id[0], id[1]]).await?;
                }
            }
            // SUBSCRIBE
            8 => {
                let mut pos = 0;
                let Some(packet_id) = take_u16(&body, &mut pos) else { return Ok(()) };
                let mut codes = Vec::new();
                while pos < body.len() {
                    let Some(filter) = take_string(&body, &mut pos) else { return Ok(()) };
                    let requested = body.get(pos).copied().unwrap_or(0);
                    pos += 1;

                    if policy.max_topic_len.map_or(false, |max| filter.len() > max)
                        || policy
                            .max_topic_levels
                            .map_or(false, |max| filter.split('/').count() > max)
                    {
                        return Ok(());
                    }
                    if policy.deny_topics.iter().any(|denied| denied == &filter) {
                        codes.push(0x80);
                    } else {
                        codes.push(requested.min(1));
                    }
                }

                let id = packet_id.to_be_bytes();
                let mut ack = vec![0x90, (2 + codes.len()) as u8, id[0], id[1]];
                ack.extend(codes);
                socket.write_all(&ack).await?;
            }
            // PINGREQ
            12 => socket.write_all(&[0xD0, 0x00]).await?,
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
}

/// Listener that echoes whatever it receives
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Config matching [`BrokerPolicy::strict`] with fast timeouts
pub fn config_for(broker: &FakeBroker) -> AuditConfig {
    let mut config = AuditConfig::from_json_str(&format!(
        r#"{{
            "broker": {{
                "host": "127.0.0.1",
                "mqtt_port": {port},
                "ws_port": {port},
                "tls": false,
                "username": "admin",
                "password": "public",
                "deny_topics": ["$SYS/#", "secret/#"]
            }},
            "limit": {{
                "client_id_len": 64,
                "username_len": 16,
                "password_len": 16,
                "topic_level": 4,
                "topic_len": 64,
                "payload_len": 128,
                "connection": 20,
                "flapping": 5
            }}
        }}"#,
        port = broker.port()
    ))
    .unwrap();

    config.probe.op_timeout_ms = 2000;
    config.probe.flapping_interval_ms = 1;
    config.probe.connection_interval_ms = 1;
    config.probe.client_id_overshoot = 10;
    config.probe.connection_overshoot = 0;
    config
}
