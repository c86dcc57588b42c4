//! MQTT client factory and timeout-bounded client operations
//!
//! Every probe gets its own [`ClientHandle`] with a run-unique client id, so
//! concurrently running probes never share broker-side per-identifier state.
//! A handle is consumed by [`ClientHandle::connect`]; only an accepted
//! connection yields a [`Session`] for further operations.

use crate::config::BrokerTarget;
use crate::outcome::{RawAttempt, ReasonCode, Rejection, TransportFailure};
use crate::utils::random_string;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, StateError, SubscribeReasonCode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;

/// Outgoing packets are never capped locally; the broker decides
const MAX_OUTGOING_PACKET: usize = 256 * 1024 * 1024;
const MAX_INCOMING_PACKET: usize = 1024 * 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 10;
const CLIENT_ID_PREFIX: &str = "mqtt-audit";

static CLIENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// MQTT over plain TCP
    Tcp,
    /// MQTT over plain websocket
    Ws,
}

/// How the client id of a new handle is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    /// `mqtt-audit-<tag>-<sequence><random suffix>`
    Tagged(String),
    /// An id minted earlier with [`ConnectionFactory::unique_id`]
    Exact(String),
    /// Random alphanumeric id of exactly this length
    Random(usize),
}

/// Credentials presented in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The broker's configured credentials, anonymous when none are set
    pub fn from_broker(broker: &BrokerTarget) -> Self {
        if broker.username.is_empty() && broker.password.is_empty() {
            Credentials::Anonymous
        } else {
            Credentials::basic(&broker.username, &broker.password)
        }
    }
}

/// Builds isolated client handles for one broker
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    host: String,
    mqtt_port: u16,
    ws_port: u16,
    keep_alive: Duration,
}

impl ConnectionFactory {
    pub fn new(broker: &BrokerTarget) -> Self {
        Self {
            host: broker.host.clone(),
            mqtt_port: broker.mqtt_port,
            ws_port: broker.ws_port,
            keep_alive: Duration::from_secs(30),
        }
    }

    /// Mint a client id that is unique within this process
    pub fn unique_id(&self, tag: &str) -> String {
        let sequence = CLIENT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}{}", CLIENT_ID_PREFIX, tag, sequence, random_string(8))
    }

    /// Build a new, not yet connected client
    pub fn new_client(
        &self,
        transport: Transport,
        identity: ClientIdentity,
        credentials: Credentials,
    ) -> ClientHandle {
        let client_id = match identity {
            ClientIdentity::Tagged(tag) => self.unique_id(&tag),
            ClientIdentity::Exact(id) => id,
            ClientIdentity::Random(len) => random_string(len.max(1)),
        };

        let mut options = match transport {
            Transport::Tcp => {
                MqttOptions::new(client_id.clone(), self.host.clone(), self.mqtt_port)
            }
            Transport::Ws => {
                let url = format!("ws://{}:{}/mqtt", self.host, self.ws_port);
                let mut options = MqttOptions::new(client_id.clone(), url, self.ws_port);
                options.set_transport(rumqttc::Transport::Ws);
                options
            }
        };
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(MAX_INCOMING_PACKET, MAX_OUTGOING_PACKET);

        if let Credentials::Basic { username, password } = credentials {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        log::debug!("Created client {} ({:?})", truncate_id(&client_id), transport);

        ClientHandle {
            client,
            eventloop,
            client_id,
        }
    }
}

fn truncate_id(id: &str) -> String {
    if id.len() > 48 {
        format!("{}...({} chars)", &id[..32], id.len())
    } else {
        id.to_string()
    }
}

/// A configured client whose connection attempt has not happened yet
pub struct ClientHandle {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
}

/// Result of [`ClientHandle::connect`]
pub struct ConnectOutcome {
    pub attempt: RawAttempt,
    /// Present only when the broker accepted the connection
    pub session: Option<Session>,
}

impl ClientHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect and wait up to `wait` for the CONNACK
    pub async fn connect(self, wait: Duration) -> ConnectOutcome {
        let ClientHandle {
            client,
            mut eventloop,
            client_id,
        } = self;

        let result = timeout(wait, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => ConnectOutcome {
                attempt: RawAttempt::accepted(),
                session: Some(Session {
                    client,
                    eventloop,
                    client_id,
                    wait,
                    closed: false,
                }),
            },
            Ok(Err(e)) => {
                log::debug!("Connect of {} failed: {}", truncate_id(&client_id), e);
                ConnectOutcome {
                    attempt: attempt_from_error(&e),
                    session: None,
                }
            }
            Err(_) => ConnectOutcome {
                attempt: RawAttempt::timed_out(),
                session: None,
            },
        }
    }
}

/// An accepted MQTT connection
pub struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
    wait: Duration,
    /// Set once an operation saw the transport fail
    closed: bool,
}

impl Session {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn settle(&mut self, attempt: RawAttempt) -> RawAttempt {
        if attempt.transport.is_some() {
            self.closed = true;
        }
        attempt
    }

    /// Subscribe at QoS 1 and wait for the SUBACK
    pub async fn subscribe(&mut self, topic: &str) -> RawAttempt {
        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            let failure = TransportFailure::Other(format!("subscribe request failed: {}", e));
            return self.settle(RawAttempt::transport(failure));
        }

        let eventloop = &mut self.eventloop;
        let attempt = timeout(self.wait, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        let refused = ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        return if refused {
                            RawAttempt::rejected(Rejection::Code(ReasonCode::SubscriptionRefused))
                        } else {
                            RawAttempt::accepted()
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return attempt_from_error(&e),
                }
            }
        })
        .await
        .unwrap_or_else(|_| RawAttempt::timed_out());

        self.settle(attempt)
    }

    /// Publish at QoS 1 and wait for the PUBACK
    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> RawAttempt {
        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, false, payload).await {
            let failure = TransportFailure::Other(format!("publish request failed: {}", e));
            return self.settle(RawAttempt::transport(failure));
        }

        let eventloop = &mut self.eventloop;
        let attempt = timeout(self.wait, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return RawAttempt::accepted(),
                    Ok(_) => continue,
                    Err(e) => return attempt_from_error(&e),
                }
            }
        })
        .await
        .unwrap_or_else(|_| RawAttempt::timed_out());

        self.settle(attempt)
    }

    /// Send DISCONNECT and drop the connection
    ///
    /// A session whose transport already failed is only dropped; polling it
    /// again would make the client reconnect.
    pub async fn disconnect(mut self) {
        if self.closed || self.client.disconnect().await.is_err() {
            return;
        }

        let eventloop = &mut self.eventloop;
        let _ = timeout(self.wait, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
    }
}

fn reason_from_connack(code: &ConnectReturnCode) -> Option<ReasonCode> {
    match code {
        ConnectReturnCode::Success => None,
        ConnectReturnCode::RefusedProtocolVersion => Some(ReasonCode::UnsupportedProtocolVersion),
        ConnectReturnCode::BadClientId => Some(ReasonCode::IdentifierRejected),
        ConnectReturnCode::ServiceUnavailable => Some(ReasonCode::ServerUnavailable),
        ConnectReturnCode::BadUserNamePassword => Some(ReasonCode::BadCredentials),
        ConnectReturnCode::NotAuthorized => Some(ReasonCode::NotAuthorized),
    }
}

/// Translate a client error into a raw attempt, preferring structured codes
fn attempt_from_error(err: &ConnectionError) -> RawAttempt {
    match err {
        ConnectionError::ConnectionRefused(code) => match reason_from_connack(code) {
            Some(reason) => RawAttempt::rejected(Rejection::Code(reason)),
            None => RawAttempt::rejected(Rejection::Text(err.to_string())),
        },
        ConnectionError::Io(e) => RawAttempt::transport(TransportFailure::from_io(e)),
        ConnectionError::MqttState(StateError::Io(e)) => {
            RawAttempt::transport(TransportFailure::from_io(e))
        }
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => RawAttempt::timed_out(),
        other => RawAttempt::transport(TransportFailure::Other(other.to_string())),
    }
}
