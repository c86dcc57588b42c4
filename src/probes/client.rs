//! Client admission probes: authentication, identifier and credential
//! length limits, flapping detection and the connection ceiling

use super::{classify_known, CheckResult, Probe};
use crate::client::{ClientIdentity, ConnectionFactory, Credentials, Session, Transport};
use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::outcome::Outcome;
use crate::utils::random_string;
use async_trait::async_trait;
use tokio::task::JoinSet;

/// Valid credentials must be accepted, missing or wrong ones must not
pub struct ClientAuthentication;

#[async_trait]
impl Probe for ClientAuthentication {
    fn name(&self) -> &'static str {
        "Client Authentication"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let factory = ConnectionFactory::new(&config.broker);
        let wait = config.probe.op_timeout();
        let mut result = CheckResult::new(self.name());

        let cases = [
            ("valid credentials", Credentials::from_broker(&config.broker), true),
            ("no credentials", Credentials::Anonymous, false),
            ("wrong credentials", Credentials::basic("wrong_user", "wrong_pass"), false),
        ];

        for (label, credentials, should_accept) in cases {
            let identity = ClientIdentity::Tagged("auth".into());
            let handle = factory.new_client(Transport::Tcp, identity, credentials);
            let connected = handle.connect(wait).await;
            let outcome = classify_known(self.name(), label, &connected.attempt)?;

            if let Some(session) = connected.session {
                session.disconnect().await;
            }

            match (outcome, should_accept) {
                (Outcome::Accepted, true) => {}
                (Outcome::Accepted, false) => {
                    result.fail(format!("connection with {} was accepted", label))
                }
                (Outcome::TimedOut, _) => {
                    result.fail(format!("connection with {} timed out after {:?}", label, wait))
                }
                (other, true) => result.fail(format!("connection with {} was {}", label, other)),
                (_, false) => {}
            }
        }

        Ok(result)
    }
}

/// An over-long client identifier must be refused as an invalid identifier
pub struct ClientIdLength;

#[async_trait]
impl Probe for ClientIdLength {
    fn name(&self) -> &'static str {
        "MQTT Client ID Length"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let factory = ConnectionFactory::new(&config.broker);
        let length = config.client_id_probe_len()?;
        let mut result = CheckResult::new(self.name());

        let handle = factory.new_client(
            Transport::Tcp,
            ClientIdentity::Random(length),
            Credentials::from_broker(&config.broker),
        );
        let connected = handle.connect(config.probe.op_timeout()).await;
        let outcome = classify_known(self.name(), "connect", &connected.attempt)?;

        match outcome {
            Outcome::RejectedIdentifier => {}
            Outcome::Accepted => {
                result.fail(format!("client id of {} characters was accepted", length))
            }
            Outcome::TimedOut => result.fail(format!(
                "connect with a {}-character client id timed out after {:?}",
                length,
                config.probe.op_timeout()
            )),
            other => result.fail(format!(
                "client id of {} characters was not rejected as an invalid identifier: {}",
                length, other
            )),
        }

        if let Some(session) = connected.session {
            session.disconnect().await;
        }

        Ok(result)
    }
}

/// Which CONNECT credential the length probe inflates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Username,
    Password,
}

/// An over-long username or password must not get a session
pub struct CredentialLength {
    field: CredentialField,
}

impl CredentialLength {
    pub fn new(field: CredentialField) -> Self {
        Self { field }
    }
}

#[async_trait]
impl Probe for CredentialLength {
    fn name(&self) -> &'static str {
        match self.field {
            CredentialField::Username => "MQTT Client Username Length",
            CredentialField::Password => "MQTT Client Password Length",
        }
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let factory = ConnectionFactory::new(&config.broker);
        let broker = &config.broker;
        let (label, length, credentials) = match self.field {
            CredentialField::Username => {
                let length = config.username_probe_len()?;
                ("username", length, Credentials::basic(random_string(length), &broker.password))
            }
            CredentialField::Password => {
                let length = config.password_probe_len()?;
                ("password", length, Credentials::basic(&broker.username, random_string(length)))
            }
        };

        let mut result = CheckResult::new(self.name());
        let handle =
            factory.new_client(Transport::Tcp, ClientIdentity::Tagged(label.into()), credentials);
        let connected = handle.connect(config.probe.op_timeout()).await;
        let outcome = classify_known(self.name(), "connect", &connected.attempt)?;

        match outcome {
            Outcome::RejectedAuth | Outcome::RejectedLimit | Outcome::TransportClosed => {}
            Outcome::Accepted => {
                result.fail(format!("{} of {} characters was accepted", label, length))
            }
            Outcome::TimedOut => result.fail(format!(
                "connect with a {}-character {} timed out after {:?}",
                length,
                label,
                config.probe.op_timeout()
            )),
            other => result.fail(format!("{} length limit is not enforced: {}", label, other)),
        }

        if let Some(session) = connected.session {
            session.disconnect().await;
        }

        Ok(result)
    }
}

/// Repeated connect/disconnect cycles from one identity must get it banned
pub struct Flapping;

#[async_trait]
impl Probe for Flapping {
    fn name(&self) -> &'static str {
        "MQTT Client Flapping"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let factory = ConnectionFactory::new(&config.broker);
        let credentials = Credentials::from_broker(&config.broker);
        let client_id = factory.unique_id("flapping");
        let wait = config.probe.op_timeout();
        let interval = config.probe.flapping_interval();
        let cycles = config.limit.flapping + config.probe.flapping_overshoot;

        let mut completed = 0;
        for _ in 0..cycles {
            tokio::time::sleep(interval).await;
            let handle = factory.new_client(
                Transport::Tcp,
                ClientIdentity::Exact(client_id.clone()),
                credentials.clone(),
            );
            match handle.connect(wait).await.session {
                Some(session) => {
                    session.disconnect().await;
                    completed += 1;
                }
                None => break,
            }
        }
        log::debug!("[{}] {} of {} cycles completed", self.name(), completed, cycles);

        tokio::time::sleep(interval).await;
        let handle =
            factory.new_client(Transport::Tcp, ClientIdentity::Exact(client_id), credentials);
        let connected = handle.connect(wait).await;
        let outcome = classify_known(self.name(), "final connect", &connected.attempt)?;

        if let Some(session) = connected.session {
            session.disconnect().await;
        }

        let mut result = CheckResult::new(self.name());
        match outcome {
            Outcome::RejectedAuth => {}
            Outcome::Accepted => result.fail(format!(
                "client still accepted after {} connect/disconnect cycles",
                completed
            )),
            Outcome::TimedOut => result.fail(format!("final connect timed out after {:?}", wait)),
            other => {
                result.fail(format!("final connect was not refused as unauthorized: {}", other))
            }
        }

        Ok(result)
    }
}

/// Sessions kept open to saturate the broker's connection capacity
///
/// [`release`](Self::release) disconnects cleanly; on any other path the
/// sockets close when the guard is dropped.
#[derive(Default)]
pub struct HeldConnections {
    sessions: Vec<Session>,
}

impl HeldConnections {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn hold(&mut self, session: Session) {
        self.sessions.push(session);
    }

    pub async fn release(self) {
        futures::future::join_all(self.sessions.into_iter().map(Session::disconnect)).await;
    }
}

/// Holding the configured maximum of connections, one more must be refused
///
/// Runs last and alone: while it holds connections, every other probe's
/// connects would be refused too.
pub struct ConnectionCeiling;

#[async_trait]
impl Probe for ConnectionCeiling {
    fn name(&self) -> &'static str {
        "MQTT Client Connection"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let factory = ConnectionFactory::new(&config.broker);
        let credentials = Credentials::from_broker(&config.broker);
        let wait = config.probe.op_timeout();
        let target = config.limit.connection + config.probe.connection_overshoot;

        let mut pending = JoinSet::new();
        for i in 0..target {
            if i > 0 {
                tokio::time::sleep(config.probe.connection_interval()).await;
            }
            let handle = factory.new_client(
                Transport::Tcp,
                ClientIdentity::Tagged("connection".into()),
                credentials.clone(),
            );
            pending.spawn(handle.connect(wait));
        }

        let mut held = HeldConnections::default();
        while let Some(joined) = pending.join_next().await {
            let connected = joined.map_err(|e| AuditError::TaskFailed {
                probe: self.name().to_string(),
                reason: e.to_string(),
            })?;
            if let Some(session) = connected.session {
                held.hold(session);
            }
        }
        log::info!("[{}] holding {} of {} connections", self.name(), held.len(), target);

        let handle = factory.new_client(
            Transport::Tcp,
            ClientIdentity::Tagged("connection-final".into()),
            credentials,
        );
        let connected = handle.connect(wait).await;
        let outcome = classify_known(self.name(), "final connect", &connected.attempt)?;

        if let Some(session) = connected.session {
            session.disconnect().await;
        }
        let held_count = held.len();
        held.release().await;

        let mut result = CheckResult::new(self.name());
        match outcome {
            Outcome::RejectedLimit => {}
            Outcome::Accepted => result.fail(format!(
                "connection still accepted with {} connections open",
                held_count
            )),
            Outcome::TimedOut => result.fail(format!("final connect timed out after {:?}", wait)),
            other => result.fail(format!("final connect was not refused for capacity: {}", other)),
        }

        Ok(result)
    }
}
