//! Topic and message policy probes

use super::{classify_known, open_session, CheckResult, Probe};
use crate::config::AuditConfig;
use crate::outcome::Outcome;
use crate::utils::{random_payload, random_string, random_topic};
use async_trait::async_trait;

/// Subscriptions to configured deny topics must fail
pub struct DenyTopic;

#[async_trait]
impl Probe for DenyTopic {
    fn name(&self) -> &'static str {
        "MQTT Message Deny Topic"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let mut session = match open_session(config, "deny-topic").await {
            Ok(session) => session,
            Err(message) => return Ok(CheckResult::failed(self.name(), message)),
        };

        let mut result = CheckResult::new(self.name());
        for topic in &config.broker.deny_topics {
            // brokers may drop the session on a denied subscription
            if session.is_closed() {
                session = match open_session(config, "deny-topic").await {
                    Ok(session) => session,
                    Err(message) => {
                        result.fail(message);
                        return Ok(result);
                    }
                };
            }

            let attempt = session.subscribe(topic).await;
            match classify_known(self.name(), "subscribe", &attempt)? {
                Outcome::Accepted => {
                    result.fail(format!("subscription to deny topic {} was accepted", topic))
                }
                Outcome::TimedOut => result.fail(format!(
                    "subscription to deny topic {} timed out after {:?}",
                    topic,
                    config.probe.op_timeout()
                )),
                _ => {}
            }
        }

        session.disconnect().await;
        Ok(result)
    }
}

/// Publishing to a topic deeper than the level limit must drop the session
pub struct TopicLevel;

#[async_trait]
impl Probe for TopicLevel {
    fn name(&self) -> &'static str {
        "MQTT Topic Level"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let levels = config.topic_level_probe_count()?;
        let mut session = match open_session(config, "topic-level").await {
            Ok(session) => session,
            Err(message) => return Ok(CheckResult::failed(self.name(), message)),
        };

        let attempt = session.publish(&random_topic(levels), b"MQTT Topic Level".to_vec()).await;
        let outcome = classify_known(self.name(), "publish", &attempt)?;

        let mut result = CheckResult::new(self.name());
        match outcome {
            Outcome::TransportClosed => {}
            Outcome::Accepted => {
                result.fail(format!("publish to a topic with {} levels was accepted", levels))
            }
            Outcome::TimedOut => result.fail(format!(
                "publish to a topic with {} levels timed out after {:?}",
                levels,
                config.probe.op_timeout()
            )),
            other => result.fail(format!("topic level limit is not enforced: {}", other)),
        }

        session.disconnect().await;
        Ok(result)
    }
}

/// Subscribing to a topic longer than the length limit must drop the session
pub struct TopicLength;

#[async_trait]
impl Probe for TopicLength {
    fn name(&self) -> &'static str {
        "MQTT Topic Length"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let length = config.topic_probe_len()?;
        let mut session = match open_session(config, "topic-length").await {
            Ok(session) => session,
            Err(message) => return Ok(CheckResult::failed(self.name(), message)),
        };

        let attempt = session.subscribe(&random_string(length)).await;
        let outcome = classify_known(self.name(), "subscribe", &attempt)?;

        let mut result = CheckResult::new(self.name());
        match outcome {
            Outcome::TransportClosed => {}
            Outcome::Accepted => result.fail(format!(
                "subscription to a {}-character topic was accepted",
                length
            )),
            Outcome::TimedOut => result.fail(format!(
                "subscription to a {}-character topic timed out after {:?}",
                length,
                config.probe.op_timeout()
            )),
            other => result.fail(format!("topic length limit is not enforced: {}", other)),
        }

        session.disconnect().await;
        Ok(result)
    }
}

/// A payload above the size limit must not be acknowledged
pub struct PayloadLength;

#[async_trait]
impl Probe for PayloadLength {
    fn name(&self) -> &'static str {
        "MQTT Message Payload Length"
    }

    async fn run(&self, config: &AuditConfig) -> crate::Result<CheckResult> {
        let mut session = match open_session(config, "payload-length").await {
            Ok(session) => session,
            Err(message) => return Ok(CheckResult::failed(self.name(), message)),
        };

        let length = config.limit.payload_len + config.probe.payload_overshoot;
        let topic = format!("mqtt-audit/payload/{}", random_string(8));
        let attempt = session.publish(&topic, random_payload(length)).await;
        let outcome = classify_known(self.name(), "publish", &attempt)?;

        let mut result = CheckResult::new(self.name());
        match outcome {
            Outcome::Accepted => result.fail(format!("payload of {} bytes was accepted", length)),
            Outcome::TimedOut => result.fail(format!(
                "publish of {} bytes timed out after {:?}",
                length,
                config.probe.op_timeout()
            )),
            _ => {}
        }

        session.disconnect().await;
        Ok(result)
    }
}
