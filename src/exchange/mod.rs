//! Exchange (remote registry) client
//!
//! The exchange holds the device record, the policies it advertises, the
//! agreements it believes the device holds, and the device's inbound
//! message queue. Every call goes through one retry policy:
//! - transport failures (unreachable, timeout, gateway errors, undecodable
//!   responses) sleep a fixed backoff and retry forever
//! - application failures (well-formed error responses) return at once

pub mod client;
pub mod mock;
pub mod retry;

pub use client::ExchangeClient;
pub use retry::retry_transient;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Exchange errors, split by retry eligibility
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Worth retrying: the request may not have reached the exchange
    #[error("Exchange transport error: {0}")]
    Transport(String),

    /// The exchange answered and refused
    #[error("Exchange returned HTTP {status}: {body}")]
    Application { status: u16, body: String },
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

/// One agreement as recorded by the exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceAgreement {
    pub microservice: String,
    pub state: String,
    pub last_updated: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllDeviceAgreementsResponse {
    pub agreements: HashMap<String, DeviceAgreement>,
    pub last_index: i64,
}

/// A message queued for this device by a counterparty
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceMessage {
    pub msg_id: i64,
    pub agbot_id: String,
    pub agbot_pub_key: String,
    pub message: String,
    pub time_sent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDeviceMessageResponse {
    pub messages: Vec<DeviceMessage>,
    pub last_index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAgreementState {
    pub microservice: String,
    pub state: String,
}

/// Generic acknowledgement body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PostDeviceResponse {
    pub code: String,
    pub msg: String,
}

/// One searchable property of an advertised microservice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsProp {
    pub name: String,
    pub value: String,
    pub prop_type: String,
    pub op: String,
}

/// A policy as the exchange indexes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    pub url: String,
    pub properties: Vec<MsProp>,
    pub num_agreements: u32,
    pub policy: String,
}

/// Full device record, written with an idempotent PUT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutDeviceRequest {
    pub token: String,
    pub name: String,
    pub registered_microservices: Vec<Microservice>,
    pub msg_endpoint: String,
    pub software_versions: HashMap<String, String>,
    pub public_key: String,
}

impl PutDeviceRequest {
    pub fn new(token: &str, name: &str) -> Self {
        Self {
            token: token.to_string(),
            name: name.to_string(),
            registered_microservices: Vec::new(),
            msg_endpoint: String::new(),
            software_versions: HashMap::new(),
            public_key: String::new(),
        }
    }

    /// Log-friendly summary that leaves out the token and policy bodies.
    pub fn short_string(&self) -> String {
        let urls: Vec<&str> = self
            .registered_microservices
            .iter()
            .map(|m| m.url.as_str())
            .collect();
        format!("name: {}, microservices: {:?}", self.name, urls)
    }
}

/// Exchange list values are comma separated.
pub fn convert_to_string(values: &[String]) -> String {
    values.join(",")
}

/// Operations the agreement worker needs from the exchange.
///
/// Implementations retry transport failures internally, so an `Err`
/// is always an application failure, except from `heartbeat`, which is
/// a single attempt.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn device_id(&self) -> &str;

    /// Replace the credential used for subsequent calls.
    fn set_token(&self, token: &str);

    async fn device_agreements(&self) -> Result<HashMap<String, DeviceAgreement>, ExchangeError>;

    async fn delete_agreement(&self, agreement_id: &str) -> Result<(), ExchangeError>;

    async fn set_agreement_state(
        &self,
        agreement_id: &str,
        microservice: &str,
        state: &str,
    ) -> Result<(), ExchangeError>;

    async fn device_messages(&self) -> Result<Vec<DeviceMessage>, ExchangeError>;

    async fn delete_message(&self, msg_id: i64) -> Result<(), ExchangeError>;

    async fn put_device(&self, device: &PutDeviceRequest) -> Result<(), ExchangeError>;

    async fn heartbeat(&self) -> Result<(), ExchangeError>;

    /// Whether a message is still queued (it may have been consumed already).
    async fn message_in_exchange(&self, msg_id: i64) -> Result<bool, ExchangeError> {
        let messages = self.device_messages().await?;
        Ok(messages.iter().any(|m| m.msg_id == msg_id))
    }
}
