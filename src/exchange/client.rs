//! HTTP implementation of the exchange API.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    retry_transient, AllDeviceAgreementsResponse, DeviceAgreement, DeviceMessage, Exchange,
    ExchangeError, GetDeviceMessageResponse, PostDeviceResponse, PutAgreementState,
    PutDeviceRequest,
};
use crate::config::{normalize_url, ExchangeConfig};

/// Exchange client authenticated as one device
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    token: RwLock<String>,
    backoff: Duration,
}

impl ExchangeClient {
    pub fn new(config: &ExchangeConfig, device_id: &str, token: &str) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: normalize_url(&config.url),
            device_id: device_id.to_string(),
            token: RwLock::new(token.to_string()),
            backoff: config.retry_backoff(),
        })
    }

    fn token(&self) -> String {
        self.token.read().map(|t| t.clone()).unwrap_or_default()
    }

    fn device_path(&self, suffix: &str) -> String {
        format!("devices/{}{}", self.device_id, suffix)
    }

    /// Single attempt. Classifies the outcome into transport and
    /// application failures; never retries.
    async fn invoke<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, ExchangeError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned + Default,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.device_id, Some(self.token()));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{} {}: {}", method, url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("reading response from {}: {}", url, e)))?;

        // An empty collection is reported as 404
        if method == Method::GET && status == StatusCode::NOT_FOUND {
            return Ok(R::default());
        }

        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(ExchangeError::Transport(format!("{} {}: HTTP {}", method, url, status)));
        }

        if !status.is_success() {
            return Err(ExchangeError::Application {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(R::default());
        }

        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::Transport(format!("malformed response from {}: {}", url, e)))
    }
}

#[async_trait]
impl Exchange for ExchangeClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn set_token(&self, token: &str) {
        if let Ok(mut t) = self.token.write() {
            *t = token.to_string();
        }
    }

    async fn device_agreements(&self) -> Result<HashMap<String, DeviceAgreement>, ExchangeError> {
        let path = self.device_path("/agreements");
        let path = path.as_str();
        let resp: AllDeviceAgreementsResponse =
            retry_transient("get device agreements", self.backoff, move || {
                self.invoke(Method::GET, path, None::<&()>)
            })
            .await?;
        debug!(count = resp.agreements.len(), "Found agreements in the exchange");
        Ok(resp.agreements)
    }

    async fn delete_agreement(&self, agreement_id: &str) -> Result<(), ExchangeError> {
        let path = self.device_path(&format!("/agreements/{}", agreement_id));
        let path = path.as_str();
        let _: PostDeviceResponse = retry_transient("delete agreement", self.backoff, move || {
            self.invoke(Method::DELETE, path, None::<&()>)
        })
        .await?;
        debug!(agreement_id, "Deleted agreement from exchange");
        Ok(())
    }

    async fn set_agreement_state(
        &self,
        agreement_id: &str,
        microservice: &str,
        state: &str,
    ) -> Result<(), ExchangeError> {
        let path = self.device_path(&format!("/agreements/{}", agreement_id));
        let path = path.as_str();
        let body = PutAgreementState {
            microservice: microservice.to_string(),
            state: state.to_string(),
        };
        let body = &body;
        let _: PostDeviceResponse = retry_transient("set agreement state", self.backoff, move || {
            self.invoke(Method::PUT, path, Some(body))
        })
        .await?;
        debug!(agreement_id, state, "Set agreement state in exchange");
        Ok(())
    }

    async fn device_messages(&self) -> Result<Vec<DeviceMessage>, ExchangeError> {
        let path = self.device_path("/msgs");
        let path = path.as_str();
        let resp: GetDeviceMessageResponse =
            retry_transient("get device messages", self.backoff, move || {
                self.invoke(Method::GET, path, None::<&()>)
            })
            .await?;
        Ok(resp.messages)
    }

    async fn delete_message(&self, msg_id: i64) -> Result<(), ExchangeError> {
        let path = self.device_path(&format!("/msgs/{}", msg_id));
        let path = path.as_str();
        let _: PostDeviceResponse = retry_transient("delete message", self.backoff, move || {
            self.invoke(Method::DELETE, path, None::<&()>)
        })
        .await?;
        debug!(msg_id, "Deleted message from exchange");
        Ok(())
    }

    async fn put_device(&self, device: &PutDeviceRequest) -> Result<(), ExchangeError> {
        let path = self.device_path("");
        let path = path.as_str();
        info!(device = %device.short_string(), "Registering microservices");
        let _: PostDeviceResponse = retry_transient("put device", self.backoff, move || {
            self.invoke(Method::PUT, path, Some(device))
        })
        .await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), ExchangeError> {
        let path = self.device_path("/heartbeat");
        let _: PostDeviceResponse = self.invoke(Method::POST, &path, None::<&()>).await?;
        Ok(())
    }
}
