//! Ledger (blockchain) access
//!
//! The ledger client processes are owned by another subsystem; this module
//! only knows how to reach one once it has been reported available, and how
//! to ask it whether an agreement is recorded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identifies one ledger instance and where its client is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainDescriptor {
    pub bc_type: String,
    pub bc_name: String,
    /// Base URL of the client's HTTP service; empty until the client is up
    #[serde(default)]
    pub service_url: String,
}

impl BlockchainDescriptor {
    pub fn new(bc_type: &str, bc_name: &str) -> Self {
        Self {
            bc_type: bc_type.to_string(),
            bc_name: bc_name.to_string(),
            service_url: String::new(),
        }
    }

    pub fn with_service_url(mut self, url: &str) -> Self {
        self.service_url = url.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger client unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger query failed: {0}")]
    Query(String),
}

/// Read access to agreements recorded on a ledger.
#[async_trait]
pub trait LedgerOps: Send + Sync {
    /// Whether the agreement is recorded with this counterparty and signature.
    async fn verify_agreement(
        &self,
        agreement_id: &str,
        counterparty_address: &str,
        proposal_sig: &str,
    ) -> Result<bool, LedgerError>;
}

/// Protocols without a ledger treat every agreement as recorded.
pub struct NoLedger;

#[async_trait]
impl LedgerOps for NoLedger {
    async fn verify_agreement(&self, _: &str, _: &str, _: &str) -> Result<bool, LedgerError> {
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    recorded: bool,
}

/// Queries a ledger client's HTTP service.
pub struct HttpLedgerClient {
    http: reqwest::Client,
    service_url: String,
}

impl HttpLedgerClient {
    pub fn new(descriptor: &BlockchainDescriptor, timeout: Duration) -> Result<Self, LedgerError> {
        if descriptor.service_url.is_empty() {
            return Err(LedgerError::Unavailable(format!(
                "{}/{} has no service URL",
                descriptor.bc_type, descriptor.bc_name
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            service_url: descriptor.service_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerOps for HttpLedgerClient {
    async fn verify_agreement(
        &self,
        agreement_id: &str,
        counterparty_address: &str,
        proposal_sig: &str,
    ) -> Result<bool, LedgerError> {
        let url = format!("{}/agreements/{}", self.service_url, agreement_id);
        let response = self
            .http
            .get(&url)
            .query(&[("counterparty", counterparty_address), ("sig", proposal_sig)])
            .send()
            .await
            .map_err(|e| LedgerError::Query(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(agreement_id, "Agreement not recorded on ledger");
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(LedgerError::Query(format!("HTTP {}", response.status())));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Query(e.to_string()))?;
        Ok(body.recorded)
    }
}
