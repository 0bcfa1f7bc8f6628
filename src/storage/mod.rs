//! Storage layer - durable agreement and device records
//!
//! Handles:
//! - Established agreement records (one row per agreement id)
//! - The exchange device registration record
//! - Filtered lookups used by reconciliation and the protocol handlers

pub mod sqlite;

pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

/// A locally persisted record of one negotiated agreement.
///
/// Timestamps are unix seconds; zero means the transition has not happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishedAgreement {
    pub agreement_id: String,
    pub agreement_protocol: String,
    pub policy_name: String,
    pub creation_time: u64,
    pub accepted_time: u64,
    pub finalized_time: u64,
    pub terminated_time: u64,
    pub terminated_reason: u32,
    pub force_terminated_time: u64,
    pub counterparty_address: String,
    pub proposal_sig: String,
    /// Protocol-specific proposal, only interpreted by the owning handler
    pub proposal: String,
    /// Workload descriptor handed to the container subsystem
    pub current_deployment: String,
    pub archived: bool,
}

impl EstablishedAgreement {
    pub fn new(agreement_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            agreement_id: agreement_id.into(),
            agreement_protocol: protocol.into(),
            policy_name: String::new(),
            creation_time: 0,
            accepted_time: 0,
            finalized_time: 0,
            terminated_time: 0,
            terminated_reason: 0,
            force_terminated_time: 0,
            counterparty_address: String::new(),
            proposal_sig: String::new(),
            proposal: String::new(),
            current_deployment: String::new(),
            archived: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_time != 0
    }

    /// Accepted and not yet terminated.
    pub fn is_live(&self) -> bool {
        self.accepted_time != 0 && self.terminated_time == 0
    }
}

/// The device's registration with the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDevice {
    pub id: String,
    pub token: String,
    pub name: String,
}

/// Narrows an agreement lookup. Filters are combined with AND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementFilter {
    Id(String),
    Unarchived,
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agreement {agreement_id} ({protocol}) not found")]
    NotFound { agreement_id: String, protocol: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Durable agreement storage.
///
/// Other subsystems may write concurrently; implementations serialize
/// their own access.
pub trait AgreementStore: Send + Sync {
    fn find_exchange_device(&self) -> Result<Option<ExchangeDevice>, StoreError>;

    fn save_exchange_device(&self, device: &ExchangeDevice) -> Result<(), StoreError>;

    /// Agreements whose protocol is in `protocols` and which pass every filter.
    fn find_agreements(
        &self,
        protocols: &[String],
        filters: &[AgreementFilter],
    ) -> Result<Vec<EstablishedAgreement>, StoreError>;

    /// Insert or replace the record for `agreement.agreement_id`.
    fn save_agreement(&self, agreement: &EstablishedAgreement) -> Result<(), StoreError>;

    /// Mark an agreement force-terminated and return the updated record.
    fn force_terminate(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<EstablishedAgreement, StoreError>;
}

pub(crate) fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
