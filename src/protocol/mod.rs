//! Agreement protocol handlers
//!
//! Each supported negotiation protocol has one handler for the life of the
//! process. The worker drives them uniformly through [`ProtocolHandler`]:
//! proposal validation and handling, which ledger instance an agreement
//! depends on, whether that ledger can be queried yet, and the
//! protocol-specific termination codes.
//!
//! Ledger lifecycle events are broadcast to every handler; each decides
//! whether the instance concerns it.

pub mod basic;
pub mod citizen_scientist;
#[cfg(test)]
pub mod mock;
mod negotiation;
pub mod registry;

pub use basic::BasicProtocolHandler;
pub use citizen_scientist::CitizenScientistHandler;
pub use registry::HandlerRegistry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::exchange::DeviceMessage;
use crate::ledger::{BlockchainDescriptor, LedgerOps};
use crate::policy::PolicyManager;
use crate::storage::{AgreementStore, EstablishedAgreement};

/// The negotiation protocols this device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgreementProtocol {
    Basic,
    CitizenScientist,
}

impl AgreementProtocol {
    pub fn all() -> &'static [AgreementProtocol] {
        &[AgreementProtocol::Basic, AgreementProtocol::CitizenScientist]
    }

    /// Name used on the wire and in the agreement store.
    pub fn name(&self) -> &'static str {
        match self {
            AgreementProtocol::Basic => "Basic",
            AgreementProtocol::CitizenScientist => "Citizen Scientist",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.name() == name)
    }
}

impl fmt::Display for AgreementProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why the device wants an agreement cancelled. Handlers map these to
/// their own wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The policy the agreement was made under has changed
    PolicyChanged,
    /// The policy the agreement was made under no longer exists
    PolicyRemoved,
    /// The ledger no longer records a finalized agreement
    LedgerCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Expected for every non-proposal protocol message
    #[error("Message is not a proposal")]
    NotAProposal,

    #[error("Malformed protocol message: {0}")]
    Malformed(String),
}

/// Fields shared by every protocol message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageHeader {
    #[serde(rename = "type", default)]
    msg_type: String,
    protocol: String,
}

/// Ledger instance named by a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainRef {
    #[serde(rename = "type")]
    pub bc_type: String,
    pub name: String,
}

/// An agreement proposal from a counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol: String,
    #[serde(default)]
    pub version: u32,
    pub agreement_id: String,
    /// The device policy the counterparty proposes against, as JSON
    pub producer_policy: String,
    /// Counterparty's merged terms, as JSON
    #[serde(default)]
    pub tsandcs: String,
    /// Counterparty's ledger address
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub blockchain: Option<BlockchainRef>,
    /// Workload to run once the agreement is finalized, as JSON
    #[serde(default)]
    pub deployment: String,
}

impl Proposal {
    pub fn producer_policy(&self) -> &str {
        &self.producer_policy
    }
}

/// Protocol name carried by a raw protocol message.
pub fn extract_protocol(raw: &str) -> Result<String, ProtocolError> {
    let header: MessageHeader =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if header.protocol.is_empty() {
        return Err(ProtocolError::Malformed("missing protocol name".to_string()));
    }
    Ok(header.protocol)
}

/// Parse `raw` as a proposal for `protocol`. Other message types are
/// reported as [`ProtocolError::NotAProposal`].
pub fn parse_proposal(raw: &str, protocol: AgreementProtocol) -> Result<Proposal, ProtocolError> {
    let header: MessageHeader =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if header.msg_type != "proposal" {
        return Err(ProtocolError::NotAProposal);
    }
    if header.protocol != protocol.name() {
        return Err(ProtocolError::Malformed(format!(
            "proposal for {} sent to {} handler",
            header.protocol, protocol
        )));
    }

    let proposal: Proposal =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if proposal.agreement_id.is_empty() {
        return Err(ProtocolError::Malformed("missing agreement id".to_string()));
    }
    if proposal.producer_policy.is_empty() {
        return Err(ProtocolError::Malformed("missing producer policy".to_string()));
    }
    Ok(proposal)
}

/// What came of negotiating on one proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Recorded locally. The exchange still has to learn about it.
    Accepted {
        agreement_id: String,
        /// Workload the agreement is for (the policy's first API spec)
        microservice: String,
    },
    /// Refused or already handled
    Rejected,
    /// Could not be decided now; keep the message for another try
    Deferred,
}

impl ProposalOutcome {
    /// Whether the inbound message is finished with.
    pub fn delete_message(&self) -> bool {
        !matches!(self, ProposalOutcome::Deferred)
    }
}

/// Everything a handler is created with.
#[derive(Clone)]
pub struct HandlerContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn AgreementStore>,
    pub policy_manager: Arc<PolicyManager>,
    pub device_id: String,
    pub device_token: String,
}

/// Capabilities of one negotiation protocol.
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> AgreementProtocol;

    /// Idempotent setup run once after creation.
    fn initialize(&self);

    /// Ledger access for one instance, or `None` when it cannot be queried
    /// yet. `None` means "not verifiable now", never an error.
    fn agreement_protocol_handler(&self, bc_type: &str, bc_name: &str) -> Option<Arc<dyn LedgerOps>>;

    /// Parse an inbound message as a proposal.
    fn validate_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError>;

    /// Parse the proposal stored with an agreement.
    fn demarshal_proposal(&self, stored: &str) -> Result<Proposal, ProtocolError>;

    /// Negotiate on a proposal.
    fn handle_proposal_message(&self, proposal: &Proposal, raw: &str, msg: &DeviceMessage) -> ProposalOutcome;

    fn is_blockchain_client_available(&self, bc_type: &str, bc_name: &str) -> bool;

    fn is_agreement_verifiable(&self, agreement: &EstablishedAgreement) -> bool;

    /// The ledger instance `(type, name)` an agreement depends on. An empty
    /// type means the agreement needs no ledger.
    fn get_known_blockchain(&self, agreement: &EstablishedAgreement) -> (String, String);

    fn termination_code(&self, reason: TerminationReason) -> u32;

    fn set_blockchain_client_available(&self, descriptor: &BlockchainDescriptor);

    fn set_blockchain_client_not_available(&self, descriptor: &BlockchainDescriptor);

    fn set_blockchain_writable(&self, descriptor: &BlockchainDescriptor);
}

/// Build the handler for `protocol`.
pub fn create_handler(protocol: AgreementProtocol, ctx: &HandlerContext) -> Arc<dyn ProtocolHandler> {
    match protocol {
        AgreementProtocol::Basic => Arc::new(BasicProtocolHandler::new(ctx.clone())),
        AgreementProtocol::CitizenScientist => Arc::new(CitizenScientistHandler::new(ctx.clone())),
    }
}
