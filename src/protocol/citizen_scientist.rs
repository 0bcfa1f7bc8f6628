//! Citizen Scientist protocol - agreements are recorded on a blockchain.
//!
//! The handler tracks every ledger instance it has been told about. An
//! instance becomes queryable when its client is reported available, and
//! new agreements are only accepted once the device's account on it is
//! funded (writable).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::negotiation::decide_on_proposal;
use super::{
    parse_proposal, AgreementProtocol, HandlerContext, Proposal, ProposalOutcome, ProtocolError,
    ProtocolHandler, TerminationReason,
};
use crate::exchange::DeviceMessage;
use crate::ledger::{BlockchainDescriptor, HttpLedgerClient, LedgerOps};
use crate::storage::EstablishedAgreement;

const CANCEL_POLICY_CHANGED: u32 = 100;
const CANCEL_NOT_RECORDED: u32 = 102;

type InstanceKey = (String, String);

#[derive(Default)]
struct LedgerClientState {
    available: bool,
    writable: bool,
    ledger: Option<Arc<dyn LedgerOps>>,
}

pub struct CitizenScientistHandler {
    ctx: HandlerContext,
    instances: Mutex<HashMap<InstanceKey, LedgerClientState>>,
}

impl CitizenScientistHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<InstanceKey, LedgerClientState>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(descriptor: &BlockchainDescriptor) -> InstanceKey {
        (descriptor.bc_type.clone(), descriptor.bc_name.clone())
    }

    /// Instance named by a proposal, falling back to the configured default.
    fn instance_for(&self, proposal: &Proposal) -> InstanceKey {
        match &proposal.blockchain {
            Some(bc) if !bc.bc_type.is_empty() => (bc.bc_type.clone(), bc.name.clone()),
            _ => (
                self.ctx.config.ledger.default_type.clone(),
                self.ctx.config.ledger.default_name.clone(),
            ),
        }
    }

    fn is_writable(&self, bc_type: &str, bc_name: &str) -> bool {
        self.instances()
            .get(&(bc_type.to_string(), bc_name.to_string()))
            .map(|s| s.writable)
            .unwrap_or(false)
    }
}

impl ProtocolHandler for CitizenScientistHandler {
    fn protocol(&self) -> AgreementProtocol {
        AgreementProtocol::CitizenScientist
    }

    fn initialize(&self) {
        debug!(device_id = %self.ctx.device_id, "Citizen Scientist protocol handler initialized");
    }

    fn agreement_protocol_handler(&self, bc_type: &str, bc_name: &str) -> Option<Arc<dyn LedgerOps>> {
        self.instances()
            .get(&(bc_type.to_string(), bc_name.to_string()))
            .filter(|s| s.available)
            .and_then(|s| s.ledger.clone())
    }

    fn validate_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError> {
        parse_proposal(raw, AgreementProtocol::CitizenScientist)
    }

    fn demarshal_proposal(&self, stored: &str) -> Result<Proposal, ProtocolError> {
        parse_proposal(stored, AgreementProtocol::CitizenScientist)
    }

    fn handle_proposal_message(&self, proposal: &Proposal, raw: &str, msg: &DeviceMessage) -> ProposalOutcome {
        let (bc_type, bc_name) = self.instance_for(proposal);
        if !self.is_writable(&bc_type, &bc_name) {
            // Keep the message until the account can record the agreement
            info!(
                agreement_id = %proposal.agreement_id,
                bc_type = %bc_type,
                bc_name = %bc_name,
                "Deferring proposal, blockchain account not yet writable"
            );
            return ProposalOutcome::Deferred;
        }
        decide_on_proposal(&self.ctx, AgreementProtocol::CitizenScientist, proposal, raw, msg)
    }

    fn is_blockchain_client_available(&self, bc_type: &str, bc_name: &str) -> bool {
        self.instances()
            .get(&(bc_type.to_string(), bc_name.to_string()))
            .map(|s| s.available)
            .unwrap_or(false)
    }

    fn is_agreement_verifiable(&self, agreement: &EstablishedAgreement) -> bool {
        !agreement.counterparty_address.is_empty() && !agreement.proposal_sig.is_empty()
    }

    fn get_known_blockchain(&self, agreement: &EstablishedAgreement) -> (String, String) {
        match self.demarshal_proposal(&agreement.proposal) {
            Ok(proposal) => self.instance_for(&proposal),
            Err(e) => {
                warn!(
                    agreement_id = %agreement.agreement_id,
                    error = %e,
                    "Stored proposal unreadable, assuming default blockchain"
                );
                (
                    self.ctx.config.ledger.default_type.clone(),
                    self.ctx.config.ledger.default_name.clone(),
                )
            }
        }
    }

    fn termination_code(&self, reason: TerminationReason) -> u32 {
        match reason {
            TerminationReason::PolicyChanged | TerminationReason::PolicyRemoved => CANCEL_POLICY_CHANGED,
            TerminationReason::LedgerCancelled => CANCEL_NOT_RECORDED,
        }
    }

    fn set_blockchain_client_available(&self, descriptor: &BlockchainDescriptor) {
        let ledger: Option<Arc<dyn LedgerOps>> =
            match HttpLedgerClient::new(descriptor, self.ctx.config.exchange.http_timeout()) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!(
                        bc_type = %descriptor.bc_type,
                        bc_name = %descriptor.bc_name,
                        error = %e,
                        "Blockchain client reported available but cannot be reached"
                    );
                    None
                }
            };

        let mut instances = self.instances();
        let state = instances.entry(Self::key(descriptor)).or_default();
        state.available = true;
        state.ledger = ledger;
        info!(bc_type = %descriptor.bc_type, bc_name = %descriptor.bc_name, "Blockchain client available");
    }

    fn set_blockchain_client_not_available(&self, descriptor: &BlockchainDescriptor) {
        let mut instances = self.instances();
        let state = instances.entry(Self::key(descriptor)).or_default();
        state.available = false;
        state.writable = false;
        state.ledger = None;
        info!(bc_type = %descriptor.bc_type, bc_name = %descriptor.bc_name, "Blockchain client stopped");
    }

    fn set_blockchain_writable(&self, descriptor: &BlockchainDescriptor) {
        self.instances().entry(Self::key(descriptor)).or_default().writable = true;
        info!(bc_type = %descriptor.bc_type, bc_name = %descriptor.bc_name, "Blockchain account funded");
    }
}
