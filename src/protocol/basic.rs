//! Basic protocol - agreements are not recorded on any ledger.

use std::sync::Arc;

use tracing::debug;

use super::negotiation::decide_on_proposal;
use super::{
    parse_proposal, AgreementProtocol, HandlerContext, Proposal, ProposalOutcome, ProtocolError,
    ProtocolHandler, TerminationReason,
};
use crate::exchange::DeviceMessage;
use crate::ledger::{BlockchainDescriptor, LedgerOps, NoLedger};
use crate::storage::EstablishedAgreement;

const CANCEL_POLICY_CHANGED: u32 = 200;
const CANCEL_AGBOT_REQUESTED: u32 = 202;

pub struct BasicProtocolHandler {
    ctx: HandlerContext,
    ledger: Arc<NoLedger>,
}

impl BasicProtocolHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            ledger: Arc::new(NoLedger),
        }
    }
}

impl ProtocolHandler for BasicProtocolHandler {
    fn protocol(&self) -> AgreementProtocol {
        AgreementProtocol::Basic
    }

    fn initialize(&self) {
        debug!(device_id = %self.ctx.device_id, "Basic protocol handler initialized");
    }

    fn agreement_protocol_handler(&self, _bc_type: &str, _bc_name: &str) -> Option<Arc<dyn LedgerOps>> {
        Some(self.ledger.clone())
    }

    fn validate_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError> {
        parse_proposal(raw, AgreementProtocol::Basic)
    }

    fn demarshal_proposal(&self, stored: &str) -> Result<Proposal, ProtocolError> {
        parse_proposal(stored, AgreementProtocol::Basic)
    }

    fn handle_proposal_message(&self, proposal: &Proposal, raw: &str, msg: &DeviceMessage) -> ProposalOutcome {
        decide_on_proposal(&self.ctx, AgreementProtocol::Basic, proposal, raw, msg)
    }

    fn is_blockchain_client_available(&self, _bc_type: &str, _bc_name: &str) -> bool {
        true
    }

    fn is_agreement_verifiable(&self, _agreement: &EstablishedAgreement) -> bool {
        true
    }

    fn get_known_blockchain(&self, _agreement: &EstablishedAgreement) -> (String, String) {
        (String::new(), String::new())
    }

    fn termination_code(&self, reason: TerminationReason) -> u32 {
        match reason {
            TerminationReason::PolicyChanged | TerminationReason::PolicyRemoved => CANCEL_POLICY_CHANGED,
            TerminationReason::LedgerCancelled => CANCEL_AGBOT_REQUESTED,
        }
    }

    fn set_blockchain_client_available(&self, _descriptor: &BlockchainDescriptor) {}

    fn set_blockchain_client_not_available(&self, _descriptor: &BlockchainDescriptor) {}

    fn set_blockchain_writable(&self, _descriptor: &BlockchainDescriptor) {}
}
