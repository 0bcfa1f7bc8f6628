//! Mock protocol handler and ledger for testing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    parse_proposal, AgreementProtocol, Proposal, ProposalOutcome, ProtocolError, ProtocolHandler,
    TerminationReason,
};
use crate::exchange::DeviceMessage;
use crate::ledger::{BlockchainDescriptor, LedgerError, LedgerOps};
use crate::storage::EstablishedAgreement;

/// Mock ledger.
///
/// Reports every agreement as recorded (or not), or fails every query.
pub struct MockLedger {
    recorded: bool,
    fail: bool,
    query_count: AtomicU32,
}

impl MockLedger {
    pub fn recording(recorded: bool) -> Self {
        Self {
            recorded,
            fail: false,
            query_count: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            recorded: false,
            fail: true,
            query_count: AtomicU32::new(0),
        }
    }

    pub fn query_count(&self) -> u32 {
        self.query_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerOps for MockLedger {
    async fn verify_agreement(&self, agreement_id: &str, _: &str, _: &str) -> Result<bool, LedgerError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LedgerError::Query(format!("mock failure for {}", agreement_id)));
        }
        Ok(self.recorded)
    }
}

/// Ledger lifecycle call observed by the mock handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEventCall {
    Available(BlockchainDescriptor),
    NotAvailable(BlockchainDescriptor),
    Writable(BlockchainDescriptor),
}

/// Mock protocol handler.
///
/// Proposals are parsed like the real handlers; everything else is
/// configured up front. Termination codes are distinct per reason.
pub struct MockProtocolHandler {
    protocol: AgreementProtocol,
    ledger: Option<Arc<MockLedger>>,
    available: AtomicBool,
    verifiable: bool,
    blockchain: (String, String),
    outcome: ProposalOutcome,
    initialized: AtomicU32,
    validate_count: AtomicU32,
    handle_count: AtomicU32,
    ledger_events: Mutex<Vec<LedgerEventCall>>,
}

impl MockProtocolHandler {
    pub fn new(protocol: AgreementProtocol) -> Self {
        Self {
            protocol,
            ledger: Some(Arc::new(MockLedger::recording(true))),
            available: AtomicBool::new(true),
            verifiable: true,
            blockchain: (String::new(), String::new()),
            outcome: ProposalOutcome::Rejected,
            initialized: AtomicU32::new(0),
            validate_count: AtomicU32::new(0),
            handle_count: AtomicU32::new(0),
            ledger_events: Mutex::new(Vec::new()),
        }
    }

    /// Set the ledger ops handed out; `None` simulates "not verifiable now".
    pub fn with_ledger(mut self, ledger: Option<Arc<MockLedger>>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    pub fn with_verifiable(mut self, verifiable: bool) -> Self {
        self.verifiable = verifiable;
        self
    }

    /// Ledger instance reported for every agreement.
    pub fn with_blockchain(mut self, bc_type: &str, bc_name: &str) -> Self {
        self.blockchain = (bc_type.to_string(), bc_name.to_string());
        self
    }

    /// Value returned from `handle_proposal_message`.
    pub fn with_outcome(mut self, outcome: ProposalOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn initialize_count(&self) -> u32 {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn validate_count(&self) -> u32 {
        self.validate_count.load(Ordering::SeqCst)
    }

    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::SeqCst)
    }

    pub fn ledger_events(&self) -> Vec<LedgerEventCall> {
        self.ledger_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: LedgerEventCall) {
        if let Ok(mut events) = self.ledger_events.lock() {
            events.push(call);
        }
    }
}

impl ProtocolHandler for MockProtocolHandler {
    fn protocol(&self) -> AgreementProtocol {
        self.protocol
    }

    fn initialize(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn agreement_protocol_handler(&self, _bc_type: &str, _bc_name: &str) -> Option<Arc<dyn LedgerOps>> {
        self.ledger.clone().map(|l| l as Arc<dyn LedgerOps>)
    }

    fn validate_proposal(&self, raw: &str) -> Result<Proposal, ProtocolError> {
        self.validate_count.fetch_add(1, Ordering::SeqCst);
        parse_proposal(raw, self.protocol)
    }

    fn demarshal_proposal(&self, stored: &str) -> Result<Proposal, ProtocolError> {
        parse_proposal(stored, self.protocol)
    }

    fn handle_proposal_message(&self, _proposal: &Proposal, _raw: &str, _msg: &DeviceMessage) -> ProposalOutcome {
        self.handle_count.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    fn is_blockchain_client_available(&self, _bc_type: &str, _bc_name: &str) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn is_agreement_verifiable(&self, _agreement: &EstablishedAgreement) -> bool {
        self.verifiable
    }

    fn get_known_blockchain(&self, _agreement: &EstablishedAgreement) -> (String, String) {
        self.blockchain.clone()
    }

    fn termination_code(&self, reason: TerminationReason) -> u32 {
        match reason {
            TerminationReason::PolicyChanged => 1,
            TerminationReason::PolicyRemoved => 2,
            TerminationReason::LedgerCancelled => 3,
        }
    }

    fn set_blockchain_client_available(&self, descriptor: &BlockchainDescriptor) {
        self.available.store(true, Ordering::SeqCst);
        self.record(LedgerEventCall::Available(descriptor.clone()));
    }

    fn set_blockchain_client_not_available(&self, descriptor: &BlockchainDescriptor) {
        self.available.store(false, Ordering::SeqCst);
        self.record(LedgerEventCall::NotAvailable(descriptor.clone()));
    }

    fn set_blockchain_writable(&self, descriptor: &BlockchainDescriptor) {
        self.record(LedgerEventCall::Writable(descriptor.clone()));
    }
}
