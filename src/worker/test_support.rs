//! Worker fixtures shared by the worker tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AgreementWorker, HandlerFactory, WorkerHandle};
use crate::config::Config;
use crate::events::OutboundEvent;
use crate::exchange::mock::MockExchange;
use crate::policy::tests::sample_policy;
use crate::policy::{Policy, PolicyManager};
use crate::protocol::mock::MockProtocolHandler;
use crate::protocol::{AgreementProtocol, HandlerContext, ProtocolHandler};
use crate::storage::{AgreementStore, EstablishedAgreement, ExchangeDevice, SqliteStore};

pub(crate) const DEVICE_ID: &str = "dev-1";
pub(crate) const POLICY: &str = "netspeed";

pub(crate) struct HarnessBuilder {
    exchange: MockExchange,
    basic: MockProtocolHandler,
    citizen: MockProtocolHandler,
    registered: bool,
}

pub(crate) fn builder() -> HarnessBuilder {
    HarnessBuilder {
        exchange: MockExchange::new(DEVICE_ID),
        basic: MockProtocolHandler::new(AgreementProtocol::Basic),
        citizen: MockProtocolHandler::new(AgreementProtocol::CitizenScientist),
        registered: true,
    }
}

impl HarnessBuilder {
    pub(crate) fn exchange(mut self, exchange: MockExchange) -> Self {
        self.exchange = exchange;
        self
    }

    pub(crate) fn basic(mut self, handler: MockProtocolHandler) -> Self {
        self.basic = handler;
        self
    }

    pub(crate) fn citizen(mut self, handler: MockProtocolHandler) -> Self {
        self.citizen = handler;
        self
    }

    /// Start without a stored device record.
    pub(crate) fn unregistered(mut self) -> Self {
        self.registered = false;
        self
    }

    pub(crate) fn build(self) -> (AgreementWorker, Harness) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        if self.registered {
            store
                .save_exchange_device(&ExchangeDevice {
                    id: DEVICE_ID.to_string(),
                    token: "tok".to_string(),
                    name: "dev-name".to_string(),
                })
                .unwrap();
        }

        let policy_manager = Arc::new(PolicyManager::new());
        policy_manager.add_policy(sample_policy(POLICY)).unwrap();

        let exchange = Arc::new(self.exchange);
        let basic = Arc::new(self.basic);
        let citizen = Arc::new(self.citizen);

        let factory_basic = basic.clone();
        let factory_citizen = citizen.clone();
        let factory: HandlerFactory = Arc::new(move |protocol: AgreementProtocol, _ctx: &HandlerContext| {
            let handler: Arc<dyn ProtocolHandler> = match protocol {
                AgreementProtocol::Basic => factory_basic.clone(),
                AgreementProtocol::CitizenScientist => factory_citizen.clone(),
            };
            handler
        });

        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (worker, handle) = AgreementWorker::new(
            Arc::new(Config::default()),
            store.clone(),
            policy_manager.clone(),
            exchange.clone(),
            outbound_tx,
        )
        .unwrap();

        (
            worker.with_handler_factory(factory),
            Harness {
                handle,
                outbound,
                exchange,
                store,
                policy_manager,
                basic,
                citizen,
            },
        )
    }
}

pub(crate) struct Harness {
    pub(crate) handle: WorkerHandle,
    pub(crate) outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    pub(crate) exchange: Arc<MockExchange>,
    pub(crate) store: Arc<SqliteStore>,
    pub(crate) policy_manager: Arc<PolicyManager>,
    pub(crate) basic: Arc<MockProtocolHandler>,
    pub(crate) citizen: Arc<MockProtocolHandler>,
}

impl Harness {
    pub(crate) fn drain_outbound(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    pub(crate) fn save(&self, agreement: &EstablishedAgreement) {
        self.store.save_agreement(agreement).unwrap();
    }

    pub(crate) fn local_ids(&self) -> Vec<String> {
        let protocols: Vec<String> = AgreementProtocol::all()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        let mut ids: Vec<String> = self
            .store
            .find_agreements(&protocols, &[crate::storage::AgreementFilter::Unarchived])
            .unwrap()
            .into_iter()
            .map(|a| a.agreement_id)
            .collect();
        ids.sort();
        ids
    }
}

/// Agreement ids of the cancellations among `events`, with their reasons.
pub(crate) fn cancellations(events: &[OutboundEvent]) -> Vec<(String, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::AgreementCancelation {
                agreement_id,
                reason,
                ..
            } => Some((agreement_id.clone(), *reason)),
            _ => None,
        })
        .collect()
}

pub(crate) fn ledger_requests(events: &[OutboundEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::NewBlockchainClient { bc_type, bc_name, .. } => {
                Some((bc_type.clone(), bc_name.clone()))
            }
            _ => None,
        })
        .collect()
}

/// Proposal JSON as a handler for `protocol` would store it.
pub(crate) fn proposal_for(agreement_id: &str, protocol: AgreementProtocol, policy: &Policy) -> String {
    serde_json::json!({
        "type": "proposal",
        "protocol": protocol.name(),
        "agreementId": agreement_id,
        "producerPolicy": serde_json::to_string(policy).unwrap(),
        "address": "0xabc",
        "signature": "sig",
        "deployment": "{\"services\":{}}",
    })
    .to_string()
}

/// An accepted, not yet finalized agreement made under `policy`.
pub(crate) fn accepted(agreement_id: &str, protocol: AgreementProtocol, policy: &Policy) -> EstablishedAgreement {
    let mut ag = EstablishedAgreement::new(agreement_id, protocol.name());
    ag.policy_name = policy.name().to_string();
    ag.creation_time = 100;
    ag.accepted_time = 100;
    ag.counterparty_address = "0xabc".to_string();
    ag.proposal_sig = "sig".to_string();
    ag.proposal = proposal_for(agreement_id, protocol, policy);
    ag.current_deployment = "{\"services\":{}}".to_string();
    ag
}

pub(crate) fn finalized(agreement_id: &str, protocol: AgreementProtocol, policy: &Policy) -> EstablishedAgreement {
    let mut ag = accepted(agreement_id, protocol, policy);
    ag.finalized_time = 200;
    ag
}

pub(crate) fn current_policy() -> Policy {
    sample_policy(POLICY)
}
