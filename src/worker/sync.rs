//! Startup reconciliation between the local agreement store, the exchange
//! and the ledgers.
//!
//! Runs once, after container sync and before the first command. Store and
//! exchange listing failures, and ledger query errors, abort startup; any
//! other per-agreement problem is logged and the agreement skipped. Running
//! it again converges to the same state and requests nothing twice.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, error, info, warn};

use super::{AgreementWorker, WorkerError};
use crate::events::OutboundEvent;
use crate::exchange::DeviceAgreement;
use crate::policy::demarshal_policy;
use crate::protocol::{ProtocolHandler, TerminationReason};
use crate::storage::{AgreementFilter, EstablishedAgreement};

pub const STATE_FINALIZED: &str = "Finalized Agreement";
pub const STATE_ACCEPTED: &str = "Agree to proposal";
pub const STATE_UNKNOWN: &str = "unknown";

/// Exchange state string for a local agreement.
pub fn agreement_state(agreement: &EstablishedAgreement) -> &'static str {
    if agreement.finalized_time != 0 {
        STATE_FINALIZED
    } else if agreement.accepted_time != 0 {
        STATE_ACCEPTED
    } else {
        STATE_UNKNOWN
    }
}

/// Whether an agreement is still valid as far as its ledger knows.
///
/// Anything that prevents asking the ledger counts as valid; only a ledger
/// that answers "not recorded" for a finalized, live agreement makes it
/// invalid. A failed ledger query is an error.
pub(crate) async fn verify_agreement(
    agreement: &EstablishedAgreement,
    handler: &dyn ProtocolHandler,
    bc_type: &str,
    bc_name: &str,
) -> Result<bool, WorkerError> {
    let agreement_id = agreement.agreement_id.as_str();

    if agreement.accepted_time == 0 {
        return Ok(true);
    }
    if !handler.is_blockchain_client_available(bc_type, bc_name)
        || !handler.is_agreement_verifiable(agreement)
    {
        warn!(agreement_id, bc_type, bc_name, "Unable to verify agreement, protocol handler is not ready");
        return Ok(true);
    }

    let ledger = match handler.agreement_protocol_handler(bc_type, bc_name) {
        Some(ledger) => ledger,
        None => {
            warn!(agreement_id, bc_type, bc_name, "Unable to verify agreement, no ledger access");
            return Ok(true);
        }
    };

    let recorded = ledger
        .verify_agreement(agreement_id, &agreement.counterparty_address, &agreement.proposal_sig)
        .await
        .map_err(|error| WorkerError::Ledger {
            agreement_id: agreement_id.to_string(),
            error,
        })?;

    if !recorded && agreement.finalized_time != 0 && agreement.terminated_time == 0 {
        info!(agreement_id, "Finalized agreement is not on the ledger, cancelling");
        return Ok(false);
    }
    Ok(true)
}

impl AgreementWorker {
    pub(crate) async fn sync_on_init(&mut self) -> Result<(), WorkerError> {
        info!(device_id = %self.device_id, "Beginning agreement sync");

        let protocols = self.policy_manager.supported_protocols();
        let registry = self.exchange.device_agreements().await?;

        // Exchange records with no local agreement block new agreements
        let mut registry_ids: Vec<&String> = registry.keys().collect();
        registry_ids.sort();
        for agreement_id in registry_ids {
            let filters = [
                AgreementFilter::Id(agreement_id.clone()),
                AgreementFilter::Unarchived,
            ];
            match self.store.find_agreements(&protocols, &filters) {
                Ok(found) if found.is_empty() => {
                    info!(agreement_id = %agreement_id, "Agreement in exchange is not in local store, deleting it");
                    if let Err(e) = self.exchange.delete_agreement(agreement_id).await {
                        error!(agreement_id = %agreement_id, error = %e, "Error deleting agreement from exchange");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(agreement_id = %agreement_id, error = %e, "Error searching for exchange agreement");
                }
            }
        }

        let agreements = self
            .store
            .find_agreements(&protocols, &[AgreementFilter::Unarchived])?;

        let mut needed_ledgers = BTreeSet::new();
        for agreement in &agreements {
            let agreement_id = agreement.agreement_id.as_str();
            let handler = match self.handlers.by_name(&agreement.agreement_protocol).cloned() {
                Some(h) => h,
                None => {
                    warn!(agreement_id, protocol = %agreement.agreement_protocol, "No handler for agreement protocol");
                    continue;
                }
            };

            let (bc_type, bc_name) = handler.get_known_blockchain(agreement);
            if !bc_type.is_empty() {
                needed_ledgers.insert((bc_type.clone(), bc_name.clone()));
            }

            // Restarted part way through termination
            if agreement.is_terminated() {
                if let Err(e) = self
                    .store
                    .force_terminate(agreement_id, &agreement.agreement_protocol)
                {
                    error!(agreement_id, error = %e, "Unable to set force termination");
                }
                self.request_cancellation(agreement, agreement.terminated_reason);
                continue;
            }

            if !verify_agreement(agreement, handler.as_ref(), &bc_type, &bc_name).await? {
                let code = handler.termination_code(TerminationReason::LedgerCancelled);
                self.request_cancellation(agreement, code);
                continue;
            }

            self.reconcile_policy(agreement, handler.as_ref(), &registry).await;
        }

        for (bc_type, bc_name) in needed_ledgers {
            self.request_ledger_client(bc_type, bc_name);
        }

        info!(count = agreements.len(), "Agreement sync completed");
        Ok(())
    }

    /// Restore policy counts for an agreement made under a still current
    /// policy, or cancel it, and put it back in the exchange if missing.
    async fn reconcile_policy(
        &mut self,
        agreement: &EstablishedAgreement,
        handler: &dyn ProtocolHandler,
        registry: &HashMap<String, DeviceAgreement>,
    ) {
        let agreement_id = agreement.agreement_id.as_str();

        let proposal = match handler.demarshal_proposal(&agreement.proposal) {
            Ok(p) => p,
            Err(e) => {
                error!(agreement_id, error = %e, "Unable to demarshal proposal");
                return;
            }
        };
        let policy = match demarshal_policy(proposal.producer_policy()) {
            Ok(p) => p,
            Err(e) => {
                error!(agreement_id, error = %e, "Unable to demarshal policy");
                return;
            }
        };

        let existing = match self.policy_manager.get_policy(policy.name()) {
            Some(p) => p,
            None => {
                warn!(agreement_id, policy = %policy.name(), "Agreement policy no longer exists");
                let code = handler.termination_code(TerminationReason::PolicyRemoved);
                self.request_cancellation(agreement, code);
                return;
            }
        };

        if let Err(e) = self.policy_manager.matches_mine(&policy) {
            warn!(agreement_id, error = %e, "Agreement policy has changed");
            let code = handler.termination_code(TerminationReason::PolicyChanged);
            self.request_cancellation(agreement, code);
            return;
        }

        // Same counts the agreement held before the restart
        let restored = self
            .policy_manager
            .attempting_agreement(&existing, agreement_id)
            .and_then(|()| {
                if agreement.finalized_time != 0 {
                    self.policy_manager.final_agreement(&existing, agreement_id)
                } else {
                    Ok(())
                }
            });
        match restored {
            Ok(()) => debug!(agreement_id, policy = %existing.name(), "Restored policy agreement count"),
            Err(e) => error!(agreement_id, error = %e, "Cannot update agreement count"),
        }

        if agreement.is_live() && !registry.contains_key(agreement_id) {
            let state = agreement_state(agreement);
            info!(agreement_id, state, "Agreement missing from exchange, adding it back");
            if let Err(e) = self
                .exchange
                .set_agreement_state(agreement_id, policy.primary_spec_ref(), state)
                .await
            {
                error!(agreement_id, error = %e, "Unable to record agreement state in exchange");
            }
        }
    }

    fn request_cancellation(&mut self, agreement: &EstablishedAgreement, reason: u32) {
        if !self.cancelled.insert(agreement.agreement_id.clone()) {
            debug!(agreement_id = %agreement.agreement_id, "Cancellation already requested");
            return;
        }
        info!(agreement_id = %agreement.agreement_id, reason, "Requesting agreement cancellation");
        self.emit(OutboundEvent::AgreementCancelation {
            reason,
            protocol: agreement.agreement_protocol.clone(),
            agreement_id: agreement.agreement_id.clone(),
            deployment: agreement.current_deployment.clone(),
        });
    }

    fn request_ledger_client(&mut self, bc_type: String, bc_name: String) {
        if !self.requested_ledgers.insert((bc_type.clone(), bc_name.clone())) {
            return;
        }
        info!(bc_type = %bc_type, bc_name = %bc_name, "Requesting blockchain client");
        self.emit(OutboundEvent::NewBlockchainClient {
            bc_type,
            bc_name,
            exchange_url: self.config.exchange.url.clone(),
            device_id: self.device_id.clone(),
            device_token: self.device_token.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::*;
    use super::*;
    use crate::exchange::mock::{ExchangeCall, MockExchange};
    use crate::exchange::{DeviceMessage, ExchangeError};
    use crate::ledger::BlockchainDescriptor;
    use crate::policy::tests::sample_policy;
    use crate::protocol::mock::{MockLedger, MockProtocolHandler};
    use crate::protocol::AgreementProtocol::{Basic, CitizenScientist};
    use crate::protocol::{BasicProtocolHandler, ProposalOutcome};
    use crate::storage::AgreementStore;

    async fn synced(worker: &mut AgreementWorker) {
        worker.create_handlers();
        worker.sync_on_init().await.unwrap();
    }

    #[test]
    fn test_agreement_state_strings() {
        let policy = current_policy();
        assert_eq!(agreement_state(&finalized("a", Basic, &policy)), "Finalized Agreement");
        assert_eq!(agreement_state(&accepted("a", Basic, &policy)), "Agree to proposal");
        assert_eq!(agreement_state(&EstablishedAgreement::new("a", "Basic")), "unknown");
    }

    #[tokio::test]
    async fn test_exchange_only_agreements_are_deleted() {
        let exchange = MockExchange::new(DEVICE_ID)
            .with_agreement("orphan", STATE_FINALIZED)
            .with_agreement("old", STATE_ACCEPTED)
            .with_agreement("ag-1", STATE_ACCEPTED);
        let (mut worker, mut h) = builder().exchange(exchange).build();
        h.save(&accepted("ag-1", Basic, &current_policy()));

        // Archived records do not count as local
        let mut archived = accepted("old", Basic, &current_policy());
        archived.archived = true;
        h.save(&archived);

        synced(&mut worker).await;

        assert_eq!(h.exchange.agreement_ids(), vec!["ag-1".to_string()]);
        assert!(h.exchange.calls().contains(&ExchangeCall::DeleteAgreement("orphan".into())));
        assert!(h.exchange.calls().contains(&ExchangeCall::DeleteAgreement("old".into())));
        assert_eq!(h.local_ids(), vec!["ag-1".to_string()]);
        assert!(cancellations(&h.drain_outbound()).is_empty());
    }

    #[tokio::test]
    async fn test_registry_is_subset_of_local_after_sync() {
        let exchange = MockExchange::new(DEVICE_ID)
            .with_agreement("x1", STATE_ACCEPTED)
            .with_agreement("ag-2", STATE_FINALIZED);
        let (mut worker, h) = builder().exchange(exchange).build();
        h.save(&accepted("ag-1", Basic, &current_policy()));
        h.save(&finalized("ag-2", CitizenScientist, &current_policy()));

        synced(&mut worker).await;

        let local = h.local_ids();
        for id in h.exchange.agreement_ids() {
            assert!(local.contains(&id), "{} in exchange but not local", id);
        }
        // Live local agreements are all in the exchange again
        assert_eq!(h.exchange.agreement_ids(), vec!["ag-1".to_string(), "ag-2".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_live_agreement_is_readvertised_with_state() {
        let (mut worker, h) = builder().build();
        h.save(&accepted("ag-1", Basic, &current_policy()));
        h.save(&finalized("ag-2", Basic, &current_policy()));

        synced(&mut worker).await;

        let spec_ref = current_policy().primary_spec_ref().to_string();
        let calls = h.exchange.mutating_calls();
        assert!(calls.contains(&ExchangeCall::SetAgreementState {
            agreement_id: "ag-1".into(),
            microservice: spec_ref.clone(),
            state: STATE_ACCEPTED.into(),
        }));
        assert!(calls.contains(&ExchangeCall::SetAgreementState {
            agreement_id: "ag-2".into(),
            microservice: spec_ref,
            state: STATE_FINALIZED.into(),
        }));
    }

    #[tokio::test]
    async fn test_finalized_agreement_missing_from_ledger_is_cancelled() {
        let ledger = Arc::new(MockLedger::recording(false));
        let citizen = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(ledger.clone()))
            .with_blockchain("ethereum", "bluehorizon");
        let (mut worker, mut h) = builder().citizen(citizen).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));
        // Accepted but not finalized: absence on the ledger is expected
        h.save(&accepted("ag-2", CitizenScientist, &current_policy()));

        synced(&mut worker).await;

        let events = h.drain_outbound();
        assert_eq!(cancellations(&events), vec![("ag-1".to_string(), 3)]);
        assert_eq!(ledger.query_count(), 2);
        // A cancelled agreement does not hold a policy count
        assert_eq!(h.policy_manager.attempt_count(POLICY), 1);
    }

    #[tokio::test]
    async fn test_unverifiable_agreements_are_assumed_valid() {
        let ledger = Arc::new(MockLedger::recording(false));
        let unavailable = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(ledger.clone()))
            .with_available(false);
        let (mut worker, mut h) = builder().citizen(unavailable).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));
        synced(&mut worker).await;
        assert!(cancellations(&h.drain_outbound()).is_empty());
        assert_eq!(ledger.query_count(), 0);

        let no_ledger_ops = MockProtocolHandler::new(CitizenScientist).with_ledger(None);
        let (mut worker, mut h) = builder().citizen(no_ledger_ops).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));
        synced(&mut worker).await;
        assert!(cancellations(&h.drain_outbound()).is_empty());

        let not_verifiable = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(ledger.clone()))
            .with_verifiable(false);
        let (mut worker, mut h) = builder().citizen(not_verifiable).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));
        synced(&mut worker).await;
        assert!(cancellations(&h.drain_outbound()).is_empty());
        assert_eq!(ledger.query_count(), 0);
    }

    #[tokio::test]
    async fn test_ledger_query_error_is_fatal() {
        let citizen = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(Arc::new(MockLedger::failing())));
        let (mut worker, h) = builder().citizen(citizen).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));

        worker.create_handlers();
        let err = worker.sync_on_init().await.unwrap_err();
        assert!(matches!(err, WorkerError::Ledger { ref agreement_id, .. } if agreement_id == "ag-1"));
    }

    #[tokio::test]
    async fn test_exchange_listing_failure_is_fatal() {
        let exchange = MockExchange::new(DEVICE_ID).fail_agreement_list(ExchangeError::Application {
            status: 401,
            body: "bad credentials".into(),
        });
        let (mut worker, _h) = builder().exchange(exchange).build();
        worker.create_handlers();
        assert!(matches!(
            worker.sync_on_init().await,
            Err(WorkerError::Exchange(ExchangeError::Application { status: 401, .. }))
        ));
    }

    #[tokio::test]
    async fn test_terminated_record_is_force_terminated_and_cancelled_again() {
        let (mut worker, mut h) = builder().build();
        let mut ag = finalized("ag-1", Basic, &current_policy());
        ag.terminated_time = 300;
        ag.terminated_reason = 42;
        h.save(&ag);

        synced(&mut worker).await;

        let events = h.drain_outbound();
        assert_eq!(
            events.first(),
            Some(&OutboundEvent::AgreementCancelation {
                reason: 42,
                protocol: "Basic".into(),
                agreement_id: "ag-1".into(),
                deployment: ag.current_deployment.clone(),
            })
        );
        let stored = h
            .store
            .find_agreements(&["Basic".to_string()], &[AgreementFilter::Id("ag-1".into())])
            .unwrap();
        assert_ne!(stored[0].force_terminated_time, 0);
        // Terminated agreements are not re-added to the exchange or counted
        assert!(h.exchange.mutating_calls().is_empty());
        assert_eq!(h.policy_manager.attempt_count(POLICY), 0);
    }

    #[tokio::test]
    async fn test_terminated_record_skips_ledger_verification() {
        let ledger = Arc::new(MockLedger::failing());
        let citizen = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(ledger.clone()))
            .with_blockchain("ethereum", "bluehorizon");
        let (mut worker, mut h) = builder().citizen(citizen).build();
        let mut ag = finalized("ag-1", CitizenScientist, &current_policy());
        ag.terminated_time = 300;
        ag.terminated_reason = 9;
        h.save(&ag);

        // A ledger query would fail the sync
        worker.create_handlers();
        worker.sync_on_init().await.unwrap();

        assert_eq!(ledger.query_count(), 0);
        let events = h.drain_outbound();
        assert_eq!(cancellations(&events), vec![("ag-1".to_string(), 9)]);
        // The instance is still needed to finish the termination
        assert_eq!(
            ledger_requests(&events),
            vec![("ethereum".to_string(), "bluehorizon".to_string())]
        );
    }

    #[tokio::test]
    async fn test_restart_restores_the_counts_acceptance_took() {
        let (before, h1) = builder().build();
        let handler = BasicProtocolHandler::new(before.handler_context());
        let raw = proposal_for("ag-1", Basic, &current_policy());
        let proposal = handler.validate_proposal(&raw).unwrap();
        assert!(matches!(
            handler.handle_proposal_message(&proposal, &raw, &DeviceMessage::default()),
            ProposalOutcome::Accepted { .. }
        ));
        let accepted_counts = (
            h1.policy_manager.attempt_count(POLICY),
            h1.policy_manager.final_count(POLICY),
        );
        assert_eq!(accepted_counts, (1, 0));

        let (mut after, h2) = builder().build();
        for ag in h1.store.find_agreements(&["Basic".to_string()], &[]).unwrap() {
            h2.save(&ag);
        }
        synced(&mut after).await;

        assert_eq!(
            (h2.policy_manager.attempt_count(POLICY), h2.policy_manager.final_count(POLICY)),
            accepted_counts
        );
    }

    #[tokio::test]
    async fn test_policy_counts_restored_for_live_agreements() {
        let (mut worker, h) = builder().build();
        h.save(&accepted("ag-1", Basic, &current_policy()));
        h.save(&finalized("ag-2", CitizenScientist, &current_policy()));
        let mut never_accepted = accepted("ag-3", Basic, &current_policy());
        never_accepted.accepted_time = 0;
        h.save(&never_accepted);

        synced(&mut worker).await;

        assert_eq!(h.policy_manager.attempt_count(POLICY), 3);
        // Only ag-2 was finalized
        assert_eq!(h.policy_manager.final_count(POLICY), 1);
        // Never accepted agreements are not put in the exchange
        assert_eq!(h.exchange.agreement_ids(), vec!["ag-1".to_string(), "ag-2".to_string()]);
    }

    #[tokio::test]
    async fn test_removed_and_changed_policies_cancel_with_distinct_reasons() {
        let (mut worker, mut h) = builder().build();
        h.save(&accepted("removed", Basic, &sample_policy("retired")));
        let mut changed = current_policy();
        changed.properties.pop();
        h.save(&accepted("changed", Basic, &changed));

        synced(&mut worker).await;

        let mut cancelled = cancellations(&h.drain_outbound());
        cancelled.sort();
        assert_eq!(
            cancelled,
            vec![("changed".to_string(), 1), ("removed".to_string(), 2)]
        );
        assert_eq!(h.policy_manager.attempt_count(POLICY), 0);
        assert!(h.exchange.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_proposal_is_skipped() {
        let (mut worker, mut h) = builder().build();
        let mut ag = accepted("ag-1", Basic, &current_policy());
        ag.proposal = "not json".into();
        h.save(&ag);
        h.save(&accepted("ag-2", Basic, &current_policy()));

        synced(&mut worker).await;

        assert!(cancellations(&h.drain_outbound()).is_empty());
        assert_eq!(h.policy_manager.attempt_count(POLICY), 1);
        assert_eq!(h.exchange.agreement_ids(), vec!["ag-2".to_string()]);
    }

    #[tokio::test]
    async fn test_one_ledger_request_per_instance() {
        let citizen = MockProtocolHandler::new(CitizenScientist).with_blockchain("ethereum", "bluehorizon");
        let (mut worker, mut h) = builder().citizen(citizen).build();
        h.save(&accepted("ag-1", CitizenScientist, &current_policy()));
        h.save(&accepted("ag-2", CitizenScientist, &current_policy()));
        // Basic agreements need no ledger
        h.save(&accepted("ag-3", Basic, &current_policy()));

        synced(&mut worker).await;

        let events = h.drain_outbound();
        assert_eq!(
            ledger_requests(&events),
            vec![("ethereum".to_string(), "bluehorizon".to_string())]
        );
        assert!(events.contains(&OutboundEvent::NewBlockchainClient {
            bc_type: "ethereum".into(),
            bc_name: "bluehorizon".into(),
            exchange_url: worker.config.exchange.url.clone(),
            device_id: DEVICE_ID.into(),
            device_token: "tok".into(),
        }));
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let exchange = MockExchange::new(DEVICE_ID).with_agreement("orphan", STATE_ACCEPTED);
        let citizen = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(Arc::new(MockLedger::recording(false))))
            .with_blockchain("ethereum", "bluehorizon");
        let (mut worker, mut h) = builder().exchange(exchange).citizen(citizen).build();
        h.save(&accepted("ag-1", Basic, &current_policy()));
        h.save(&finalized("ag-2", CitizenScientist, &current_policy()));
        let mut terminated = accepted("ag-3", Basic, &current_policy());
        terminated.terminated_time = 10;
        terminated.terminated_reason = 7;
        h.save(&terminated);

        synced(&mut worker).await;
        let first = h.drain_outbound();
        assert_eq!(cancellations(&first).len(), 2);
        assert_eq!(ledger_requests(&first).len(), 1);
        let attempts = h.policy_manager.attempt_count(POLICY);
        let finals = h.policy_manager.final_count(POLICY);
        let registry = h.exchange.agreement_ids();

        h.exchange.clear_calls();
        worker.sync_on_init().await.unwrap();

        assert!(h.drain_outbound().is_empty());
        assert!(h.exchange.mutating_calls().is_empty());
        assert_eq!(h.policy_manager.attempt_count(POLICY), attempts);
        assert_eq!(h.policy_manager.final_count(POLICY), finals);
        assert_eq!(h.exchange.agreement_ids(), registry);
    }

    #[tokio::test]
    async fn test_verify_never_accepted_is_valid_without_ledger_query() {
        let ledger = Arc::new(MockLedger::failing());
        let handler = MockProtocolHandler::new(CitizenScientist).with_ledger(Some(ledger.clone()));
        let ag = EstablishedAgreement::new("ag-1", "Citizen Scientist");
        assert!(verify_agreement(&ag, &handler, "ethereum", "bluehorizon").await.unwrap());
        assert_eq!(ledger.query_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_recorded_or_terminated_is_valid() {
        let policy = current_policy();
        let recorded = MockProtocolHandler::new(CitizenScientist);
        assert!(verify_agreement(&finalized("a", CitizenScientist, &policy), &recorded, "e", "b")
            .await
            .unwrap());

        let missing = MockProtocolHandler::new(CitizenScientist)
            .with_ledger(Some(Arc::new(MockLedger::recording(false))));
        let mut ended = finalized("a", CitizenScientist, &policy);
        ended.terminated_time = 5;
        assert!(verify_agreement(&ended, &missing, "e", "b").await.unwrap());
        assert!(!verify_agreement(&finalized("a", CitizenScientist, &policy), &missing, "e", "b")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ledger_availability_from_events_enables_verification() {
        let citizen = MockProtocolHandler::new(CitizenScientist)
            .with_available(false)
            .with_ledger(Some(Arc::new(MockLedger::recording(false))));
        let (mut worker, mut h) = builder().citizen(citizen).build();
        h.save(&finalized("ag-1", CitizenScientist, &current_policy()));
        worker.create_handlers();

        worker.broadcast(&BlockchainDescriptor::new("ethereum", "bluehorizon"), |handler, desc| {
            handler.set_blockchain_client_available(desc)
        });
        worker.sync_on_init().await.unwrap();

        assert_eq!(cancellations(&h.drain_outbound()), vec![("ag-1".to_string(), 3)]);
    }
}
