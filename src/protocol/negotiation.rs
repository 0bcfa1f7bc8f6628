//! Proposal acceptance shared by the protocol handlers.

use tracing::{debug, error, info, warn};

use super::{AgreementProtocol, HandlerContext, Proposal, ProposalOutcome};
use crate::exchange::DeviceMessage;
use crate::policy::demarshal_policy;
use crate::storage::{now, AgreementFilter, EstablishedAgreement};

/// Decide on a proposal and persist the agreement if accepted.
///
/// Only a failure to search or record agreements defers the message; every
/// other refusal finishes with it.
pub(crate) fn decide_on_proposal(
    ctx: &HandlerContext,
    protocol: AgreementProtocol,
    proposal: &Proposal,
    raw: &str,
    msg: &DeviceMessage,
) -> ProposalOutcome {
    let agreement_id = proposal.agreement_id.as_str();

    let policy = match demarshal_policy(proposal.producer_policy()) {
        Ok(p) => p,
        Err(e) => {
            warn!(agreement_id, msg_id = msg.msg_id, error = %e, "Rejecting proposal with unreadable policy");
            return ProposalOutcome::Rejected;
        }
    };

    let existing = match ctx.policy_manager.get_policy(policy.name()) {
        Some(p) => p,
        None => {
            info!(agreement_id, policy = %policy.name(), "Rejecting proposal for unknown policy");
            return ProposalOutcome::Rejected;
        }
    };

    if let Err(e) = ctx.policy_manager.matches_mine(&policy) {
        info!(agreement_id, error = %e, "Rejecting proposal against outdated policy");
        return ProposalOutcome::Rejected;
    }

    if !existing.supports_protocol(protocol.name()) {
        info!(
            agreement_id,
            policy = %existing.name(),
            protocol = %protocol,
            "Rejecting proposal, policy does not allow this protocol"
        );
        return ProposalOutcome::Rejected;
    }

    let protocols = vec![protocol.name().to_string()];
    match ctx
        .store
        .find_agreements(&protocols, &[AgreementFilter::Id(agreement_id.to_string())])
    {
        Ok(found) if !found.is_empty() => {
            debug!(agreement_id, "Proposal already recorded, ignoring duplicate");
            return ProposalOutcome::Rejected;
        }
        Ok(_) => {}
        Err(e) => {
            error!(agreement_id, error = %e, "Unable to search agreements, will retry proposal");
            return ProposalOutcome::Deferred;
        }
    }

    // The final count is taken when the agreement is finalized, not here
    if let Err(e) = ctx.policy_manager.attempting_agreement(&existing, agreement_id) {
        info!(agreement_id, error = %e, "Rejecting proposal");
        return ProposalOutcome::Rejected;
    }

    let ts = now();
    let mut agreement = EstablishedAgreement::new(agreement_id, protocol.name());
    agreement.policy_name = existing.name().to_string();
    agreement.creation_time = ts;
    agreement.accepted_time = ts;
    agreement.counterparty_address = proposal.address.clone();
    agreement.proposal_sig = proposal.signature.clone();
    agreement.proposal = raw.to_string();
    agreement.current_deployment = proposal.deployment.clone();

    if let Err(e) = ctx.store.save_agreement(&agreement) {
        error!(agreement_id, error = %e, "Unable to record agreement, will retry proposal");
        if let Err(e) = ctx.policy_manager.cancel_agreement(&existing, agreement_id) {
            warn!(agreement_id, error = %e, "Unable to release agreement count");
        }
        return ProposalOutcome::Deferred;
    }

    info!(
        agreement_id,
        protocol = %protocol,
        counterparty = %msg.agbot_id,
        "Accepted proposal"
    );
    ProposalOutcome::Accepted {
        agreement_id: agreement_id.to_string(),
        microservice: existing.primary_spec_ref().to_string(),
    }
}
