//! Events exchanged with the rest of the node
//!
//! Inbound events are produced by other subsystems (registration, policy
//! watcher, blockchain and container workers, the exchange message poller)
//! and translated by the worker into commands. Outbound events are what the
//! agreement worker asks of other subsystems.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ledger::BlockchainDescriptor;

/// Events the agreement worker reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The device was registered with the exchange
    EdgeRegistered { token: String },
    /// A policy file appeared in the policy directory
    PolicyCreated { policy_file: PathBuf },
    BlockchainClientInitialized(BlockchainDescriptor),
    BlockchainClientStopping(BlockchainDescriptor),
    /// The device's account on a ledger instance can now record agreements
    AccountFunded(BlockchainDescriptor),
    /// A message pulled from the device's exchange queue. `exchange_message`
    /// is the JSON envelope, `protocol_message` its decrypted payload.
    ExchangeDeviceMessage {
        exchange_message: String,
        protocol_message: String,
    },
    /// The container subsystem finished reconciling running workloads
    DeviceContainersSynced { completed: bool },
}

/// Events emitted by the agreement worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundEvent {
    /// Ask governance to cancel an agreement
    AgreementCancelation {
        reason: u32,
        protocol: String,
        agreement_id: String,
        deployment: String,
    },
    /// Ask the blockchain worker to start a client for one instance
    NewBlockchainClient {
        bc_type: String,
        bc_name: String,
        exchange_url: String,
        device_id: String,
        device_token: String,
    },
    DeviceAgreementsSynced { completed: bool },
}
