//! Agreement worker
//!
//! Owns the device's agreement lifecycle. Inbound events are translated
//! into [`Command`]s by [`WorkerHandle::new_event`] and queued; a single
//! task drains the queue in order. Before the first command is taken the
//! worker waits for the container subsystem to finish its own sync, then
//! reconciles local agreements with the exchange and the ledgers once.
//!
//! State changes: `AwaitingContainerSync -> Initializing -> Steady -> Terminated`.

mod advertise;
pub mod command;
mod heartbeat;
mod sync;

#[cfg(test)]
mod test_support;

pub use command::{command_queue, Command, CommandReceiver, CommandSender};
pub use heartbeat::spawn_heartbeat_task;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{Event, OutboundEvent};
use crate::exchange::{DeviceMessage, Exchange, ExchangeError};
use crate::ledger::{BlockchainDescriptor, LedgerError};
use crate::policy::{read_policy_file, PolicyManager};
use crate::protocol::{
    create_handler, extract_protocol, AgreementProtocol, HandlerContext, HandlerRegistry,
    ProposalOutcome, ProtocolHandler,
};
use crate::storage::{AgreementStore, StoreError};
use sync::STATE_ACCEPTED;

/// Worker errors. Only the fatal classes ever leave [`AgreementWorker::run`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Container sync did not complete")]
    ContainerSyncFailed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Unable to verify agreement {agreement_id} on ledger: {error}")]
    Ledger {
        agreement_id: String,
        error: LedgerError,
    },

    #[error("Device is not registered with the exchange")]
    NotRegistered,

    #[error("Policy {policy} property {name} has unsupported value {value}")]
    UnsupportedProperty {
        policy: String,
        name: String,
        value: String,
    },

    #[error("Unable to marshal policy: {0}")]
    Marshal(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingContainerSync,
    Initializing,
    Steady,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::AwaitingContainerSync => "awaiting container sync",
            WorkerState::Initializing => "initializing",
            WorkerState::Steady => "steady",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Outcome reported by the container subsystem. Written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerSync {
    Pending,
    Completed,
    Failed,
}

/// Builds the handler for one protocol.
pub type HandlerFactory =
    Arc<dyn Fn(AgreementProtocol, &HandlerContext) -> Arc<dyn ProtocolHandler> + Send + Sync>;

/// Cloneable entry point used by other subsystems.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: CommandSender,
    container_sync: Arc<watch::Sender<ContainerSync>>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Translate an inbound event into a command, or record container sync.
    pub fn new_event(&self, event: Event) {
        let command = match event {
            Event::EdgeRegistered { token } => Command::DeviceRegistered { token },
            Event::PolicyCreated { policy_file } => Command::AdvertisePolicy { policy_file },
            Event::BlockchainClientInitialized(d) => Command::BlockchainClientAvailable(d),
            Event::BlockchainClientStopping(d) => Command::BlockchainClientNotAvailable(d),
            Event::AccountFunded(d) => Command::BlockchainWritable(d),
            Event::ExchangeDeviceMessage {
                exchange_message,
                protocol_message,
            } => Command::ExchangeMessage {
                exchange_message,
                protocol_message,
            },
            Event::DeviceContainersSynced { completed } => {
                let status = if completed {
                    ContainerSync::Completed
                } else {
                    ContainerSync::Failed
                };
                self.container_sync.send_replace(status);
                return;
            }
        };
        self.commands.send(command);
    }

    /// Ask the worker to stop after the command it is processing.
    pub fn terminate(&self, reason: &str) {
        self.commands.send(Command::Terminate {
            reason: reason.to_string(),
        });
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `target`. Returns false if the worker
    /// went away first.
    pub async fn wait_for_state(&self, target: WorkerState) -> bool {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

pub struct AgreementWorker {
    config: Arc<Config>,
    store: Arc<dyn AgreementStore>,
    policy_manager: Arc<PolicyManager>,
    exchange: Arc<dyn Exchange>,
    handler_factory: HandlerFactory,
    handlers: HandlerRegistry,
    device_id: String,
    device_token: String,
    commands: CommandReceiver,
    container_sync: watch::Receiver<ContainerSync>,
    state: watch::Sender<WorkerState>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    heartbeat: Option<JoinHandle<()>>,
    /// Agreements a cancellation has already been requested for
    cancelled: HashSet<String>,
    /// Ledger instances a client start has already been requested for
    requested_ledgers: HashSet<(String, String)>,
}

impl AgreementWorker {
    /// Build the worker and the handle other subsystems talk to it through.
    ///
    /// The device token is taken from the stored device record, if any.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn AgreementStore>,
        policy_manager: Arc<PolicyManager>,
        exchange: Arc<dyn Exchange>,
        outbound: mpsc::UnboundedSender<OutboundEvent>,
    ) -> Result<(Self, WorkerHandle), WorkerError> {
        let device_token = store
            .find_exchange_device()?
            .map(|d| d.token)
            .unwrap_or_default();
        if !device_token.is_empty() {
            exchange.set_token(&device_token);
        }

        let (commands_tx, commands_rx) = command_queue(config.edge.command_queue_soft_limit);
        let (sync_tx, sync_rx) = watch::channel(ContainerSync::Pending);
        let (state_tx, state_rx) = watch::channel(WorkerState::AwaitingContainerSync);

        let worker = Self {
            device_id: exchange.device_id().to_string(),
            config,
            store,
            policy_manager,
            exchange,
            handler_factory: Arc::new(create_handler),
            handlers: HandlerRegistry::new(),
            device_token,
            commands: commands_rx,
            container_sync: sync_rx,
            state: state_tx,
            outbound,
            heartbeat: None,
            cancelled: HashSet::new(),
            requested_ledgers: HashSet::new(),
        };
        let handle = WorkerHandle {
            commands: commands_tx,
            container_sync: Arc::new(sync_tx),
            state: state_rx,
        };
        Ok((worker, handle))
    }

    /// Replace how protocol handlers are built.
    pub fn with_handler_factory(mut self, factory: HandlerFactory) -> Self {
        self.handler_factory = factory;
        self
    }

    fn set_state(&self, state: WorkerState) {
        debug!(state = %state, "Agreement worker state");
        self.state.send_replace(state);
    }

    /// Run until a `Terminate` command or a fatal startup error.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(device_id = %self.device_id, "Agreement worker started");

        let result = self.startup().await;
        if let Err(e) = result {
            error!(error = %e, "Terminating, unable to complete agreement sync");
            self.stop_heartbeat();
            self.set_state(WorkerState::Terminated);
            return Err(e);
        }

        self.set_state(WorkerState::Steady);
        debug!("Waiting for commands");

        while let Some(command) = self.commands.recv().await {
            debug!(command = %command, "Received command");
            if let Command::Terminate { reason } = &command {
                info!(reason = %reason, "Agreement worker terminating");
                break;
            }
            self.dispatch(command).await;
            debug!("Handled command");
        }

        self.stop_heartbeat();
        self.set_state(WorkerState::Terminated);
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), WorkerError> {
        self.set_state(WorkerState::AwaitingContainerSync);
        self.await_container_sync().await?;
        self.set_state(WorkerState::Initializing);

        if !self.device_token.is_empty() {
            self.create_handlers();
            self.sync_on_init().await?;
            self.emit(OutboundEvent::DeviceAgreementsSynced { completed: true });
            self.start_heartbeat();
        } else {
            info!("Device not registered yet, agreement sync deferred");
        }

        if let Err(e) = self.advertise_all_policies().await {
            error!(error = %e, "Unable to advertise policies with exchange");
        }
        Ok(())
    }

    /// Block until the container subsystem reports its sync outcome.
    async fn await_container_sync(&mut self) -> Result<(), WorkerError> {
        let poll = self.config.edge.container_sync_poll();
        loop {
            let status = *self.container_sync.borrow();
            match status {
                ContainerSync::Completed => return Ok(()),
                ContainerSync::Failed => return Err(WorkerError::ContainerSyncFailed),
                ContainerSync::Pending => {
                    debug!("Waiting for container sync to finish");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            config: self.config.clone(),
            store: self.store.clone(),
            policy_manager: self.policy_manager.clone(),
            device_id: self.device_id.clone(),
            device_token: self.device_token.clone(),
        }
    }

    fn create_handlers(&mut self) {
        let ctx = self.handler_context();
        for protocol in AgreementProtocol::all() {
            let handler = (self.handler_factory)(*protocol, &ctx);
            handler.initialize();
            self.handlers.insert(handler);
        }
        info!(count = self.handlers.len(), "Agreement protocol handlers created");
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        self.heartbeat = Some(spawn_heartbeat_task(
            self.exchange.clone(),
            self.config.exchange.heartbeat_interval(),
        ));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn emit(&self, event: OutboundEvent) {
        if self.outbound.send(event).is_err() {
            debug!("No listener for outbound agreement events");
        }
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::DeviceRegistered { token } => self.handle_device_registered(token),
            Command::AdvertisePolicy { policy_file } => self.handle_advertise_policy(&policy_file).await,
            Command::ExchangeMessage {
                exchange_message,
                protocol_message,
            } => {
                self.handle_exchange_message(&exchange_message, &protocol_message)
                    .await
            }
            Command::BlockchainClientAvailable(d) => {
                self.broadcast(&d, |h, d| h.set_blockchain_client_available(d))
            }
            Command::BlockchainClientNotAvailable(d) => {
                self.broadcast(&d, |h, d| h.set_blockchain_client_not_available(d))
            }
            Command::BlockchainWritable(d) => self.broadcast(&d, |h, d| h.set_blockchain_writable(d)),
            // Handled by the run loop
            Command::Terminate { .. } => {}
        }
    }

    fn handle_device_registered(&mut self, token: String) {
        info!(device_id = %self.device_id, "Device registered with exchange");
        self.device_token = token;
        self.exchange.set_token(&self.device_token);

        if self.handlers.is_empty() {
            self.create_handlers();
        }
        self.start_heartbeat();
    }

    async fn handle_advertise_policy(&mut self, policy_file: &Path) {
        let policy = match read_policy_file(policy_file) {
            Ok(p) => p,
            Err(e) => {
                error!(path = %policy_file.display(), error = %e, "Unable to read policy file");
                return;
            }
        };
        if let Err(e) = self.policy_manager.add_policy(policy) {
            error!(path = %policy_file.display(), error = %e, "Policy not added");
            return;
        }
        if let Err(e) = self.advertise_all_policies().await {
            error!(error = %e, "Unable to advertise policies with exchange");
        }
    }

    async fn handle_exchange_message(&mut self, exchange_message: &str, protocol_message: &str) {
        let msg: DeviceMessage = match serde_json::from_str(exchange_message) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "Unable to demarshal exchange device message");
                return;
            }
        };

        match self.exchange.message_in_exchange(msg.msg_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(msg_id = msg.msg_id, "Ignoring message already deleted from the exchange");
                return;
            }
            Err(e) => {
                error!(msg_id = msg.msg_id, error = %e, "Unable to get messages from the exchange");
                return;
            }
        }

        debug!(msg_id = msg.msg_id, "Received message from the exchange");

        let outcome = match extract_protocol(protocol_message) {
            Err(e) => {
                error!(msg_id = msg.msg_id, error = %e, "Unable to extract agreement protocol from message");
                ProposalOutcome::Rejected
            }
            Ok(name) => match self.handlers.by_name(&name).cloned() {
                None => {
                    info!(msg_id = msg.msg_id, protocol = %name, "No handler for message protocol, deleting it");
                    ProposalOutcome::Rejected
                }
                Some(handler) => match handler.validate_proposal(protocol_message) {
                    Err(e) => {
                        debug!(msg_id = msg.msg_id, error = %e, "Proposal handler ignoring message");
                        ProposalOutcome::Deferred
                    }
                    Ok(proposal) => handler.handle_proposal_message(&proposal, protocol_message, &msg),
                },
            },
        };

        if let ProposalOutcome::Accepted {
            agreement_id,
            microservice,
        } = &outcome
        {
            match self
                .exchange
                .set_agreement_state(agreement_id, microservice, STATE_ACCEPTED)
                .await
            {
                Ok(()) => debug!(agreement_id = %agreement_id, "Recorded agreement in exchange"),
                Err(e) => error!(agreement_id = %agreement_id, error = %e, "Unable to record agreement state in exchange"),
            }
        }

        if outcome.delete_message() {
            match self.exchange.delete_message(msg.msg_id).await {
                Ok(()) => debug!(msg_id = msg.msg_id, "Deleted exchange message"),
                Err(e) => error!(msg_id = msg.msg_id, error = %e, "Error deleting exchange message"),
            }
        }
    }

    fn broadcast<F>(&self, descriptor: &BlockchainDescriptor, f: F)
    where
        F: Fn(&dyn ProtocolHandler, &BlockchainDescriptor),
    {
        if self.handlers.is_empty() {
            warn!(
                bc_type = %descriptor.bc_type,
                bc_name = %descriptor.bc_name,
                "Ledger event before protocol handlers exist, ignoring"
            );
        }
        for handler in self.handlers.iter() {
            f(handler.as_ref(), descriptor);
        }
    }
}
