//! Worker commands and the queue that carries them.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::ledger::BlockchainDescriptor;

/// A unit of work for the dispatcher. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    DeviceRegistered { token: String },
    Terminate { reason: String },
    AdvertisePolicy { policy_file: PathBuf },
    ExchangeMessage {
        exchange_message: String,
        protocol_message: String,
    },
    BlockchainClientAvailable(BlockchainDescriptor),
    BlockchainClientNotAvailable(BlockchainDescriptor),
    BlockchainWritable(BlockchainDescriptor),
}

impl Command {
    /// Log-friendly summary that leaves out tokens and message bodies.
    pub fn short_string(&self) -> String {
        match self {
            Command::DeviceRegistered { .. } => "DeviceRegistered".to_string(),
            Command::Terminate { reason } => format!("Terminate({})", reason),
            Command::AdvertisePolicy { policy_file } => {
                format!("AdvertisePolicy({})", policy_file.display())
            }
            Command::ExchangeMessage { protocol_message, .. } => {
                format!("ExchangeMessage({} bytes)", protocol_message.len())
            }
            Command::BlockchainClientAvailable(d) => {
                format!("BlockchainClientAvailable({}/{})", d.bc_type, d.bc_name)
            }
            Command::BlockchainClientNotAvailable(d) => {
                format!("BlockchainClientNotAvailable({}/{})", d.bc_type, d.bc_name)
            }
            Command::BlockchainWritable(d) => {
                format!("BlockchainWritable({}/{})", d.bc_type, d.bc_name)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_string())
    }
}

/// Sending half of the command queue.
///
/// The queue is unbounded; crossing the soft limit only logs a warning.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
    soft_limit: usize,
}

pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
    depth: Arc<AtomicUsize>,
}

pub fn command_queue(soft_limit: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        CommandSender {
            tx,
            depth: depth.clone(),
            soft_limit,
        },
        CommandReceiver { rx, depth },
    )
}

impl CommandSender {
    /// Queue a command. Returns false once the worker has stopped.
    pub fn send(&self, command: Command) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > self.soft_limit {
            warn!(depth, soft_limit = self.soft_limit, command = %command, "Agreement worker command backlog");
        }
        match self.tx.send(command) {
            Ok(()) => true,
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                warn!(command = %e.0, "Agreement worker stopped, dropping command");
                false
            }
        }
    }

    /// Commands queued and not yet taken by the worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl CommandReceiver {
    pub async fn recv(&mut self) -> Option<Command> {
        let command = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }
}
