//! agreement-node: device-side agreement lifecycle manager
//!
//! An edge device advertises its usage policies to the exchange, negotiates
//! agreements with remote bidders through pluggable protocols, and keeps
//! three records of those agreements consistent:
//!
//! - the local agreement store
//! - the exchange's list of agreements held by the device
//! - the ledger each agreement is recorded on, if its protocol uses one
//!
//! ## Components
//!
//! - **Worker**: command dispatcher and startup reconciliation
//! - **Protocol**: one handler per negotiation protocol
//! - **Exchange**: retrying client for the remote registry
//! - **Policy**: active policies and their agreement counters
//! - **Storage**: SQLite-backed agreement records

pub mod config;
pub mod events;
pub mod exchange;
pub mod ledger;
pub mod policy;
pub mod protocol;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use events::{Event, OutboundEvent};
pub use worker::{AgreementWorker, WorkerError, WorkerHandle, WorkerState};
