//! SQLite-backed agreement store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{now, AgreementFilter, AgreementStore, EstablishedAgreement, ExchangeDevice, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agreements (
    agreement_id TEXT PRIMARY KEY,
    protocol TEXT NOT NULL,
    policy_name TEXT NOT NULL DEFAULT '',
    creation_time INTEGER NOT NULL DEFAULT 0,
    accepted_time INTEGER NOT NULL DEFAULT 0,
    finalized_time INTEGER NOT NULL DEFAULT 0,
    terminated_time INTEGER NOT NULL DEFAULT 0,
    terminated_reason INTEGER NOT NULL DEFAULT 0,
    force_terminated_time INTEGER NOT NULL DEFAULT 0,
    counterparty_address TEXT NOT NULL DEFAULT '',
    proposal_sig TEXT NOT NULL DEFAULT '',
    proposal TEXT NOT NULL DEFAULT '',
    current_deployment TEXT NOT NULL DEFAULT '',
    archived INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS exchange_device (
    singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
    id TEXT NOT NULL,
    token TEXT NOT NULL,
    name TEXT NOT NULL
);";

const COLUMNS: &str = "agreement_id, protocol, policy_name, creation_time, accepted_time, \
    finalized_time, terminated_time, terminated_reason, force_terminated_time, \
    counterparty_address, proposal_sig, proposal, current_deployment, archived";

/// Agreement store persisted in `agreements.db`.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("agreements.db");
        let db = Connection::open(&db_path)?;

        // Enable WAL mode so other subsystems can read while we write
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "Agreement store initialized");
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn row_to_agreement(row: &Row<'_>) -> rusqlite::Result<EstablishedAgreement> {
    Ok(EstablishedAgreement {
        agreement_id: row.get(0)?,
        agreement_protocol: row.get(1)?,
        policy_name: row.get(2)?,
        creation_time: row.get::<_, i64>(3)? as u64,
        accepted_time: row.get::<_, i64>(4)? as u64,
        finalized_time: row.get::<_, i64>(5)? as u64,
        terminated_time: row.get::<_, i64>(6)? as u64,
        terminated_reason: row.get::<_, i64>(7)? as u32,
        force_terminated_time: row.get::<_, i64>(8)? as u64,
        counterparty_address: row.get(9)?,
        proposal_sig: row.get(10)?,
        proposal: row.get(11)?,
        current_deployment: row.get(12)?,
        archived: row.get::<_, i64>(13)? != 0,
    })
}

impl AgreementStore for SqliteStore {
    fn find_exchange_device(&self) -> Result<Option<ExchangeDevice>, StoreError> {
        let db = self.conn()?;
        let device = db
            .query_row(
                "SELECT id, token, name FROM exchange_device WHERE singleton = 1",
                [],
                |row| {
                    Ok(ExchangeDevice {
                        id: row.get(0)?,
                        token: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }

    fn save_exchange_device(&self, device: &ExchangeDevice) -> Result<(), StoreError> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO exchange_device (singleton, id, token, name) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(singleton) DO UPDATE SET id = ?1, token = ?2, name = ?3",
            params![device.id, device.token, device.name],
        )?;
        Ok(())
    }

    fn find_agreements(
        &self,
        protocols: &[String],
        filters: &[AgreementFilter],
    ) -> Result<Vec<EstablishedAgreement>, StoreError> {
        if protocols.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<String> = protocols.to_vec();
        let placeholders = vec!["?"; protocols.len()].join(", ");
        let mut sql = format!(
            "SELECT {} FROM agreements WHERE protocol IN ({})",
            COLUMNS, placeholders
        );
        for filter in filters {
            match filter {
                AgreementFilter::Id(id) => {
                    sql.push_str(" AND agreement_id = ?");
                    values.push(id.clone());
                }
                AgreementFilter::Unarchived => sql.push_str(" AND archived = 0"),
            }
        }
        sql.push_str(" ORDER BY creation_time, agreement_id");

        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_agreement)?;
        let agreements = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(agreements)
    }

    fn save_agreement(&self, ag: &EstablishedAgreement) -> Result<(), StoreError> {
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO agreements ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                COLUMNS
            ),
            params![
                ag.agreement_id,
                ag.agreement_protocol,
                ag.policy_name,
                ag.creation_time as i64,
                ag.accepted_time as i64,
                ag.finalized_time as i64,
                ag.terminated_time as i64,
                ag.terminated_reason as i64,
                ag.force_terminated_time as i64,
                ag.counterparty_address,
                ag.proposal_sig,
                ag.proposal,
                ag.current_deployment,
                ag.archived as i64,
            ],
        )?;
        debug!(agreement_id = %ag.agreement_id, "Saved agreement");
        Ok(())
    }

    fn force_terminate(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<EstablishedAgreement, StoreError> {
        let db = self.conn()?;
        let updated = db.execute(
            "UPDATE agreements SET force_terminated_time = ?1
             WHERE agreement_id = ?2 AND protocol = ?3",
            params![now() as i64, agreement_id, protocol],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                agreement_id: agreement_id.to_string(),
                protocol: protocol.to_string(),
            });
        }

        let agreement = db.query_row(
            &format!("SELECT {} FROM agreements WHERE agreement_id = ?1", COLUMNS),
            [agreement_id],
            row_to_agreement,
        )?;
        Ok(agreement)
    }
}
