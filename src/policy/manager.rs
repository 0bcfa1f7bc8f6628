//! Policy manager - the active policy set and its agreement counters.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use super::{read_policy_file, AgreementProtocolSpec, Policy, PolicyError, DEFAULT_AGREEMENT_PROTOCOL};
use crate::protocol::AgreementProtocol;

/// Agreement ids counted against one policy.
#[derive(Debug, Default)]
struct AgreementCounters {
    attempted: HashSet<String>,
    finalized: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    policies: Vec<Policy>,
    counters: HashMap<String, AgreementCounters>,
}

/// Thread-safe set of active policies.
///
/// Counters are keyed by agreement id, so registering the same agreement
/// twice leaves the counts unchanged.
#[derive(Debug, Default)]
pub struct PolicyManager {
    inner: RwLock<Inner>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.policy` file in `dir`. A missing directory yields an
    /// empty manager; unreadable files are skipped.
    pub fn from_dir(dir: &Path) -> Result<Self, PolicyError> {
        let pm = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Policy directory not readable, starting with no policies");
                return Ok(pm);
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "policy").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match read_policy_file(&path).and_then(|p| pm.add_policy(p)) {
                Ok(()) => info!(path = %path.display(), "Loaded policy"),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping policy file"),
            }
        }
        Ok(pm)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, PolicyError> {
        self.inner.read().map_err(|_| PolicyError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, PolicyError> {
        self.inner.write().map_err(|_| PolicyError::Poisoned)
    }

    /// Add a policy. Names are unique.
    pub fn add_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        let mut inner = self.write()?;
        if inner.policies.iter().any(|p| p.name() == policy.name()) {
            return Err(PolicyError::Duplicate(policy.name().to_string()));
        }
        inner.counters.entry(policy.name().to_string()).or_default();
        inner.policies.push(policy);
        Ok(())
    }

    pub fn get_policy(&self, name: &str) -> Option<Policy> {
        self.read()
            .ok()?
            .policies
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn get_all_policies(&self) -> Vec<Policy> {
        self.read().map(|inner| inner.policies.clone()).unwrap_or_default()
    }

    /// Protocol names any agreement on this device may use.
    pub fn supported_protocols(&self) -> Vec<String> {
        AgreementProtocol::all()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Policies written before protocols were configurable get the default.
    pub fn upgrade_agreement_protocols(&self) {
        if let Ok(mut inner) = self.write() {
            for policy in inner.policies.iter_mut() {
                if policy.agreement_protocols.is_empty() {
                    debug!(policy = %policy.name(), "Adding default agreement protocol");
                    policy.agreement_protocols.push(AgreementProtocolSpec {
                        name: DEFAULT_AGREEMENT_PROTOCOL.to_string(),
                    });
                }
            }
        }
    }

    /// Succeeds when `other` is equivalent to the active policy of the same name.
    pub fn matches_mine(&self, other: &Policy) -> Result<(), PolicyError> {
        let inner = self.read()?;
        let mine = inner
            .policies
            .iter()
            .find(|p| p.name() == other.name())
            .ok_or_else(|| PolicyError::NotFound(other.name().to_string()))?;
        mine.equivalent_to(other).map_err(|detail| PolicyError::Mismatch {
            name: other.name().to_string(),
            detail,
        })
    }

    /// Count an agreement attempt against `policy`.
    pub fn attempting_agreement(&self, policy: &Policy, agreement_id: &str) -> Result<(), PolicyError> {
        let mut inner = self.write()?;
        let max = inner
            .policies
            .iter()
            .find(|p| p.name() == policy.name())
            .map(|p| p.max_agreements)
            .ok_or_else(|| PolicyError::NotFound(policy.name().to_string()))?;

        let counters = inner.counters.entry(policy.name().to_string()).or_default();
        if counters.attempted.contains(agreement_id) {
            return Ok(());
        }
        if max != 0 && counters.attempted.len() >= max as usize {
            return Err(PolicyError::TooManyAgreements {
                name: policy.name().to_string(),
                max,
            });
        }
        counters.attempted.insert(agreement_id.to_string());
        Ok(())
    }

    /// Count a finalized agreement against `policy`.
    pub fn final_agreement(&self, policy: &Policy, agreement_id: &str) -> Result<(), PolicyError> {
        let mut inner = self.write()?;
        let counters = inner
            .counters
            .get_mut(policy.name())
            .ok_or_else(|| PolicyError::NotFound(policy.name().to_string()))?;
        counters.finalized.insert(agreement_id.to_string());
        Ok(())
    }

    /// Release both counts held by an agreement.
    pub fn cancel_agreement(&self, policy: &Policy, agreement_id: &str) -> Result<(), PolicyError> {
        let mut inner = self.write()?;
        let counters = inner
            .counters
            .get_mut(policy.name())
            .ok_or_else(|| PolicyError::NotFound(policy.name().to_string()))?;
        counters.attempted.remove(agreement_id);
        counters.finalized.remove(agreement_id);
        Ok(())
    }

    pub fn attempt_count(&self, name: &str) -> usize {
        self.read()
            .ok()
            .and_then(|inner| inner.counters.get(name).map(|c| c.attempted.len()))
            .unwrap_or(0)
    }

    pub fn final_count(&self, name: &str) -> usize {
        self.read()
            .ok()
            .and_then(|inner| inner.counters.get(name).map(|c| c.finalized.len()))
            .unwrap_or(0)
    }
}
