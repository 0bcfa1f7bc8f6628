//! Device usage policies
//!
//! A policy names the workload (API spec) the device offers, how many
//! concurrent agreements it accepts, the properties a counterparty can
//! match against, and which negotiation protocols it speaks.

pub mod manager;

pub use manager::PolicyManager;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol used when a policy does not list any.
pub const DEFAULT_AGREEMENT_PROTOCOL: &str = "Basic";

/// Policy errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Unable to read policy file {path}: {error}")]
    Read { path: String, error: String },

    #[error("Unable to demarshal policy: {0}")]
    Demarshal(String),

    #[error("Policy {0} has no API specs")]
    NoApiSpecs(String),

    #[error("Policy {0} already exists")]
    Duplicate(String),

    #[error("Policy {0} not found")]
    NotFound(String),

    #[error("Policy {name} does not match the local version: {detail}")]
    Mismatch { name: String, detail: String },

    #[error("Policy {name} is at its limit of {max} agreements")]
    TooManyAgreements { name: String, max: u32 },

    #[error("Policy manager lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHeader {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    pub spec_ref: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementProtocolSpec {
    pub name: String,
}

/// A named property value. Values stay untyped JSON until advertised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVerification {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub interval: u64,
}

impl DataVerification {
    /// Hide credentials before the policy leaves the device.
    pub fn obscure(&mut self) {
        if !self.password.is_empty() {
            self.password = "********".to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub header: PolicyHeader,
    #[serde(rename = "apiSpec")]
    pub api_specs: Vec<ApiSpec>,
    #[serde(default)]
    pub agreement_protocols: Vec<AgreementProtocolSpec>,
    #[serde(default)]
    pub max_agreements: u32,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default, rename = "dataVerification")]
    pub data_verify: DataVerification,
}

impl Policy {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// The workload this policy offers; policies are validated to have one.
    pub fn primary_spec_ref(&self) -> &str {
        self.api_specs
            .first()
            .map(|s| s.spec_ref.as_str())
            .unwrap_or_default()
    }

    /// Whether agreements under this policy may use `protocol`. A policy
    /// listing no protocols speaks the default one.
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        if self.agreement_protocols.is_empty() {
            return protocol == DEFAULT_AGREEMENT_PROTOCOL;
        }
        self.agreement_protocols.iter().any(|p| p.name == protocol)
    }

    /// Properties advertised for this policy.
    pub fn all_properties(&self) -> Vec<Property> {
        self.properties.clone()
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.api_specs.is_empty() {
            return Err(PolicyError::NoApiSpecs(self.header.name.clone()));
        }
        Ok(())
    }

    /// Property-for-property comparison against another version of the
    /// same policy. Order of the property list is not significant.
    pub fn equivalent_to(&self, other: &Policy) -> Result<(), String> {
        if self.api_specs != other.api_specs {
            return Err("API specs differ".to_string());
        }
        if self.properties.len() != other.properties.len() {
            return Err(format!(
                "property count {} != {}",
                self.properties.len(),
                other.properties.len()
            ));
        }
        for prop in &self.properties {
            match other.properties.iter().find(|p| p.name == prop.name) {
                Some(p) if p.value == prop.value => {}
                Some(p) => {
                    return Err(format!(
                        "property {} changed from {} to {}",
                        prop.name, prop.value, p.value
                    ))
                }
                None => return Err(format!("property {} missing", prop.name)),
            }
        }
        Ok(())
    }
}

/// Parse a policy from its JSON form, as embedded in a proposal.
pub fn demarshal_policy(raw: &str) -> Result<Policy, PolicyError> {
    let policy: Policy =
        serde_json::from_str(raw).map_err(|e| PolicyError::Demarshal(e.to_string()))?;
    policy.validate()?;
    Ok(policy)
}

/// Read a `*.policy` file.
pub fn read_policy_file(path: &Path) -> Result<Policy, PolicyError> {
    let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Read {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    demarshal_policy(&content)
}
