//! Publishing the active policies as the device's exchange microservices.

use serde_json::Value;
use tracing::{debug, info};

use super::{AgreementWorker, WorkerError};
use crate::exchange::{convert_to_string, Microservice, MsProp, PutDeviceRequest};
use crate::policy::{Policy, Property};

/// Exchange search form of one policy property.
///
/// Strings match by membership, integers by minimum, booleans by equality
/// and string lists by membership of the comma-joined list. Any other
/// value cannot be searched on and fails the advertisement.
pub fn to_ms_prop(policy: &str, prop: &Property) -> Result<MsProp, WorkerError> {
    let unsupported = || WorkerError::UnsupportedProperty {
        policy: policy.to_string(),
        name: prop.name.clone(),
        value: prop.value.to_string(),
    };

    let (prop_type, value, op) = match &prop.value {
        Value::String(s) => ("string", s.clone(), "in"),
        Value::Number(n) if n.is_i64() || n.is_u64() => ("int", n.to_string(), ">="),
        Value::Bool(b) => ("boolean", b.to_string(), "="),
        Value::Array(items) => {
            let strings = items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
                .ok_or_else(unsupported)?;
            ("list", convert_to_string(&strings), "in")
        }
        _ => return Err(unsupported()),
    };

    Ok(MsProp {
        name: prop.name.clone(),
        value,
        prop_type: prop_type.to_string(),
        op: op.to_string(),
    })
}

/// Exchange record for one policy. Credentials are obscured first.
pub fn to_microservice(policy: &Policy) -> Result<Microservice, WorkerError> {
    let mut published = policy.clone();
    published.data_verify.obscure();

    let properties = policy
        .all_properties()
        .iter()
        .map(|p| to_ms_prop(policy.name(), p))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Microservice {
        url: policy.primary_spec_ref().to_string(),
        properties,
        num_agreements: policy.max_agreements,
        policy: serde_json::to_string(&published)?,
    })
}

impl AgreementWorker {
    /// Replace the device's exchange record with one listing every active
    /// policy. Requires the registered device record for the device name.
    pub(crate) async fn advertise_all_policies(&self) -> Result<(), WorkerError> {
        let device = self
            .store
            .find_exchange_device()?
            .ok_or(WorkerError::NotRegistered)?;

        self.policy_manager.upgrade_agreement_protocols();
        let policies = self.policy_manager.get_all_policies();
        if policies.is_empty() {
            debug!("No policies to advertise");
            return Ok(());
        }

        let mut request = PutDeviceRequest::new(&self.device_token, &device.name);
        request.registered_microservices = policies
            .iter()
            .map(to_microservice)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(device = %request.short_string(), "Registering microservices");
        self.exchange.put_device(&request).await?;
        info!(
            device_id = %self.device_id,
            count = request.registered_microservices.len(),
            "Advertised policies in exchange"
        );
        Ok(())
    }
}
