//! In-memory exchange for testing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DeviceAgreement, DeviceMessage, Exchange, ExchangeError, PutDeviceRequest};

/// A call observed by the mock, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeCall {
    ListAgreements,
    DeleteAgreement(String),
    SetAgreementState {
        agreement_id: String,
        microservice: String,
        state: String,
    },
    ListMessages,
    DeleteMessage(i64),
    PutDevice(PutDeviceRequest),
    Heartbeat,
}

#[derive(Debug, Default)]
struct MockState {
    token: String,
    agreements: HashMap<String, DeviceAgreement>,
    messages: Vec<DeviceMessage>,
    calls: Vec<ExchangeCall>,
    list_agreements_error: Option<ExchangeError>,
    put_device_error: Option<ExchangeError>,
}

/// Mock exchange.
///
/// Mutating calls update the in-memory agreement and message sets, so
/// repeated reconciliation sees the effects of earlier runs.
pub struct MockExchange {
    device_id: String,
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic inside a test already failed it; keep serving the state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an agreement the exchange believes this device holds.
    pub fn with_agreement(self, agreement_id: &str, state: &str) -> Self {
        self.state().agreements.insert(
            agreement_id.to_string(),
            DeviceAgreement {
                microservice: String::new(),
                state: state.to_string(),
                last_updated: String::new(),
            },
        );
        self
    }

    /// Seed a queued device message.
    pub fn with_message(self, msg_id: i64) -> Self {
        self.state().messages.push(DeviceMessage {
            msg_id,
            ..Default::default()
        });
        self
    }

    /// Make every agreement listing fail with `error`.
    pub fn fail_agreement_list(self, error: ExchangeError) -> Self {
        self.state().list_agreements_error = Some(error);
        self
    }

    pub fn fail_put_device(self, error: ExchangeError) -> Self {
        self.state().put_device_error = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<ExchangeCall> {
        self.state().calls.clone()
    }

    /// Calls that change exchange state.
    pub fn mutating_calls(&self) -> Vec<ExchangeCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    ExchangeCall::DeleteAgreement(_)
                        | ExchangeCall::SetAgreementState { .. }
                        | ExchangeCall::DeleteMessage(_)
                        | ExchangeCall::PutDevice(_)
                )
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn agreement_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().agreements.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn token(&self) -> String {
        self.state().token.clone()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn set_token(&self, token: &str) {
        self.state().token = token.to_string();
    }

    async fn device_agreements(&self) -> Result<HashMap<String, DeviceAgreement>, ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::ListAgreements);
        if let Some(e) = state.list_agreements_error.clone() {
            return Err(e);
        }
        Ok(state.agreements.clone())
    }

    async fn delete_agreement(&self, agreement_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::DeleteAgreement(agreement_id.to_string()));
        state.agreements.remove(agreement_id);
        Ok(())
    }

    async fn set_agreement_state(
        &self,
        agreement_id: &str,
        microservice: &str,
        agreement_state: &str,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::SetAgreementState {
            agreement_id: agreement_id.to_string(),
            microservice: microservice.to_string(),
            state: agreement_state.to_string(),
        });
        state.agreements.insert(
            agreement_id.to_string(),
            DeviceAgreement {
                microservice: microservice.to_string(),
                state: agreement_state.to_string(),
                last_updated: String::new(),
            },
        );
        Ok(())
    }

    async fn device_messages(&self) -> Result<Vec<DeviceMessage>, ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::ListMessages);
        Ok(state.messages.clone())
    }

    async fn delete_message(&self, msg_id: i64) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::DeleteMessage(msg_id));
        state.messages.retain(|m| m.msg_id != msg_id);
        Ok(())
    }

    async fn put_device(&self, device: &PutDeviceRequest) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.calls.push(ExchangeCall::PutDevice(device.clone()));
        match state.put_device_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn heartbeat(&self) -> Result<(), ExchangeError> {
        self.state().calls.push(ExchangeCall::Heartbeat);
        Ok(())
    }
}
