//! One handler per supported protocol.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AgreementProtocol, ProtocolHandler};

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<AgreementProtocol, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(handler.protocol(), handler);
    }

    pub fn get(&self, protocol: AgreementProtocol) -> Option<&Arc<dyn ProtocolHandler>> {
        self.handlers.get(&protocol)
    }

    /// Look up by wire name. Unknown names yield `None`.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn ProtocolHandler>> {
        AgreementProtocol::from_name(name).and_then(|p| self.get(p))
    }

    /// Handlers in protocol order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProtocolHandler>> {
        self.handlers.values()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
