use std::collections::HashMap;
use std::sync::Arc;

use super::engine::LedgerGuard;
use super::message::{Message, MessageKind};
use crate::common::ServentError;

/// Work a handler leaves for after the ledger lock is released, typically a reply.
pub type FollowUp = Box<dyn FnOnce() -> Result<(), ServentError> + Send + 'static>;

pub fn follow_up(work: impl FnOnce() -> Result<(), ServentError> + Send + 'static) -> FollowUp {
    Box::new(work)
}

pub trait MessageHandler: Send + Sync {
    /// Runs at delivery time, under the ledger lock. Must not touch the
    /// pending buffer or stamp messages through the engine.
    fn deliver(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError>;
}

/// Registration table built once per servent for the configured algorithm.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        HandlerTable::default()
    }

    pub fn register(mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = MessageKind> + '_ {
        self.handlers.keys().copied()
    }
}
