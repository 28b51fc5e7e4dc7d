use std::sync::Arc;

use crate::bitcake::TransferService;
use crate::broadcast::{FollowUp, LedgerGuard, Message, MessageHandler};
use crate::common::ServentError;

pub struct TransactionHandler {
    pub transfers: Arc<TransferService>,
}

impl MessageHandler for TransactionHandler {
    fn deliver(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError> {
        self.transfers.apply_incoming(message, ledger)?;
        Ok(None)
    }
}
