pub mod snapshot;
pub mod transaction;

pub use snapshot::*;
pub use transaction::*;

use std::sync::Arc;

use crate::bitcake::TransferService;
use crate::broadcast::{HandlerTable, MessageKind};
use crate::network::transport::Outbox;
use crate::snapshot::Algorithm;

/// Dispatch table for a servent running `algorithm`. Kinds belonging to the
/// other algorithms stay unregistered.
pub fn handler_table(transfers: Arc<TransferService>, algorithm: &Algorithm, outbox: Arc<Outbox>) -> HandlerTable {
    let table = HandlerTable::new().register(MessageKind::Transaction, Arc::new(TransactionHandler { transfers }));

    match algorithm {
        Algorithm::AcharyaBadrinath(strategy) => {
            let handler = Arc::new(AcharyaBadrinathHandler {
                strategy: strategy.clone(),
            });
            table
                .register(MessageKind::AbSnapshotRequest, handler.clone())
                .register(MessageKind::AbSnapshotResponse, handler)
        }
        Algorithm::AlagarVenkatesan(strategy) => {
            let handler = Arc::new(AlagarVenkatesanHandler {
                strategy: strategy.clone(),
            });
            table
                .register(MessageKind::AvMarker, handler.clone())
                .register(MessageKind::AvDone, handler.clone())
                .register(MessageKind::AvTerminate, handler)
        }
        Algorithm::CoordinatedCheckpointing(strategy) => {
            let handler = Arc::new(CoordinatedCheckpointingHandler {
                strategy: strategy.clone(),
                outbox,
            });
            table
                .register(MessageKind::CcSnapshotRequest, handler.clone())
                .register(MessageKind::CcSnapshotResponse, handler.clone())
                .register(MessageKind::CcResume, handler)
        }
    }
}
