use std::sync::Arc;

use tracing::warn;

use crate::broadcast::{follow_up, FollowUp, LedgerGuard, Message, MessageHandler, MessageKind};
use crate::common::ServentError;
use crate::network::transport::Outbox;
use crate::snapshot::{AcharyaBadrinath, AlagarVenkatesan, CoordinatedCheckpointing};

pub struct AcharyaBadrinathHandler {
    pub strategy: Arc<AcharyaBadrinath>,
}

impl MessageHandler for AcharyaBadrinathHandler {
    fn deliver(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError> {
        match message.kind {
            MessageKind::AbSnapshotRequest => Ok(self.strategy.handle_request(message, ledger)),
            MessageKind::AbSnapshotResponse => {
                self.strategy.handle_response(message)?;
                Ok(None)
            }
            kind => unexpected(kind),
        }
    }
}

pub struct AlagarVenkatesanHandler {
    pub strategy: Arc<AlagarVenkatesan>,
}

impl MessageHandler for AlagarVenkatesanHandler {
    fn deliver(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError> {
        match message.kind {
            MessageKind::AvMarker => Ok(self.strategy.handle_marker(message, ledger)),
            MessageKind::AvDone => {
                self.strategy.handle_done(message);
                Ok(None)
            }
            MessageKind::AvTerminate => {
                self.strategy.handle_terminate(ledger);
                Ok(None)
            }
            kind => unexpected(kind),
        }
    }
}

pub struct CoordinatedCheckpointingHandler {
    pub strategy: Arc<CoordinatedCheckpointing>,
    pub outbox: Arc<Outbox>,
}

impl MessageHandler for CoordinatedCheckpointingHandler {
    fn deliver(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError> {
        match message.kind {
            MessageKind::CcSnapshotRequest => {
                let Some(outgoing) = self.strategy.handle_snapshot_request(message, ledger) else {
                    return Ok(None);
                };
                let outbox = self.outbox.clone();
                Ok(Some(follow_up(move || {
                    outbox.send_all(outgoing);
                    Ok(())
                })))
            }
            MessageKind::CcSnapshotResponse => self.strategy.handle_snapshot_response(message, ledger),
            MessageKind::CcResume => self.strategy.exit_snapshot_mode(ledger),
            kind => unexpected(kind),
        }
    }
}

fn unexpected(kind: MessageKind) -> Result<Option<FollowUp>, ServentError> {
    warn!(?kind, "message routed to the wrong handler");
    Ok(None)
}
