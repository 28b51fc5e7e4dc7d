use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broadcast::{MessageKind, RecordedLogs, TransferKey};
use crate::common::{MessageError, NodeId, ServentError, SnapshotKind};

/// Result of one finished snapshot, as seen by the servent that collected it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SnapshotReport {
    pub kind: SnapshotKind,
    pub initiator: NodeId,
    pub balances: BTreeMap<NodeId, i64>,
    pub in_transit: i64,
    pub total: i64,
}

#[async_trait]
pub trait SnapshotStrategy: Send + Sync {
    fn kind(&self) -> SnapshotKind;

    fn initiate_snapshot(&self) -> Result<(), ServentError>;

    fn is_snapshot_complete(&self) -> bool;

    /// Signalled whenever collected state grows, so completion can be re-checked.
    fn progress(&self) -> &Notify;

    async fn process_collected_data(&self) -> Result<SnapshotReport, ServentError>;

    fn clear(&self);
}

/// Sum of the transfers some servent logged as sent that no servent logged as
/// received. With every log cut at its servent's recorded balance, this is the
/// money that was on the wire.
pub fn in_transit<'a>(logs: impl IntoIterator<Item = &'a RecordedLogs>) -> Result<i64, MessageError> {
    let mut sent = BTreeMap::<TransferKey, i64>::new();
    let mut received = BTreeSet::<TransferKey>::new();

    for logs in logs {
        for message in logs.sent.iter().filter(|m| m.kind == MessageKind::Transaction) {
            sent.insert(message.transfer_key(), message.amount()?);
        }
        for message in logs.received.iter().filter(|m| m.kind == MessageKind::Transaction) {
            received.insert(message.transfer_key());
        }
    }

    Ok(sent
        .iter()
        .filter(|(key, _)| !received.contains(key))
        .map(|(_, amount)| amount)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Message;

    #[test]
    fn test_in_transit_counts_unmatched_transfers() {
        // Arrange
        let delivered = Message::transaction(0, 1, 2, 30);
        let on_the_wire = Message::transaction(1, 1, 0, 45);
        let request = Message::new(MessageKind::AbSnapshotRequest, 2, 1, None);
        let logs = [
            RecordedLogs {
                sent: vec![delivered.clone(), on_the_wire, request],
                received: vec![],
            },
            RecordedLogs {
                sent: vec![],
                received: vec![delivered],
            },
        ];

        // Act
        let amount = in_transit(&logs);

        // Assert
        assert_eq!(amount, Ok(45));
    }
}
