use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::strategy::{in_transit, SnapshotReport, SnapshotStrategy};
use crate::bitcake::{CheckpointBitcakeManager, TransferService};
use crate::broadcast::{
    follow_up, DeliveryEngine, FollowUp, LedgerGuard, Message, MessageIds, MessageKey, MessageKind, Peers, RecordedLogs,
};
use crate::common::{NodeId, ServentError, SnapshotError, SnapshotKind};
use crate::network::transport::Outbox;

/*
    Coordinated checkpointing: the request floods the network point to point,
    every servent freezes and records its balance the first time it sees it
    and answers the initiator directly, together with the transfers it had
    sent and received up to that point. When the initiator holds one record
    per servent it tells everyone to resume.

    Nobody moves balance while frozen and nobody resumes before everyone has
    frozen, so a transfer debited before its sender froze is either in its
    receiver's record or was still on the wire. The latter show up as sent
    but never received and are added to the total.
*/

#[derive(Clone, PartialEq, Debug)]
pub struct CcRecord {
    pub recorded_balance: i64,
    pub logs: RecordedLogs,
}

pub struct CoordinatedCheckpointing {
    peers: Peers,
    engine: Arc<DeliveryEngine>,
    checkpoint: Arc<CheckpointBitcakeManager>,
    transfers: Arc<TransferService>,
    outbox: Arc<Outbox>,
    ids: Arc<MessageIds>,
    collected: DashMap<NodeId, CcRecord>,
    seen_requests: DashSet<MessageKey>,
    progress: Notify,
}

impl CoordinatedCheckpointing {
    pub fn new(
        peers: Peers,
        engine: Arc<DeliveryEngine>,
        checkpoint: Arc<CheckpointBitcakeManager>,
        transfers: Arc<TransferService>,
        outbox: Arc<Outbox>,
        ids: Arc<MessageIds>,
    ) -> Self {
        CoordinatedCheckpointing {
            peers,
            engine,
            checkpoint,
            transfers,
            outbox,
            ids,
            collected: DashMap::new(),
            seen_requests: DashSet::new(),
            progress: Notify::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.checkpoint.is_snapshot_mode()
    }

    /// Freezes on the first copy of a request and returns the messages it
    /// produces: forwarded copies plus, off the initiator, the direct reply.
    /// The record is cut from `ledger`, so no transfer lands halfway through it.
    pub fn handle_snapshot_request(&self, request: &Message, ledger: &mut LedgerGuard<'_>) -> Option<Vec<Message>> {
        if !self.seen_requests.insert(request.key()) {
            return None;
        }

        let initiator = request.original_sender;
        if !self.checkpoint.enter_snapshot_mode(initiator) {
            debug!(node = self.peers.me, initiator, "already frozen, ignoring request");
            return None;
        }

        let me = self.peers.me;
        let record = CcRecord {
            recorded_balance: self.checkpoint.bitcake().current(),
            logs: ledger.recorded_logs(),
        };
        let arrived_from = request.last_hop();
        let forwarded = request.forwarded_by(me);
        let mut outgoing: Vec<Message> = self
            .peers
            .neighbors
            .iter()
            .filter(|neighbor| **neighbor != arrived_from && **neighbor != initiator)
            .map(|neighbor| forwarded.changed_receiver(*neighbor))
            .collect();

        if initiator == me {
            self.collected.insert(me, record);
            self.progress.notify_one();
        } else {
            outgoing.push(
                Message::new(MessageKind::CcSnapshotResponse, self.ids.next(), me, Some(initiator))
                    .with_payload(record.recorded_balance.to_string())
                    .with_attachment(record.logs),
            );
        }
        Some(outgoing)
    }

    pub fn handle_snapshot_response(
        self: &Arc<Self>,
        response: &Message,
        ledger: &mut LedgerGuard<'_>,
    ) -> Result<Option<FollowUp>, ServentError> {
        let me = self.peers.me;
        if !response.is_for(me) || self.checkpoint.initiator() != Some(me) {
            return Ok(None);
        }

        let balance = response.amount()?;
        let logs = response.recorded_logs()?.clone();
        self.collected.insert(
            response.original_sender,
            CcRecord {
                recorded_balance: balance,
                logs,
            },
        );
        self.progress.notify_one();
        debug!(node = me, from = response.original_sender, balance, "collected balance");

        if self.collected.len() < self.peers.node_count {
            return Ok(None);
        }

        let resumes: Vec<Message> = self
            .peers
            .others()
            .map(|other| Message::new(MessageKind::CcResume, self.ids.next(), me, Some(other)))
            .collect();
        let release = self.exit_snapshot_mode(ledger)?;

        let strategy = self.clone();
        Ok(Some(follow_up(move || {
            strategy.outbox.send_all(resumes);
            release.map_or(Ok(()), |release| release())
        })))
    }

    /// Unfreezes, applies queued credits now and returns the deferred transfers as follow-up.
    pub fn exit_snapshot_mode(&self, ledger: &mut LedgerGuard<'_>) -> Result<Option<FollowUp>, ServentError> {
        let (queued, deferred) = self.checkpoint.exit_snapshot_mode();
        for message in &queued {
            self.transfers.credit(message, ledger)?;
        }

        if deferred.is_empty() {
            return Ok(None);
        }
        let transfers = self.transfers.clone();
        Ok(Some(follow_up(move || {
            for transfer in deferred {
                transfers.send(transfer.receiver, transfer.amount)?;
            }
            Ok(())
        })))
    }
}

#[async_trait]
impl SnapshotStrategy for CoordinatedCheckpointing {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::CoordinatedCheckpointing
    }

    fn initiate_snapshot(&self) -> Result<(), ServentError> {
        let request = Message::new(MessageKind::CcSnapshotRequest, self.ids.next(), self.peers.me, None);
        let outgoing = {
            let mut ledger = self.engine.ledger();
            self.handle_snapshot_request(&request, &mut ledger)
        }
        .ok_or(SnapshotError::AlreadyActive)?;

        info!(node = self.peers.me, "initiating snapshot");
        self.outbox.send_all(outgoing);
        Ok(())
    }

    fn is_snapshot_complete(&self) -> bool {
        self.collected.len() == self.peers.node_count
    }

    fn progress(&self) -> &Notify {
        &self.progress
    }

    async fn process_collected_data(&self) -> Result<SnapshotReport, ServentError> {
        let records: BTreeMap<NodeId, CcRecord> = self
            .collected
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let in_transit = in_transit(records.values().map(|record| &record.logs))?;
        let balances: BTreeMap<NodeId, i64> = records
            .iter()
            .map(|(id, record)| (*id, record.recorded_balance))
            .collect();
        let total = balances.values().sum::<i64>() + in_transit;
        self.collected.clear();

        Ok(SnapshotReport {
            kind: SnapshotKind::CoordinatedCheckpointing,
            initiator: self.peers.me,
            balances,
            in_transit,
            total,
        })
    }

    fn clear(&self) {
        self.collected.clear();
    }
}
