use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::strategy::{in_transit, SnapshotReport, SnapshotStrategy};
use crate::bitcake::BitcakeManager;
use crate::broadcast::{
    follow_up, DeliveryEngine, FollowUp, LedgerGuard, Message, MessageIds, MessageKey, MessageKind, Peers, RecordedLogs,
};
use crate::common::{NodeId, ServentError, SnapshotKind};
use crate::network::transport::Outbox;

/*
    Acharya-Badrinath: the initiator broadcasts a request, and every servent
    answers with its balance plus its full sent and received logs as they were
    when the request was delivered. Causal delivery makes those cuts
    consistent, so a transfer is in transit exactly when it shows up in its
    sender's sent log but not in its receiver's received log.
*/

#[derive(Clone, PartialEq, Debug)]
pub struct AbSnapshot {
    pub servent_id: NodeId,
    pub recorded_balance: i64,
    pub logs: RecordedLogs,
}

pub struct AcharyaBadrinath {
    peers: Peers,
    engine: Arc<DeliveryEngine>,
    bitcake: Arc<BitcakeManager>,
    outbox: Arc<Outbox>,
    ids: Arc<MessageIds>,
    collected: DashMap<NodeId, AbSnapshot>,
    seen_requests: DashSet<MessageKey>,
    progress: Notify,
}

impl AcharyaBadrinath {
    pub fn new(
        peers: Peers,
        engine: Arc<DeliveryEngine>,
        bitcake: Arc<BitcakeManager>,
        outbox: Arc<Outbox>,
        ids: Arc<MessageIds>,
    ) -> Self {
        AcharyaBadrinath {
            peers,
            engine,
            bitcake,
            outbox,
            ids,
            collected: DashMap::new(),
            seen_requests: DashSet::new(),
            progress: Notify::new(),
        }
    }

    fn record(&self, ledger: &LedgerGuard<'_>) -> AbSnapshot {
        AbSnapshot {
            servent_id: self.peers.me,
            recorded_balance: self.bitcake.current(),
            logs: ledger.recorded_logs(),
        }
    }

    /// Records this servent's state at delivery of `request` and leaves the reply for later.
    pub fn handle_request(self: &Arc<Self>, request: &Message, ledger: &mut LedgerGuard<'_>) -> Option<FollowUp> {
        if !self.seen_requests.insert(request.key()) {
            return None;
        }

        let state = self.record(ledger);
        let requester = request.original_sender;
        debug!(node = self.peers.me, requester, balance = state.recorded_balance, "recorded state for request");

        let strategy = self.clone();
        Some(follow_up(move || {
            let response = Message::new(MessageKind::AbSnapshotResponse, strategy.ids.next(), strategy.peers.me, Some(requester))
                .with_payload(state.recorded_balance.to_string())
                .with_attachment(state.logs);
            let response = strategy.engine.causal_clock_increment(response);
            strategy.outbox.broadcast(&response);
            Ok(())
        }))
    }

    pub fn handle_response(&self, response: &Message) -> Result<(), ServentError> {
        if !response.is_for(self.peers.me) {
            return Ok(());
        }

        let balance = response.amount()?;
        let logs = response.recorded_logs()?;
        self.collected.insert(
            response.original_sender,
            AbSnapshot {
                servent_id: response.original_sender,
                recorded_balance: balance,
                logs: logs.clone(),
            },
        );
        debug!(node = self.peers.me, from = response.original_sender, balance, "collected response");
        self.progress.notify_one();
        Ok(())
    }
}

#[async_trait]
impl SnapshotStrategy for AcharyaBadrinath {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::AcharyaBadrinath
    }

    fn initiate_snapshot(&self) -> Result<(), ServentError> {
        let request = {
            let mut ledger = self.engine.ledger();
            let state = self.record(&ledger);
            self.collected.insert(self.peers.me, state);
            ledger.stamp(Message::new(MessageKind::AbSnapshotRequest, self.ids.next(), self.peers.me, None))
        };

        info!(node = self.peers.me, "initiating snapshot");
        self.engine.drain();
        self.outbox.broadcast(&request);
        self.progress.notify_one();
        Ok(())
    }

    fn is_snapshot_complete(&self) -> bool {
        self.collected.len() == self.peers.node_count
    }

    fn progress(&self) -> &Notify {
        &self.progress
    }

    async fn process_collected_data(&self) -> Result<SnapshotReport, ServentError> {
        let snapshots: Vec<AbSnapshot> = self.collected.iter().map(|entry| entry.value().clone()).collect();
        let balances: BTreeMap<NodeId, i64> = snapshots
            .iter()
            .map(|snapshot| (snapshot.servent_id, snapshot.recorded_balance))
            .collect();
        let in_transit = in_transit(snapshots.iter().map(|snapshot| &snapshot.logs))?;
        let total = balances.values().sum::<i64>() + in_transit;
        self.collected.clear();

        Ok(SnapshotReport {
            kind: SnapshotKind::AcharyaBadrinath,
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
