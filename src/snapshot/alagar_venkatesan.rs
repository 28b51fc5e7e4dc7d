use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use super::strategy::{SnapshotReport, SnapshotStrategy};
use crate::bitcake::BitcakeManager;
use crate::broadcast::{follow_up, ChannelTotal, DeliveryEngine, FollowUp, LedgerGuard, Message, MessageIds, MessageKind, Peers};
use crate::common::{NodeId, ServentError, SnapshotError, SnapshotKind};
use crate::network::transport::Outbox;

/*
    Alagar-Venkatesan: the initiator broadcasts a marker. Every servent
    records its balance when the marker is delivered and from then on counts
    incoming transfers that were sent before their sender saw the marker.
    Once every servent confirmed with a done message, the initiator
    broadcasts terminate and each servent closes its recording with
    recorded + in transit. Only one initiator at a time is supported.
*/

pub struct AlagarVenkatesan {
    peers: Peers,
    engine: Arc<DeliveryEngine>,
    bitcake: Arc<BitcakeManager>,
    outbox: Arc<Outbox>,
    ids: Arc<MessageIds>,
    done: DashSet<NodeId>,
    terminated: AtomicBool,
    totals: watch::Sender<Option<ChannelTotal>>,
    progress: Notify,
}

impl AlagarVenkatesan {
    pub fn new(
        peers: Peers,
        engine: Arc<DeliveryEngine>,
        bitcake: Arc<BitcakeManager>,
        outbox: Arc<Outbox>,
        ids: Arc<MessageIds>,
    ) -> Self {
        let (totals, _) = watch::channel(None);
        AlagarVenkatesan {
            peers,
            engine,
            bitcake,
            outbox,
            ids,
            done: DashSet::new(),
            terminated: AtomicBool::new(false),
            totals,
            progress: Notify::new(),
        }
    }

    /// Local result of the last snapshot this servent took part in.
    pub fn last_total(&self) -> Option<i64> {
        let last = *self.totals.borrow();
        last.map(|total| total.total())
    }

    fn begin(&self, initiator: NodeId, marker: &Message, ledger: &mut LedgerGuard<'_>) {
        let Some(marker_clock) = ledger.causal_past(marker) else {
            return;
        };
        let balance = self.bitcake.current();
        ledger.channel().begin(initiator, marker_clock, balance, self.peers.others());
        self.totals.send_replace(None);
        debug!(node = self.peers.me, initiator, balance, "recorded balance for marker");
    }

    fn terminate(&self, ledger: &mut LedgerGuard<'_>) {
        let Some(total) = ledger.channel().terminate() else {
            return;
        };
        info!(
            node = self.peers.me,
            recorded = total.recorded,
            in_transit = total.input,
            total = total.total(),
            "snapshot terminated"
        );
        self.totals.send_replace(Some(total));
    }

    pub fn handle_marker(self: &Arc<Self>, marker: &Message, ledger: &mut LedgerGuard<'_>) -> Option<FollowUp> {
        let initiator = marker.original_sender;
        if initiator == self.peers.me {
            return None;
        }
        self.begin(initiator, marker, ledger);

        let strategy = self.clone();
        Some(follow_up(move || {
            let done = Message::new(MessageKind::AvDone, strategy.ids.next(), strategy.peers.me, Some(initiator));
            let done = strategy.engine.causal_clock_increment(done);
            strategy.outbox.broadcast(&done);
            Ok(())
        }))
    }

    pub fn handle_done(&self, done: &Message) {
        if !done.is_for(self.peers.me) {
            return;
        }
        self.done.insert(done.original_sender);
        self.progress.notify_one();
    }

    pub fn handle_terminate(&self, ledger: &mut LedgerGuard<'_>) {
        self.terminate(ledger);
    }

    fn broadcast_terminate(&self) {
        let terminate = {
            let mut ledger = self.engine.ledger();
            let terminate = ledger.stamp(Message::new(MessageKind::AvTerminate, self.ids.next(), self.peers.me, None));
            self.terminate(&mut ledger);
            terminate
        };
        self.engine.drain();
        self.outbox.broadcast(&terminate);
    }
}

#[async_trait]
impl SnapshotStrategy for AlagarVenkatesan {
    fn kind(&self) -> SnapshotKind {
        SnapshotKind::AlagarVenkatesan
    }

    fn initiate_snapshot(&self) -> Result<(), ServentError> {
        let marker = {
            let mut ledger = self.engine.ledger();
            if ledger.channel().is_active() {
                return Err(SnapshotError::AlreadyActive.into());
            }

            let marker = ledger.stamp(Message::new(MessageKind::AvMarker, self.ids.next(), self.peers.me, None));
            self.begin(self.peers.me, &marker, &mut ledger);
            marker
        };

        self.done.clear();
        self.terminated.store(false, Ordering::SeqCst);
        info!(node = self.peers.me, "initiating snapshot");
        self.engine.drain();
        self.outbox.broadcast(&marker);
        self.progress.notify_one();
        Ok(())
    }

    fn is_snapshot_complete(&self) -> bool {
        if self.done.len() + 1 < self.peers.node_count {
            return false;
        }

        if self
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.broadcast_terminate();
        }
        true
    }

    fn progress(&self) -> &Notify {
        &self.progress
    }

    async fn process_collected_data(&self) -> Result<SnapshotReport, ServentError> {
        let mut totals = self.totals.subscribe();
        let total = *totals
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SnapshotError::Stopped)?;
        let total = total.ok_or(SnapshotError::Stopped)?;

        Ok(SnapshotReport {
            kind: SnapshotKind::AlagarVenkatesan,
            initiator: self.peers.me,
            balances: BTreeMap::from([(self.peers.me, total.recorded)]),
            in_transit: total.input - total.output,
            total: total.total(),
        })
    }

    fn clear(&self) {
        self.done.clear();
        self.terminated.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FifoOrdering;
    use crate::common::TransportError;
    use crate::network::transport::Transport;

    struct Discard;

    impl Transport for Discard {
        fn send(&self, _: Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn strategy(me: NodeId) -> Arc<AlagarVenkatesan> {
        let peers = Peers::new(me, vec![0, 1, 2].into_iter().filter(|n| *n != me).collect(), 3);
        let engine = Arc::new(DeliveryEngine::new(me, 3, Box::new(FifoOrdering)));
        let outbox = Arc::new(Outbox::new(peers.clone(), Arc::new(Discard)));
        Arc::new(AlagarVenkatesan::new(
            peers,
            engine,
            Arc::new(BitcakeManager::new(1000)),
            outbox,
            Arc::new(MessageIds::new()),
        ))
    }

    #[tokio::test]
    async fn test_initiator_terminates_after_all_done() {
        // Arrange
        let av = strategy(0);
        av.initiate_snapshot().unwrap();
        assert!(matches!(
            av.initiate_snapshot(),
            Err(ServentError::Snapshot(SnapshotError::AlreadyActive))
        ));

        // Act: a transfer sent by 1 before it saw the marker arrives late
        {
            let mut ledger = av.engine.ledger();
            ledger.record_transaction(&[(0, 0), (1, 3), (2, 0)].into(), 1, 40);
            ledger.record_transaction(&[(0, 1), (1, 4), (2, 0)].into(), 1, 5);
        }
        av.handle_done(&Message::new(MessageKind::AvDone, 0, 1, Some(0)));
        assert!(!av.is_snapshot_complete());
        av.handle_done(&Message::new(MessageKind::AvDone, 0, 2, Some(0)));

        // Assert
        assert!(av.is_snapshot_complete());
        let report = av.process_collected_data().await.unwrap();
        assert_eq!(report.in_transit, 40);
        assert_eq!(report.total, 1040);
        assert_eq!(av.last_total(), Some(1040));
    }

    #[tokio::test]
    async fn test_marker_starts_recording_on_receiver() {
        // Arrange: fifo stamps after the increment, so the marker's causal past is 0
        let av = strategy(2);
        let marker = Message::new(MessageKind::AvMarker, 0, 0, None).with_clock([(0, 1), (1, 0), (2, 0)].into());

        // Act
        let follow_up = {
            let mut ledger = av.engine.ledger();
            let follow_up = av.handle_marker(&marker, &mut ledger);
            ledger.record_transaction(&[(0, 0), (1, 1), (2, 0)].into(), 1, 12);
            av.handle_terminate(&mut ledger);
            follow_up
        };

        // Assert
        assert!(follow_up.is_some());
        assert_eq!(av.last_total(), Some(1012));
    }
}
