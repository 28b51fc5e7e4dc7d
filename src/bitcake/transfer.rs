use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, warn};

use super::checkpoint::CheckpointBitcakeManager;
use super::manager::BitcakeManager;
use crate::broadcast::{DeliveryEngine, LedgerGuard, Message, MessageIds, SendEffect};
use crate::common::{NodeId, ServentError, TransportError};
use crate::network::transport::Outbox;

/// Shape of a transaction burst: `workers` tasks each doing `transfers`
/// transfers of 1..=`max_amount` to random neighbors.
#[derive(Clone, Copy, Debug)]
pub struct BurstPlan {
    pub workers: usize,
    pub transfers: usize,
    pub max_amount: i64,
}

impl Default for BurstPlan {
    fn default() -> Self {
        BurstPlan {
            workers: 5,
            transfers: 5,
            max_amount: 5,
        }
    }
}

pub struct TransferService {
    me: NodeId,
    engine: Arc<DeliveryEngine>,
    bitcake: Arc<BitcakeManager>,
    checkpoint: Option<Arc<CheckpointBitcakeManager>>,
    outbox: Arc<Outbox>,
    ids: Arc<MessageIds>,
}

impl TransferService {
    pub fn new(
        engine: Arc<DeliveryEngine>,
        bitcake: Arc<BitcakeManager>,
        checkpoint: Option<Arc<CheckpointBitcakeManager>>,
        outbox: Arc<Outbox>,
        ids: Arc<MessageIds>,
    ) -> Self {
        TransferService {
            me: engine.me(),
            engine,
            bitcake,
            checkpoint,
            outbox,
            ids,
        }
    }

    /// Originates a transfer. The debit, the sent log entry and the clock
    /// stamp happen as one step, then the transaction is broadcast.
    pub fn send(&self, receiver: NodeId, amount: i64) -> Result<(), ServentError> {
        if receiver == self.me || receiver as usize >= self.outbox.peers.node_count {
            return Err(TransportError::UnknownPeer(receiver).into());
        }

        let message = {
            let mut ledger = self.engine.ledger();
            if let Some(checkpoint) = &self.checkpoint {
                if checkpoint.defer_if_frozen(receiver, amount) {
                    debug!(node = self.me, to = receiver, amount, "transfer deferred until snapshot ends");
                    return Ok(());
                }
            }

            let message = ledger.stamp(Message::transaction(self.ids.next(), self.me, receiver, amount));
            if let SendEffect::Debit(amount) = message.effect {
                self.bitcake.take(amount);
            }
            ledger.add_sent(message.clone());
            message
        };

        debug!(node = self.me, to = receiver, amount, "sending transfer");
        self.engine.drain();
        self.outbox.broadcast(&message);
        Ok(())
    }

    /// Delivery step for a transaction. Copies meant for someone else only
    /// move the clock, which the engine already did.
    pub fn apply_incoming(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<(), ServentError> {
        if !message.is_for(self.me) {
            return Ok(());
        }

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.should_queue_message(message) {
                debug!(node = self.me, msg = %message, "queued credit while frozen");
                checkpoint.queue_message(message.clone());
                return Ok(());
            }
        }

        self.credit(message, ledger)
    }

    pub fn credit(&self, message: &Message, ledger: &mut LedgerGuard<'_>) -> Result<(), ServentError> {
        let amount = message.amount()?;
        self.bitcake.add(amount);
        ledger.add_received(message.clone());
        if let Some(clock) = &message.sender_clock {
            ledger.record_transaction(clock, message.original_sender, amount);
        }

        debug!(node = self.me, from = message.original_sender, amount, "credited transfer");
        Ok(())
    }

    pub async fn burst(self: &Arc<Self>, plan: BurstPlan) {
        let workers: Vec<_> = (0..plan.workers)
            .map(|_| {
                let service = self.clone();
                tokio::spawn(async move { service.run_worker(plan).await })
            })
            .collect();

        for worker in workers {
            if let Err(err) = worker.await {
                error!(node = self.me, %err, "burst worker died");
            }
        }
    }

    async fn run_worker(&self, plan: BurstPlan) {
        for _ in 0..plan.transfers {
            let pick = {
                let mut rng = rand::thread_rng();
                self.outbox
                    .peers
                    .neighbors
                    .choose(&mut rng)
                    .map(|receiver| (*receiver, rng.gen_range(1..=plan.max_amount)))
            };
            let Some((receiver, amount)) = pick else {
                return;
            };

            if let Err(err) = self.send(receiver, amount) {
                warn!(node = self.me, to = receiver, %err, "burst transfer failed");
            }
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::broadcast::{CausalOrdering, MessageKind, Peers};
    use crate::common::MessageError;
    use crate::network::transport::Transport;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Message>>,
    }

    impl Transport for Recording {
        fn send(&self, message: Message) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn service(checkpoint: bool) -> (Arc<TransferService>, Arc<Recording>, Arc<BitcakeManager>, Option<Arc<CheckpointBitcakeManager>>) {
        let transport = Arc::new(Recording::default());
        let engine = Arc::new(DeliveryEngine::new(0, 3, Box::new(CausalOrdering)));
        let bitcake = Arc::new(BitcakeManager::new(1000));
        let checkpoint = checkpoint.then(|| Arc::new(CheckpointBitcakeManager::new(0, bitcake.clone())));
        let outbox = Arc::new(Outbox::new(Peers::new(0, vec![1, 2], 3), transport.clone()));
        let service = TransferService::new(engine, bitcake.clone(), checkpoint.clone(), outbox, Arc::new(MessageIds::new()));
        (Arc::new(service), transport, bitcake, checkpoint)
    }

    #[tokio::test]
    async fn test_send_debits_logs_and_broadcasts() {
        // Arrange
        let (service, transport, bitcake, _) = service(false);

        // Act
        service.send(2, 30).unwrap();

        // Assert
        assert_eq!(bitcake.current(), 970);
        let sent = transport.sent.lock();
        assert_eq!(sent.iter().map(|m| m.current_receiver).collect::<Vec<_>>(), vec![1, 2]);
        assert!(sent.iter().all(|m| m.effect == SendEffect::None));
        assert_eq!(sent[0].sender_clock, Some([(0, 0), (1, 0), (2, 0)].into()));

        let ledger = service.engine.ledger();
        assert_eq!(ledger.sent().len(), 1);
        assert_eq!(ledger.clock_values(), [(0, 1), (1, 0), (2, 0)].into());
    }

    #[tokio::test]
    async fn test_send_to_self_is_rejected() {
        let (service, transport, bitcake, _) = service(false);

        assert!(service.send(0, 10).is_err());
        assert!(service.send(7, 10).is_err());
        assert_eq!(bitcake.current(), 1000);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_frozen_send_is_deferred() {
        // Arrange
        let (service, transport, bitcake, checkpoint) = service(true);
        let checkpoint = checkpoint.unwrap();
        checkpoint.enter_snapshot_mode(0);

        // Act
        service.send(1, 25).unwrap();

        // Assert
        assert_eq!(bitcake.current(), 1000);
        assert!(transport.sent.lock().is_empty());
        let (_, deferred) = checkpoint.exit_snapshot_mode();
        assert_eq!(deferred.len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_credits_only_addressed_transfers() {
        // Arrange
        let (service, _, bitcake, _) = service(false);
        let mine = Message::transaction(0, 1, 0, 40).with_clock([(0, 0), (1, 0), (2, 0)].into());
        let theirs = Message::transaction(1, 1, 2, 40).with_clock([(0, 0), (1, 1), (2, 0)].into());
        let broken = Message::new(MessageKind::Transaction, 2, 1, Some(0)).with_payload("x");

        // Act
        let mut ledger = service.engine.ledger();
        service.apply_incoming(&mine, &mut ledger).unwrap();
        service.apply_incoming(&theirs, &mut ledger).unwrap();
        let err = service.apply_incoming(&broken, &mut ledger).unwrap_err();

        // Assert
        assert!(matches!(err, ServentError::Message(MessageError::MalformedAmount(_))));
        assert_eq!(bitcake.current(), 1040);
        assert_eq!(ledger.received().len(), 1);
    }

    #[tokio::test]
    async fn test_frozen_credit_is_queued() {
        let (service, _, bitcake, checkpoint) = service(true);
        let checkpoint = checkpoint.unwrap();
        checkpoint.enter_snapshot_mode(1);

        let mut ledger = service.engine.ledger();
        service.apply_incoming(&Message::transaction(0, 1, 0, 40), &mut ledger).unwrap();

        assert_eq!(bitcake.current(), 1000);
        assert!(ledger.received().is_empty());
        assert_eq!(checkpoint.exit_snapshot_mode().0.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_moves_balance_out() {
        let (service, transport, bitcake, _) = service(false);

        service
            .burst(BurstPlan {
                workers: 2,
                transfers: 3,
                max_amount: 5,
            })
            .await;

        let spent = 1000 - bitcake.current();
        assert!((6..=30).contains(&spent));
        assert_eq!(transport.sent.lock().len(), 12);
    }
}
