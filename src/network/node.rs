use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::sim::Inbox;
use super::transport::{Outbox, Transport};
use crate::bitcake::{BitcakeManager, BurstPlan, CheckpointBitcakeManager, TransferService};
use crate::broadcast::{ordering_for, DeliveryEngine, HandlerTable, Message, MessageIds, MessageKey, MessageKind, Peers};
use crate::common::{Config, ConfigError, NodeId, ServentError, SnapshotError, SnapshotKind};
use crate::handler::handler_table;
use crate::snapshot::{
    AcharyaBadrinath, Algorithm, AlagarVenkatesan, CoordinatedCheckpointing, SnapshotCollector,
};

/// Everything one servent runs on, built once at start and shared by reference.
pub struct Servent {
    pub peers: Peers,
    pub config: Arc<Config>,
    pub engine: Arc<DeliveryEngine>,
    pub bitcake: Arc<BitcakeManager>,
    pub transfers: Arc<TransferService>,
    pub algorithm: Algorithm,
    pub collector: Arc<SnapshotCollector>,
    pub outbox: Arc<Outbox>,
    handlers: Arc<HandlerTable>,
    seen: DashSet<MessageKey>,
    working: AtomicBool,
}

impl Servent {
    pub fn new(config: Arc<Config>, me: NodeId, transport: Arc<dyn Transport>) -> Result<Arc<Self>, ServentError> {
        let peers = Peers::from_config(&config, me)
            .ok_or_else(|| ConfigError::Invalid(format!("servent {me} is not configured")))?;

        let engine = Arc::new(DeliveryEngine::new(me, config.node_count, ordering_for(config.delivery)));
        let bitcake = Arc::new(BitcakeManager::new(config.initial_balance));
        let outbox = Arc::new(Outbox::new(peers.clone(), transport));
        let ids = Arc::new(MessageIds::new());

        let checkpoint = (config.snapshot == SnapshotKind::CoordinatedCheckpointing)
            .then(|| Arc::new(CheckpointBitcakeManager::new(me, bitcake.clone())));
        let transfers = Arc::new(TransferService::new(
            engine.clone(),
            bitcake.clone(),
            checkpoint.clone(),
            outbox.clone(),
            ids.clone(),
        ));

        let algorithm = match (config.snapshot, checkpoint) {
            (SnapshotKind::CoordinatedCheckpointing, Some(checkpoint)) => {
                Algorithm::CoordinatedCheckpointing(Arc::new(CoordinatedCheckpointing::new(
                    peers.clone(),
                    engine.clone(),
                    checkpoint,
                    transfers.clone(),
                    outbox.clone(),
                    ids,
                )))
            }
            (SnapshotKind::AlagarVenkatesan, _) => Algorithm::AlagarVenkatesan(Arc::new(AlagarVenkatesan::new(
                peers.clone(),
                engine.clone(),
                bitcake.clone(),
                outbox.clone(),
                ids,
            ))),
            _ => Algorithm::AcharyaBadrinath(Arc::new(AcharyaBadrinath::new(
                peers.clone(),
                engine.clone(),
                bitcake.clone(),
                outbox.clone(),
                ids,
            ))),
        };

        let handlers = Arc::new(handler_table(transfers.clone(), &algorithm, outbox.clone()));
        engine.install_handlers(&handlers);
        let collector = Arc::new(SnapshotCollector::new(me, algorithm.strategy(), config.poll_interval()));

        Ok(Arc::new(Servent {
            peers,
            config,
            engine,
            bitcake,
            transfers,
            algorithm,
            collector,
            outbox,
            handlers,
            seen: DashSet::new(),
            working: AtomicBool::new(true),
        }))
    }

    pub fn me(&self) -> NodeId {
        self.peers.me
    }

    /// Spawns the listener and the snapshot collector.
    pub fn start(self: &Arc<Self>, inbox: Inbox) -> Vec<JoinHandle<()>> {
        info!(node = self.me(), handlers = self.handlers.kinds().count(), "starting servent");
        vec![
            tokio::spawn(self.clone().listen(inbox)),
            tokio::spawn(self.collector.clone().run()),
        ]
    }

    async fn listen(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            if message.kind == MessageKind::Poison || !self.working.load(Ordering::SeqCst) {
                info!(node = self.me(), "listener stopped");
                break;
            }

            self.handle_incoming(message);
            inbox.processed();
        }
    }

    fn handle_incoming(&self, message: Message) {
        // Control messages go straight to dispatch, they are never flooded
        if !message.is_ordered() {
            self.enqueue(message);
            return;
        }

        if message.original_sender == self.me() || !self.seen.insert(message.key()) {
            return;
        }

        let flood = (!self.config.clique).then(|| (message.forwarded_by(self.me()), message.last_hop()));
        self.enqueue(message);

        if let Some((forwarded, last_hop)) = flood {
            debug!(node = self.me(), msg = %forwarded, "flooding");
            self.outbox
                .broadcast_except(&forwarded, &[last_hop, forwarded.original_sender]);
        }
    }

    fn enqueue(&self, message: Message) {
        self.engine.add_pending_message(message);
        if let Err(err) = self.engine.check_pending_messages() {
            error!(node = self.me(), %err, "couldn't drain pending messages");
        }
    }

    pub fn send_transaction(&self, receiver: NodeId, amount: i64) -> Result<(), ServentError> {
        self.transfers.send(receiver, amount)
    }

    pub async fn burst(&self, plan: BurstPlan) {
        self.transfers.burst(plan).await;
    }

    pub fn start_snapshot(&self) -> Result<(), SnapshotError> {
        self.collector.start_collecting()
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_idle()
    }

    pub fn stop(&self) {
        self.working.store(false, Ordering::SeqCst);
        self.collector.stop();
    }
}
