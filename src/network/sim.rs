use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::transport::Transport;
use crate::broadcast::{Message, MessageKind};
use crate::common::{Config, DeliveryMode, NetworkConfig, NodeId, TransportError};

/*
    In-memory links between servents. Every message waits a random delay
    before it lands in the receiver's inbox. In causal mode each message
    travels on its own, so messages on one link may overtake each other. In
    fifo mode every directed link has a worker draining its own queue, so a
    link never reorders.

    A message counts as in flight from the moment it is sent until the
    receiving listener is done with it. Messages parked on a held link don't
    count until the link is released.
*/

type Link = (NodeId, NodeId);

/// Receiving end of one servent.
pub struct Inbox {
    pub me: NodeId,
    rx: UnboundedReceiver<Message>,
    in_flight: Arc<AtomicUsize>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Marks a received message as fully handled.
    pub fn processed(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimNetwork {
    delivery: DeliveryMode,
    delays: NetworkConfig,
    inboxes: BTreeMap<NodeId, UnboundedSender<Message>>,
    in_flight: Arc<AtomicUsize>,
    held: Mutex<HashMap<Link, Vec<Message>>>,
    links: Mutex<HashMap<Link, UnboundedSender<Message>>>,
    working: AtomicBool,
}

impl SimNetwork {
    pub fn new(config: &Config) -> (Arc<Self>, Vec<Inbox>) {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut inboxes = BTreeMap::new();
        let mut receivers = Vec::with_capacity(config.node_count);

        for servent in &config.servents {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(servent.id, tx);
            receivers.push(Inbox {
                me: servent.id,
                rx,
                in_flight: in_flight.clone(),
            });
        }

        let network = SimNetwork {
            delivery: config.delivery,
            delays: config.network.clone(),
            inboxes,
            in_flight,
            held: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            working: AtomicBool::new(true),
        };
        (Arc::new(network), receivers)
    }

    pub fn endpoint(self: &Arc<Self>, me: NodeId) -> Arc<dyn Transport> {
        Arc::new(Endpoint {
            me,
            network: self.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().values().map(Vec::len).sum()
    }

    /// Parks everything sent from `from` to `to` until the link is released.
    pub fn hold_link(&self, from: NodeId, to: NodeId) {
        self.held.lock().entry((from, to)).or_default();
    }

    pub fn release_link(self: &Arc<Self>, from: NodeId, to: NodeId) {
        let mut held = self.held.lock();
        for message in held.remove(&(from, to)).unwrap_or_default() {
            self.dispatch(from, message);
        }
    }

    /// Stops link workers and poisons every inbox.
    pub fn shutdown(&self) {
        self.working.store(false, Ordering::SeqCst);
        self.links.lock().clear();
        for (id, inbox) in &self.inboxes {
            let _ = inbox.send(Message::new(MessageKind::Poison, 0, *id, Some(*id)));
        }
    }

    fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    fn send_from(self: &Arc<Self>, from: NodeId, message: Message) -> Result<(), TransportError> {
        let to = message.current_receiver;
        if !self.inboxes.contains_key(&to) {
            return Err(TransportError::UnknownPeer(to));
        }
        if !self.is_working() {
            return Err(TransportError::LinkClosed(to));
        }

        let mut held = self.held.lock();
        if let Some(parked) = held.get_mut(&(from, to)) {
            parked.push(message);
            return Ok(());
        }
        self.dispatch(from, message);
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, from: NodeId, message: Message) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.delivery {
            DeliveryMode::Causal => {
                let delay = self.random_delay();
                let network = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    network.deliver(message);
                });
            }
            DeliveryMode::Fifo => {
                let to = message.current_receiver;
                let mut links = self.links.lock();
                let link = links
                    .entry((from, to))
                    .or_insert_with(|| self.spawn_link_worker(from, to));
                if link.send(message).is_err() {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn spawn_link_worker(self: &Arc<Self>, from: NodeId, to: NodeId) -> UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let network = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if message.kind == MessageKind::Poison || !network.is_working() {
                    network.in_flight.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(network.random_delay()).await;
                network.deliver(message);
            }
            debug!(from, to, "link worker stopped");
        });
        tx
    }

    fn deliver(&self, message: Message) {
        let to = message.current_receiver;
        let delivered = self
            .inboxes
            .get(&to)
            .is_some_and(|inbox| inbox.send(message).is_ok());
        if !delivered {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!(to, "inbox closed, message dropped");
        }
    }

    fn random_delay(&self) -> Duration {
        let NetworkConfig {
            min_delay_ms,
            max_delay_ms,
        } = self.delays;
        Duration::from_millis(rand::thread_rng().gen_range(min_delay_ms..=max_delay_ms))
    }
}

struct Endpoint {
    me: NodeId,
    network: Arc<SimNetwork>,
}

impl Transport for Endpoint {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        self.network.send_from(self.me, message)
    }
}
