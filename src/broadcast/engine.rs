use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

use super::dispatch::{FollowUp, HandlerTable};
use super::message::{Message, MessageKind, RecordedLogs};
use super::ordering::{Delivery, OrderingStrategy, StampOrder};
use crate::common::{ClockError, ClockValues, NodeId, VectorClock};

/*
    The engine owns everything a delivery touches: the local clock, the buffer
    of messages that arrived too early, the sent and received logs and the
    channel recorder of an outstanding Alagar-Venkatesan snapshot.

    Lock order is pending -> ledger -> channel -> clock. A delivery runs with
    the pending lock held (the drain) and then takes the ledger, so handlers
    get the ledger guard handed to them and never lock it themselves. Local
    sends that move balance take the ledger first and only drain after
    releasing it.
*/

/// Sent and received logs of this servent.
#[derive(Debug, Default)]
pub struct Ledger {
    pub sent: Vec<Message>,
    pub received: Vec<Message>,
}

/// Totals of a finished channel recording.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelTotal {
    pub recorded: i64,
    pub input: i64,
    pub output: i64,
}

impl ChannelTotal {
    pub fn total(&self) -> i64 {
        self.recorded + self.input - self.output
    }
}

/// Recorder for an outstanding Alagar-Venkatesan marker.
///
/// Nothing credits the output side: money leaving this servent after it
/// recorded is already out of the recorded balance.
#[derive(Debug, Default)]
pub struct ChannelState {
    pub initiator: Option<NodeId>,
    pub marker_clock: Option<ClockValues>,
    pub recorded_amount: i64,
    pub input: BTreeMap<NodeId, i64>,
    pub output: BTreeMap<NodeId, i64>,
}

impl ChannelState {
    pub fn is_active(&self) -> bool {
        self.marker_clock.is_some()
    }

    pub fn begin(&mut self, initiator: NodeId, marker_clock: ClockValues, recorded_amount: i64, channels: impl IntoIterator<Item = NodeId>) {
        self.input.clear();
        self.output.clear();
        for neighbor in channels {
            self.input.insert(neighbor, 0);
            self.output.insert(neighbor, 0);
        }
        self.initiator = Some(initiator);
        self.marker_clock = Some(marker_clock);
        self.recorded_amount = recorded_amount;
    }

    /// Counts `amount` as in transit if it was sent before its sender saw the marker.
    pub fn record(&mut self, sender_clock: &ClockValues, neighbor: NodeId, amount: i64) {
        let (Some(initiator), Some(marker)) = (self.initiator, self.marker_clock.as_ref()) else {
            return;
        };

        let sent = sender_clock.get(&initiator).copied().unwrap_or(0);
        let seen = marker.get(&initiator).copied().unwrap_or(0);
        if sent <= seen {
            *self.input.entry(neighbor).or_insert(0) += amount;
        }
    }

    /// Ends the recording and returns its totals, if one was running.
    pub fn terminate(&mut self) -> Option<ChannelTotal> {
        if !self.is_active() {
            return None;
        }

        let total = ChannelTotal {
            recorded: self.recorded_amount,
            input: self.input.values().sum(),
            output: self.output.values().sum(),
        };
        self.clear();
        Some(total)
    }

    pub fn clear(&mut self) {
        *self = ChannelState::default();
    }
}

pub struct DeliveryEngine {
    me: NodeId,
    strategy: Box<dyn OrderingStrategy>,
    clock: RwLock<VectorClock>,
    pending: Mutex<Vec<Message>>,
    ledger: Mutex<Ledger>,
    channel: Mutex<ChannelState>,
    handlers: RwLock<Weak<HandlerTable>>,
    jobs: Arc<AtomicUsize>,
}

impl DeliveryEngine {
    pub fn new(me: NodeId, node_count: usize, strategy: Box<dyn OrderingStrategy>) -> Self {
        DeliveryEngine {
            me,
            strategy,
            clock: RwLock::new(VectorClock::new(node_count)),
            pending: Mutex::new(Vec::new()),
            ledger: Mutex::new(Ledger::default()),
            channel: Mutex::new(ChannelState::default()),
            handlers: RwLock::new(Weak::new()),
            jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn stamp_order(&self) -> StampOrder {
        self.strategy.stamp_order()
    }

    /// Wires the dispatch table and delivers whatever was waiting for it.
    pub fn install_handlers(&self, handlers: &Arc<HandlerTable>) {
        *self.handlers.write() = Arc::downgrade(handlers);
        if let Err(err) = self.check_pending_messages() {
            error!(node = self.me, %err, "failed to drain after installing handlers");
        }
    }

    pub fn add_pending_message(&self, message: Message) {
        self.pending.lock().push(message);
    }

    pub fn check_pending_messages(&self) -> Result<bool, ClockError> {
        self.strategy
            .process_pending_messages(&self.pending, &self.clock, &mut |message| self.process_message(message))
    }

    /// Stamps a message originated here, advancing this servent's entry, then drains.
    pub fn causal_clock_increment(&self, message: Message) -> Message {
        let stamped = self.ledger().stamp(message);
        self.drain();
        stamped
    }

    /// Drain for callers that already hold a stamped message they must send anyway.
    pub fn drain(&self) {
        if let Err(err) = self.check_pending_messages() {
            error!(node = self.me, %err, "pending buffer drain failed");
        }
    }

    pub fn ledger(&self) -> LedgerGuard<'_> {
        LedgerGuard {
            engine: self,
            ledger: self.ledger.lock(),
        }
    }

    pub fn add_sent_message(&self, message: Message) {
        self.ledger.lock().sent.push(message);
    }

    pub fn add_received_message(&self, message: Message) {
        self.ledger.lock().received.push(message);
    }

    pub fn record_transaction(&self, sender_clock: &ClockValues, neighbor: NodeId, amount: i64) {
        self.channel.lock().record(sender_clock, neighbor, amount);
    }

    pub fn clock_values(&self) -> ClockValues {
        self.clock.read().values_copy()
    }

    /// Marker clock as the sender had it before it sent `message`.
    pub fn causal_past(&self, message: &Message) -> Option<ClockValues> {
        message
            .sender_clock
            .as_ref()
            .map(|clock| self.stamp_order().causal_past(clock, message.original_sender))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.lock().is_empty() && self.jobs.load(Ordering::SeqCst) == 0
    }

    fn process_message(&self, message: Message) -> Delivery {
        let Some(handlers) = self.handlers.read().upgrade() else {
            return Delivery::Deferred(message);
        };

        let follow_up = {
            let mut ledger = self.ledger();
            if message.is_ordered() {
                self.clock.write().increment(message.original_sender);
            }

            match handlers.get(message.kind) {
                Some(handler) => match handler.deliver(&message, &mut ledger) {
                    Ok(follow_up) => follow_up,
                    Err(err) => {
                        error!(node = self.me, msg = %message, %err, "handler failed");
                        None
                    }
                },
                None => {
                    warn!(node = self.me, kind = ?message.kind, "no handler registered");
                    None
                }
            }
        };

        debug!(node = self.me, msg = %message, "delivered");
        if let Some(follow_up) = follow_up {
            self.spawn_follow_up(message, follow_up);
        }
        Delivery::Delivered
    }

    fn spawn_follow_up(&self, message: Message, follow_up: FollowUp) {
        let job = Job::start(&self.jobs);
        let me = self.me;
        tokio::spawn(async move {
            let _job = job;
            if let Err(err) = follow_up() {
                error!(node = me, msg = %message, %err, "follow-up failed");
            }
        });
    }
}

/// Keeps the running follow-up count honest even if the task panics.
struct Job(Arc<AtomicUsize>);

impl Job {
    fn start(jobs: &Arc<AtomicUsize>) -> Self {
        jobs.fetch_add(1, Ordering::SeqCst);
        Job(jobs.clone())
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to the ledger. Every step that moves balance happens
/// while one of these is alive.
pub struct LedgerGuard<'a> {
    engine: &'a DeliveryEngine,
    ledger: MutexGuard<'a, Ledger>,
}

impl LedgerGuard<'_> {
    pub fn me(&self) -> NodeId {
        self.engine.me
    }

    pub fn sent(&self) -> &[Message] {
        &self.ledger.sent
    }

    pub fn received(&self) -> &[Message] {
        &self.ledger.received
    }

    /// Transfers sent and received so far, as shipped in a snapshot response.
    pub fn recorded_logs(&self) -> RecordedLogs {
        let transfers = |log: &[Message]| -> Vec<Message> {
            log.iter()
                .filter(|message| message.kind == MessageKind::Transaction)
                .cloned()
                .collect()
        };
        RecordedLogs {
            sent: transfers(&self.ledger.sent),
            received: transfers(&self.ledger.received),
        }
    }

    pub fn add_sent(&mut self, message: Message) {
        self.ledger.sent.push(message);
    }

    pub fn add_received(&mut self, message: Message) {
        self.ledger.received.push(message);
    }

    /// Copies the clock into `message` and advances this servent's entry, in
    /// the order the active delivery mode expects.
    pub fn stamp(&mut self, message: Message) -> Message {
        let me = self.engine.me;
        let mut clock = self.engine.clock.write();
        let stamp = match self.engine.stamp_order() {
            StampOrder::BeforeIncrement => {
                let values = clock.values_copy();
                clock.increment(me);
                values
            }
            StampOrder::AfterIncrement => {
                clock.increment(me);
                clock.values_copy()
            }
        };
        message.with_clock(stamp)
    }

    pub fn clock_values(&self) -> ClockValues {
        self.engine.clock.read().values_copy()
    }

    pub fn record_transaction(&mut self, sender_clock: &ClockValues, neighbor: NodeId, amount: i64) {
        self.engine.record_transaction(sender_clock, neighbor, amount);
    }

    pub fn channel(&mut self) -> MutexGuard<'_, ChannelState> {
        self.engine.channel.lock()
    }

    pub fn causal_past(&self, message: &Message) -> Option<ClockValues> {
        self.engine.causal_past(message)
    }
}
