use parking_lot::{Mutex, RwLock};
use tracing::error;

use super::message::Message;
use crate::common::{ClockError, ClockValues, DeliveryMode, NodeId, VectorClock};

/*
    The pending buffer is drained by repeatedly scanning it for the first
    message whose clock says it can be delivered. Delivering a message moves
    the local clock, which may unblock messages that were skipped earlier in
    the same scan, so the scan starts over after every delivery and stops only
    when a full pass delivers nothing.
*/

/// When a sender copies its clock into an outgoing message, relative to
/// advancing its own entry for that send.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StampOrder {
    BeforeIncrement,
    AfterIncrement,
}

impl StampOrder {
    /// The clock `sender` had right before the event that produced `stamp`.
    pub fn causal_past(self, stamp: &ClockValues, sender: NodeId) -> ClockValues {
        let mut past = stamp.clone();
        if self == StampOrder::AfterIncrement {
            if let Some(value) = past.get_mut(&sender) {
                *value = value.saturating_sub(1);
            }
        }
        past
    }
}

/// Outcome reported by the message processor for one deliverable message.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// Nothing can consume the message yet, it goes back into the buffer.
    Deferred(Message),
}

pub trait OrderingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn stamp_order(&self) -> StampOrder;

    fn can_process_message(&self, clock: &VectorClock, message: &Message) -> Result<bool, ClockError>;

    /// Delivers every message that is (or becomes) deliverable. Returns whether
    /// anything was delivered, or the first clock error once the scan is done.
    fn process_pending_messages(
        &self,
        pending: &Mutex<Vec<Message>>,
        clock: &RwLock<VectorClock>,
        processor: &mut dyn FnMut(Message) -> Delivery,
    ) -> Result<bool, ClockError> {
        let mut pending = pending.lock();
        let mut processed = false;
        let mut failure = None;

        loop {
            let scan = {
                let local = clock.read();
                pending.iter().enumerate().find_map(|(index, message)| {
                    match self.can_process_message(&local, message) {
                        Ok(true) => Some(Ok(index)),
                        Ok(false) => None,
                        Err(err) => Some(Err((index, err))),
                    }
                })
            };

            match scan {
                None => break,
                Some(Err((index, err))) => {
                    let evicted = pending.remove(index);
                    error!(strategy = self.name(), msg = %evicted, %err, "evicting message with mismatched clock");
                    failure.get_or_insert(err);
                }
                Some(Ok(index)) => {
                    let message = pending.remove(index);
                    match processor(message) {
                        Delivery::Delivered => processed = true,
                        Delivery::Deferred(message) => {
                            pending.push(message);
                            break;
                        }
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }
}

/// A message from S is deliverable once S's entry is exactly one ahead of the
/// local one and nothing else it depends on is missing.
#[derive(Debug, Default)]
pub struct FifoOrdering;

impl OrderingStrategy for FifoOrdering {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn stamp_order(&self) -> StampOrder {
        StampOrder::AfterIncrement
    }

    fn can_process_message(&self, clock: &VectorClock, message: &Message) -> Result<bool, ClockError> {
        match &message.sender_clock {
            None => Ok(true),
            Some(sender_clock) => clock
                .is_causality_violated_fifo(sender_clock, message.original_sender)
                .map(|violated| !violated),
        }
    }
}

/// A message is deliverable once no entry of its clock is ahead of the local one.
#[derive(Debug, Default)]
pub struct CausalOrdering;

impl OrderingStrategy for CausalOrdering {
    fn name(&self) -> &'static str {
        "causal"
    }

    fn stamp_order(&self) -> StampOrder {
        StampOrder::BeforeIncrement
    }

    fn can_process_message(&self, clock: &VectorClock, message: &Message) -> Result<bool, ClockError> {
        match &message.sender_clock {
            None => Ok(true),
            Some(sender_clock) => clock.is_other_greater(sender_clock).map(|greater| !greater),
        }
    }
}

pub fn ordering_for(mode: DeliveryMode) -> Box<dyn OrderingStrategy> {
    match mode {
        DeliveryMode::Fifo => Box::new(FifoOrdering),
        DeliveryMode::Causal => Box::new(CausalOrdering),
    }
}
