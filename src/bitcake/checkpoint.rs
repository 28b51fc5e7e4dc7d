use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::manager::BitcakeManager;
use crate::broadcast::{Message, MessageKind};
use crate::common::NodeId;

/*
    Coordinated checkpointing freezes the balance of a servent between the
    moment it records it and the moment the initiator says everyone has
    recorded. While frozen, credits addressed to this servent wait in a queue
    and transfers it originates wait in another. Both are released on exit.
*/

/// Transfer originated while frozen, sent after the snapshot ends.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeferredTransfer {
    pub receiver: NodeId,
    pub amount: i64,
}

#[derive(Debug)]
pub struct CheckpointBitcakeManager {
    me: NodeId,
    bitcake: Arc<BitcakeManager>,
    snapshot_mode: AtomicBool,
    initiator: Mutex<Option<NodeId>>,
    queued: Mutex<Vec<Message>>,
    deferred: Mutex<Vec<DeferredTransfer>>,
}

impl CheckpointBitcakeManager {
    pub fn new(me: NodeId, bitcake: Arc<BitcakeManager>) -> Self {
        CheckpointBitcakeManager {
            me,
            bitcake,
            snapshot_mode: AtomicBool::new(false),
            initiator: Mutex::new(None),
            queued: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn bitcake(&self) -> &BitcakeManager {
        &self.bitcake
    }

    pub fn is_snapshot_mode(&self) -> bool {
        self.snapshot_mode.load(Ordering::SeqCst)
    }

    pub fn initiator(&self) -> Option<NodeId> {
        *self.initiator.lock()
    }

    /// Freezes the balance for a snapshot started by `initiator`. Returns false
    /// if it was already frozen.
    pub fn enter_snapshot_mode(&self, initiator: NodeId) -> bool {
        if self
            .snapshot_mode
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.initiator.lock() = Some(initiator);
        info!(node = self.me, initiator, balance = self.bitcake.current(), "entered snapshot mode");
        true
    }

    pub fn should_queue_message(&self, message: &Message) -> bool {
        self.is_snapshot_mode() && message.kind == MessageKind::Transaction && message.is_for(self.me)
    }

    pub fn queue_message(&self, message: Message) {
        self.queued.lock().push(message);
    }

    /// Holds back a local transfer if frozen. Returns whether it was held.
    pub fn defer_if_frozen(&self, receiver: NodeId, amount: i64) -> bool {
        if !self.is_snapshot_mode() {
            return false;
        }
        self.deferred.lock().push(DeferredTransfer { receiver, amount });
        true
    }

    /// Unfreezes and hands back what piled up: queued credits and deferred transfers.
    pub fn exit_snapshot_mode(&self) -> (Vec<Message>, Vec<DeferredTransfer>) {
        if !self.snapshot_mode.swap(false, Ordering::SeqCst) {
            return (Vec::new(), Vec::new());
        }
        *self.initiator.lock() = None;

        let queued = std::mem::take(&mut *self.queued.lock());
        let deferred = std::mem::take(&mut *self.deferred.lock());
        info!(
            node = self.me,
            queued = queued.len(),
            deferred = deferred.len(),
            "exited snapshot mode"
        );
        (queued, deferred)
    }
}
