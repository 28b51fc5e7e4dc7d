use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::common::{ClockValues, MessageError, NodeId};

/*
    A message is stamped with the vector clock of its original sender at the
    moment it was committed. Broadcast messages keep their original sender and
    id on every hop, only the current receiver and the route change, so a
    servent can recognise a copy it has already seen. Messages of the
    coordinated checkpointing protocol are sent point to point and carry no
    clock at all: they are delivered on arrival.
*/

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum MessageKind {
    Poison,
    Transaction,
    AbSnapshotRequest,
    AbSnapshotResponse,
    AvMarker,
    AvDone,
    AvTerminate,
    CcSnapshotRequest,
    CcSnapshotResponse,
    CcResume,
}

/// Balance change owed by the servent that originates the message.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum SendEffect {
    #[default]
    None,
    Debit(i64),
}

/// Identity of a logical message, shared by all of its copies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct MessageKey {
    pub sender: NodeId,
    pub id: u64,
}

/// Identity of a transfer as recorded in sent and received logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TransferKey {
    pub sender: NodeId,
    pub id: u64,
    pub receiver: Option<NodeId>,
}

/// Sent and received logs shipped with an AB snapshot response.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct RecordedLogs {
    pub sent: Vec<Message>,
    pub received: Vec<Message>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u64,
    pub original_sender: NodeId,
    pub original_receiver: Option<NodeId>,
    pub current_receiver: NodeId,
    pub sender_clock: Option<ClockValues>,
    pub route: Vec<NodeId>,
    pub payload: String,
    pub attachment: Option<Box<RecordedLogs>>,
    #[serde(skip)]
    pub effect: SendEffect,
}

impl Message {
    pub fn new(kind: MessageKind, id: u64, sender: NodeId, receiver: Option<NodeId>) -> Self {
        Message {
            kind,
            id,
            original_sender: sender,
            original_receiver: receiver,
            current_receiver: receiver.unwrap_or(sender),
            sender_clock: None,
            route: Vec::new(),
            payload: String::new(),
            attachment: None,
            effect: SendEffect::None,
        }
    }

    pub fn transaction(id: u64, sender: NodeId, receiver: NodeId, amount: i64) -> Self {
        Message::new(MessageKind::Transaction, id, sender, Some(receiver))
            .with_payload(amount.to_string())
            .with_effect(SendEffect::Debit(amount))
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_clock(mut self, clock: ClockValues) -> Self {
        self.sender_clock = Some(clock);
        self
    }

    pub fn with_attachment(mut self, logs: RecordedLogs) -> Self {
        self.attachment = Some(Box::new(logs));
        self
    }

    pub fn with_effect(mut self, effect: SendEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Copy addressed to the next hop. Copies never carry the send effect.
    pub fn changed_receiver(&self, receiver: NodeId) -> Message {
        Message {
            current_receiver: receiver,
            effect: SendEffect::None,
            ..self.clone()
        }
    }

    /// Copy to re-send from `forwarder`, which joins the route.
    pub fn forwarded_by(&self, forwarder: NodeId) -> Message {
        let mut route = self.route.clone();
        route.push(forwarder);
        Message {
            route,
            effect: SendEffect::None,
            ..self.clone()
        }
    }

    /// Servent this copy came from: the last forwarder, else the original sender.
    pub fn last_hop(&self) -> NodeId {
        self.route.last().copied().unwrap_or(self.original_sender)
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender: self.original_sender,
            id: self.id,
        }
    }

    pub fn transfer_key(&self) -> TransferKey {
        TransferKey {
            sender: self.original_sender,
            id: self.id,
            receiver: self.original_receiver,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.sender_clock.is_some()
    }

    pub fn is_for(&self, node: NodeId) -> bool {
        self.original_receiver == Some(node)
    }

    pub fn amount(&self) -> Result<i64, MessageError> {
        self.payload
            .trim()
            .parse()
            .map_err(|_| MessageError::MalformedAmount(self.payload.clone()))
    }

    pub fn recorded_logs(&self) -> Result<&RecordedLogs, MessageError> {
        self.attachment
            .as_deref()
            .ok_or(MessageError::MissingAttachment(self.id))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}|{}|{:?}|{}|{}]",
            self.original_sender,
            self.id,
            self.kind,
            self.payload,
            self.current_receiver
        )
    }
}

/// Sequence of message ids for one originating servent.
#[derive(Debug, Default)]
pub struct MessageIds {
    next: AtomicU64,
}

impl MessageIds {
    pub fn new() -> Self {
        MessageIds::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
