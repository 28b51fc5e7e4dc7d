use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ClockError;

/*
    Every servent keeps one counter per servent in the system. A servent's own
    entry is advanced for every event it causes (a send), and the entry of
    another servent is advanced when a message originated by that servent is
    delivered locally. A copy of the clock travels with every ordered message
    so the receiver can tell whether everything the sender had seen has been
    delivered here as well.
*/

pub type NodeId = u32;

pub type ClockValues = BTreeMap<NodeId, u64>;

#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct VectorClock {
    values: ClockValues,
}

impl VectorClock {
    pub fn new(node_count: usize) -> Self {
        let mut clock = VectorClock::default();
        clock.initialize(node_count);
        clock
    }

    pub fn from_values(values: ClockValues) -> Self {
        VectorClock { values }
    }

    /// Resets the clock to one zeroed entry per servent `0..node_count`.
    pub fn initialize(&mut self, node_count: usize) {
        self.values = (0..node_count as NodeId).map(|id| (id, 0)).collect();
    }

    /// Unknown ids are ignored, the clock never grows past its initial size.
    pub fn increment(&mut self, node: NodeId) {
        if let Some(value) = self.values.get_mut(&node) {
            *value += 1;
        }
    }

    pub fn get(&self, node: NodeId) -> Option<u64> {
        self.values.get(&node).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values_copy(&self) -> ClockValues {
        self.values.clone()
    }

    /// True if any entry of `other` is strictly ahead of the local entry.
    pub fn is_other_greater(&self, other: &ClockValues) -> Result<bool, ClockError> {
        self.check_size(other)?;

        Ok(self
            .values
            .iter()
            .any(|(id, local)| other.get(id).is_some_and(|value| value > local)))
    }

    /// True if a message stamped with `sender_clock` by `sender` can not be
    /// delivered in FIFO order yet: the sender's entry must be exactly one
    /// ahead and no other entry may be ahead at all.
    pub fn is_causality_violated_fifo(
        &self,
        sender_clock: &ClockValues,
        sender: NodeId,
    ) -> Result<bool, ClockError> {
        self.check_size(sender_clock)?;

        Ok(sender_clock.iter().any(|(id, value)| {
            let local = self.values.get(id).copied().unwrap_or(0);
            if *id == sender {
                *value != local + 1
            } else {
                *value > local
            }
        }))
    }

    fn check_size(&self, other: &ClockValues) -> Result<(), ClockError> {
        if self.values.len() != other.len() {
            return Err(ClockError::SizeMismatch {
                local: self.values.len(),
                other: other.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.values)
    }
}
