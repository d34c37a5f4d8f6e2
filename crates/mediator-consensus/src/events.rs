// Rotation event log
//
// Append-only audit trail of validator set changes, bounded to the most
// recent MAX_ROTATION_EVENTS entries. The oldest entry is evicted on push.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Maximum number of retained rotation events.
pub const MAX_ROTATION_EVENTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationEventType {
    EpochStart,
    ValidatorJoined,
    ValidatorLeft,
    ValidatorJailed,
    StakeChanged,
}

impl RotationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationEventType::EpochStart => "epoch_start",
            RotationEventType::ValidatorJoined => "validator_joined",
            RotationEventType::ValidatorLeft => "validator_left",
            RotationEventType::ValidatorJailed => "validator_jailed",
            RotationEventType::StakeChanged => "stake_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationEvent {
    pub event_id: Uuid,
    pub event_type: RotationEventType,
    pub timestamp: DateTime<Utc>,
    pub epoch_number: u64,
    pub affected_validators: Vec<String>,
    pub details: serde_json::Value,
}

impl RotationEvent {
    pub fn new(
        event_type: RotationEventType,
        timestamp: DateTime<Utc>,
        epoch_number: u64,
        affected_validators: Vec<String>,
        details: serde_json::Value,
    ) -> Self {
        RotationEvent {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp,
            epoch_number,
            affected_validators,
            details,
        }
    }
}

/// Fixed-capacity ring buffer of rotation events.
#[derive(Debug, Clone)]
pub struct RotationEventLog {
    events: VecDeque<RotationEvent>,
    capacity: usize,
}

impl RotationEventLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ROTATION_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RotationEventLog {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: RotationEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// All retained events, oldest first.
    pub fn snapshot(&self) -> Vec<RotationEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for RotationEventLog {
    fn default() -> Self {
        Self::new()
    }
}
