// Epochs, slots and active-set selection
//
// INVARIANTS:
// 1. An Epoch is immutable once created; re-selection produces a new Epoch
// 2. Active-set selection is deterministic for identical validator state
// 3. Jailed validators and validators below the minimum stake are never selected
// 4. Slots rotate round-robin over the ranked active set

use crate::config::RotationConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Known mediator as tracked by the rotation scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInfo {
    pub mediator_id: String,
    pub effective_stake: u64,

    /// Member of the current epoch's active set
    pub is_active: bool,

    /// Rank in the current active set, -1 when not active
    pub slot_index: i64,

    pub last_active_at: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,

    /// Consecutive missed slots since the last observed activity
    pub missed_slots: u32,
}

impl ValidatorInfo {
    pub fn new(mediator_id: String, effective_stake: u64, now: DateTime<Utc>) -> Self {
        ValidatorInfo {
            mediator_id,
            effective_stake,
            is_active: false,
            slot_index: -1,
            last_active_at: now,
            joined_at: now,
            missed_slots: 0,
        }
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.slot_index = -1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JailRecord {
    pub reason: String,
    pub jailed_at: DateTime<Utc>,
}

impl JailRecord {
    /// Whether `cooldown` has fully elapsed at `now`.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        now - self.jailed_at >= cooldown
    }
}

/// One rotation period with a fixed, ranked active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub epoch_number: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub active_validators: Vec<String>,
    pub slot_duration_ms: u64,
    pub total_slots: u64,
}

impl Epoch {
    pub fn new(
        epoch_number: u64,
        start_time: DateTime<Utc>,
        active_validators: Vec<String>,
        config: &RotationConfig,
    ) -> Self {
        Epoch {
            epoch_number,
            start_time,
            end_time: start_time + config.rotation_period(),
            active_validators,
            slot_duration_ms: config.slot_duration_ms(),
            total_slots: config.slots_per_epoch(),
        }
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Absolute slot counter since the epoch started, `None` before the start.
    pub fn slot_number_at(&self, time: DateTime<Utc>) -> Option<u64> {
        if time < self.start_time || self.slot_duration_ms == 0 {
            return None;
        }
        let elapsed_ms = (time - self.start_time).num_milliseconds() as u64;
        Some(elapsed_ms / self.slot_duration_ms)
    }

    pub fn slot_start(&self, slot_number: u64) -> DateTime<Utc> {
        self.start_time + Duration::milliseconds((slot_number * self.slot_duration_ms) as i64)
    }

    /// Assignment for `slot_number` over `rotation`, round-robin.
    pub fn assignment(
        &self,
        slot_number: u64,
        rotation: &[String],
        is_current_slot: bool,
    ) -> Option<SlotAssignment> {
        if rotation.is_empty() {
            return None;
        }
        let slot_index = (slot_number % rotation.len() as u64) as usize;
        let start_time = self.slot_start(slot_number);
        Some(SlotAssignment {
            epoch_number: self.epoch_number,
            slot_number,
            slot_index,
            validator_id: rotation[slot_index].clone(),
            start_time,
            end_time: start_time + Duration::milliseconds(self.slot_duration_ms as i64),
            is_current_slot,
        })
    }
}

/// A slot derived from the current epoch and wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAssignment {
    pub epoch_number: u64,
    /// Slots elapsed since the epoch started
    pub slot_number: u64,
    /// Position of the assignee in the rotation
    pub slot_index: usize,
    pub validator_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_current_slot: bool,
}

/// Rank eligible validators for a new epoch.
///
/// Excludes jailed validators and those below `min_stake_for_rotation`, orders
/// by effective stake descending, breaks ties by earlier `joined_at` and then
/// by mediator id, and keeps the top `active_slots`.
pub fn select_active_set(
    validators: &HashMap<String, ValidatorInfo>,
    jailed: &HashMap<String, JailRecord>,
    config: &RotationConfig,
) -> Vec<String> {
    let mut eligible: Vec<&ValidatorInfo> = validators
        .values()
        .filter(|v| !jailed.contains_key(&v.mediator_id))
        .filter(|v| v.effective_stake >= config.min_stake_for_rotation)
        .collect();

    eligible.sort_by(|a, b| {
        b.effective_stake
            .cmp(&a.effective_stake)
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.mediator_id.cmp(&b.mediator_id))
    });

    eligible
        .into_iter()
        .take(config.active_slots)
        .map(|v| v.mediator_id.clone())
        .collect()
}
