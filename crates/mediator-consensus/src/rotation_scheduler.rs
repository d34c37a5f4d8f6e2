// DPoS validator rotation scheduler
//
// Owns the validator registry, the current epoch, jail records and the
// rotation event log. Slot and epoch computations only read cached local
// state; chain I/O happens at start-up and on registration.
//
// INVARIANTS:
// 1. Exactly one epoch is current once the scheduler has been initialized
// 2. Epoch numbers start at 0 and increase by one per (re-)initialization
// 3. A jailed validator is never selected and never holds a slot
// 4. Jail records only go away through an explicit unjail after the cooldown
// 5. The event log holds at most MAX_ROTATION_EVENTS entries

use crate::chain::{ChainApi, ValidatorRegistration};
use crate::clock::Clock;
use crate::config::{ConfigError, MediatorConfig, RotationConfig, RotationConfigUpdate};
use crate::epoch::{select_active_set, Epoch, JailRecord, SlotAssignment, ValidatorInfo};
use crate::events::{RotationEvent, RotationEventLog, RotationEventType};
use crate::mode::ConsensusMode;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often the background task checks for epoch rollover and expired jail cooldowns.
pub const EPOCH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Reason recorded when missed slots trigger jailing.
pub const MISSED_SLOTS_REASON: &str = "Missed slots";

/// Snapshot of the scheduler for operators and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub mediator_id: String,
    pub consensus_mode: ConsensusMode,
    pub is_running: bool,
    pub current_epoch: Option<u64>,
    pub epoch_start_time: Option<DateTime<Utc>>,
    pub epoch_end_time: Option<DateTime<Utc>>,
    pub total_validators: usize,
    pub active_validators: usize,
    pub jailed_validators: usize,
    pub current_slot: Option<SlotAssignment>,
    pub is_current_validator: bool,
    pub time_until_next_slot_ms: i64,
    pub config: RotationConfig,
}

struct SchedulerState {
    config: RotationConfig,
    validators: HashMap<String, ValidatorInfo>,
    jailed: HashMap<String, JailRecord>,
    current_epoch: Option<Epoch>,
    events: RotationEventLog,
}

impl SchedulerState {
    fn new(config: RotationConfig) -> Self {
        SchedulerState {
            config,
            validators: HashMap::new(),
            jailed: HashMap::new(),
            current_epoch: None,
            events: RotationEventLog::new(),
        }
    }

    fn epoch_number(&self) -> u64 {
        self.current_epoch.as_ref().map(|e| e.epoch_number).unwrap_or(0)
    }

    fn push_event(
        &mut self,
        event_type: RotationEventType,
        now: DateTime<Utc>,
        affected: Vec<String>,
        details: serde_json::Value,
    ) {
        let epoch = self.epoch_number();
        self.events
            .push(RotationEvent::new(event_type, now, epoch, affected, details));
    }

    /// Insert or overwrite a validator record. Rejects stakes below the rotation minimum.
    fn insert_validator(&mut self, mediator_id: &str, stake: u64, now: DateTime<Utc>) -> bool {
        if stake < self.config.min_stake_for_rotation {
            debug!(
                "Rejecting validator {}: stake {} below minimum {}",
                mediator_id, stake, self.config.min_stake_for_rotation
            );
            return false;
        }

        self.validators.insert(
            mediator_id.to_string(),
            ValidatorInfo::new(mediator_id.to_string(), stake, now),
        );
        self.sync_active_flag(mediator_id);
        self.push_event(
            RotationEventType::ValidatorJoined,
            now,
            vec![mediator_id.to_string()],
            json!({ "effectiveStake": stake }),
        );
        true
    }

    /// Recompute `is_active`/`slot_index` of one validator from the current epoch.
    fn sync_active_flag(&mut self, mediator_id: &str) {
        let rank = if self.jailed.contains_key(mediator_id) {
            None
        } else {
            self.current_epoch
                .as_ref()
                .and_then(|e| e.active_validators.iter().position(|id| id == mediator_id))
        };
        if let Some(info) = self.validators.get_mut(mediator_id) {
            match rank {
                Some(rank) => {
                    info.is_active = true;
                    info.slot_index = rank as i64;
                }
                None => info.deactivate(),
            }
        }
    }

    fn initialize_epoch(&mut self, now: DateTime<Utc>) -> Epoch {
        let active = select_active_set(&self.validators, &self.jailed, &self.config);
        let epoch_number = self
            .current_epoch
            .as_ref()
            .map(|e| e.epoch_number + 1)
            .unwrap_or(0);
        let epoch = Epoch::new(epoch_number, now, active, &self.config);

        for info in self.validators.values_mut() {
            info.deactivate();
        }
        for (rank, id) in epoch.active_validators.iter().enumerate() {
            if let Some(info) = self.validators.get_mut(id) {
                info.is_active = true;
                info.slot_index = rank as i64;
            }
        }

        self.current_epoch = Some(epoch.clone());
        self.push_event(
            RotationEventType::EpochStart,
            now,
            epoch.active_validators.clone(),
            json!({
                "activeValidators": epoch.active_validators.len(),
                "totalSlots": epoch.total_slots,
                "endTime": epoch.end_time,
            }),
        );
        info!(
            "Epoch {} started with {} active validators ({} slots of {} ms)",
            epoch.epoch_number,
            epoch.active_validators.len(),
            epoch.total_slots,
            epoch.slot_duration_ms
        );
        epoch
    }

    fn roll_epoch_if_due(&mut self, now: DateTime<Utc>) -> Option<Epoch> {
        let due = self
            .current_epoch
            .as_ref()
            .map(|e| e.has_ended(now))
            .unwrap_or(false);
        if due {
            Some(self.initialize_epoch(now))
        } else {
            None
        }
    }

    /// Ranked active set of the current epoch minus jailed or removed validators.
    fn rotation(&self) -> Vec<String> {
        match &self.current_epoch {
            Some(epoch) => epoch
                .active_validators
                .iter()
                .filter(|id| self.validators.contains_key(*id) && !self.jailed.contains_key(*id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn current_slot(&self, now: DateTime<Utc>) -> Option<SlotAssignment> {
        let epoch = self.current_epoch.as_ref()?;
        let slot_number = epoch.slot_number_at(now)?;
        epoch.assignment(slot_number, &self.rotation(), true)
    }

    /// First slot strictly after the current one that belongs to `mediator_id`.
    fn next_slot_for(&self, mediator_id: &str, now: DateTime<Utc>) -> Option<SlotAssignment> {
        let epoch = self.current_epoch.as_ref()?;
        let rotation = self.rotation();
        let position = rotation.iter().position(|id| id == mediator_id)? as u64;
        let n = rotation.len() as u64;

        let first_candidate = match epoch.slot_number_at(now) {
            Some(current) => current + 1,
            None => 0,
        };
        let offset = (position + n - first_candidate % n) % n;
        epoch.assignment(first_candidate + offset, &rotation, false)
    }

    fn jail(&mut self, mediator_id: &str, reason: &str, now: DateTime<Utc>) {
        if !self.validators.contains_key(mediator_id) {
            debug!("Ignoring jail request for unknown validator {}", mediator_id);
            return;
        }

        self.jailed.insert(
            mediator_id.to_string(),
            JailRecord {
                reason: reason.to_string(),
                jailed_at: now,
            },
        );
        self.sync_active_flag(mediator_id);
        self.push_event(
            RotationEventType::ValidatorJailed,
            now,
            vec![mediator_id.to_string()],
            json!({ "reason": reason }),
        );
        info!("Validator {} jailed: {}", mediator_id, reason);
    }

    fn unjail(&mut self, mediator_id: &str, now: DateTime<Utc>) -> bool {
        let cooldown = self.config.unjail_cooldown();
        match self.jailed.get(mediator_id) {
            None => return false,
            Some(record) if !record.cooldown_elapsed(now, cooldown) => {
                debug!(
                    "Validator {} still cooling down (jailed at {})",
                    mediator_id, record.jailed_at
                );
                return false;
            }
            Some(_) => {}
        }

        self.jailed.remove(mediator_id);
        if let Some(info) = self.validators.get_mut(mediator_id) {
            info.missed_slots = 0;
        }
        self.sync_active_flag(mediator_id);
        info!("Validator {} unjailed", mediator_id);
        true
    }

    fn eligible_for_unjail(&self, now: DateTime<Utc>) -> Vec<String> {
        let cooldown = self.config.unjail_cooldown();
        let mut ids: Vec<String> = self
            .jailed
            .iter()
            .filter(|(_, record)| record.cooldown_elapsed(now, cooldown))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

struct SchedulerInner {
    mediator_id: String,
    mode: ConsensusMode,
    chain: Arc<dyn ChainApi>,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerInner {
    fn on_tick(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.roll_epoch_if_due(now);
        for id in state.eligible_for_unjail(now) {
            info!("Validator {} has served its jail cooldown and may be unjailed", id);
        }
    }
}

pub struct RotationScheduler {
    inner: Arc<SchedulerInner>,
}

impl RotationScheduler {
    pub fn new(
        mediator_id: impl Into<String>,
        mode: ConsensusMode,
        config: RotationConfig,
        chain: Arc<dyn ChainApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RotationScheduler {
            inner: Arc::new(SchedulerInner {
                mediator_id: mediator_id.into(),
                mode,
                chain,
                clock,
                state: Mutex::new(SchedulerState::new(config)),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &MediatorConfig, chain: Arc<dyn ChainApi>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.mediator_id.clone(),
            config.consensus_mode,
            config.rotation.clone(),
            chain,
            clock,
        )
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Load known validators, open the first epoch and start the periodic checks.
    ///
    /// A chain failure leaves the validator set empty instead of failing start-up.
    pub async fn start(&self) {
        if self.is_running() {
            return;
        }

        match self.inner.chain.fetch_validators().await {
            Ok(records) => {
                let now = self.now();
                let mut state = self.inner.state.lock();
                let mut loaded = 0usize;
                for record in records {
                    if state.insert_validator(&record.mediator_id, record.effective_stake, now) {
                        loaded += 1;
                    }
                }
                info!("Loaded {} validators from chain", loaded);
            }
            Err(e) => {
                warn!("Failed to load validators, starting with an empty set: {}", e);
            }
        }

        let now = self.now();
        {
            let mut state = self.inner.state.lock();
            state.initialize_epoch(now);
            if self.inner.mode.uses_rotation() && !state.validators.contains_key(&self.inner.mediator_id) {
                warn!(
                    "{} is not a registered validator and will not be scheduled in {} mode",
                    self.inner.mediator_id, self.inner.mode
                );
            }
        }

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.on_tick();
            }
        });
        *self.inner.timer.lock() = Some(handle);
        info!(
            "Rotation scheduler started for {} in {} mode",
            self.inner.mediator_id, self.inner.mode
        );
    }

    /// Cancel periodic checks. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
            info!("Rotation scheduler stopped for {}", self.inner.mediator_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Register or re-register a validator, then notify the chain on a best-effort basis.
    pub async fn register_validator(&self, mediator_id: &str, stake: u64) -> bool {
        let now = self.now();
        if !self.inner.state.lock().insert_validator(mediator_id, stake, now) {
            return false;
        }
        info!("Validator {} registered with stake {}", mediator_id, stake);

        let registration = ValidatorRegistration {
            mediator_id: mediator_id.to_string(),
            effective_stake: stake,
            joined_at: now.timestamp_millis(),
        };
        if let Err(e) = self.inner.chain.register_validator(&registration).await {
            warn!("Failed to notify chain of validator {}: {}", mediator_id, e);
        }
        true
    }

    /// Update stake of a known validator. Takes effect at the next selection.
    pub fn update_validator_stake(&self, mediator_id: &str, new_stake: u64) {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let old_stake = match state.validators.get_mut(mediator_id) {
            Some(info) => std::mem::replace(&mut info.effective_stake, new_stake),
            None => return,
        };
        state.push_event(
            RotationEventType::StakeChanged,
            now,
            vec![mediator_id.to_string()],
            json!({ "oldStake": old_stake, "newStake": new_stake }),
        );
    }

    pub fn remove_validator(&self, mediator_id: &str) {
        let now = self.now();
        let mut state = self.inner.state.lock();
        if state.validators.remove(mediator_id).is_none() {
            return;
        }
        state.push_event(
            RotationEventType::ValidatorLeft,
            now,
            vec![mediator_id.to_string()],
            serde_json::Value::Null,
        );
        info!("Validator {} removed", mediator_id);
    }

    /// Jail a validator until it is explicitly unjailed. Re-jailing overwrites the record.
    pub fn jail_validator(&self, mediator_id: &str, reason: &str) {
        let now = self.now();
        self.inner.state.lock().jail(mediator_id, reason, now);
    }

    /// Lift a jail once the cooldown has elapsed.
    pub fn unjail_validator(&self, mediator_id: &str) -> bool {
        let now = self.now();
        self.inner.state.lock().unjail(mediator_id, now)
    }

    pub fn record_missed_slot(&self, mediator_id: &str) {
        let now = self.now();
        let mut state = self.inner.state.lock();
        let threshold = state.config.jail_threshold;
        let missed = match state.validators.get_mut(mediator_id) {
            Some(info) => {
                info.missed_slots = info.missed_slots.saturating_add(1);
                info.missed_slots
            }
            None => return,
        };
        warn!("Validator {} missed a slot ({}/{})", mediator_id, missed, threshold);

        if missed >= threshold && !state.jailed.contains_key(mediator_id) {
            state.jail(mediator_id, MISSED_SLOTS_REASON, now);
        }
    }

    pub fn record_slot_activity(&self, mediator_id: &str) {
        let now = self.now();
        if let Some(info) = self.inner.state.lock().validators.get_mut(mediator_id) {
            info.missed_slots = 0;
            info.last_active_at = now;
        }
    }

    /// Select a new active set and open the next epoch immediately.
    pub fn initialize_epoch(&self) -> Epoch {
        let now = self.now();
        self.inner.state.lock().initialize_epoch(now)
    }

    /// Roll over to a new epoch if the current one has ended.
    pub fn check_epoch_transition(&self) -> Option<Epoch> {
        let now = self.now();
        self.inner.state.lock().roll_epoch_if_due(now)
    }

    pub fn get_current_epoch(&self) -> Option<Epoch> {
        self.inner.state.lock().current_epoch.clone()
    }

    pub fn get_current_slot(&self) -> Option<SlotAssignment> {
        let now = self.now();
        self.inner.state.lock().current_slot(now)
    }

    pub fn is_current_validator(&self) -> bool {
        self.get_current_slot()
            .map(|slot| slot.validator_id == self.inner.mediator_id)
            .unwrap_or(false)
    }

    pub fn get_next_slot_for_mediator(&self) -> Option<SlotAssignment> {
        let now = self.now();
        self.inner
            .state
            .lock()
            .next_slot_for(&self.inner.mediator_id, now)
    }

    /// Milliseconds until this node's next slot starts, or -1 when not in the active set.
    pub fn get_time_until_next_slot(&self) -> i64 {
        let now = self.now();
        match self.inner.state.lock().next_slot_for(&self.inner.mediator_id, now) {
            Some(slot) => (slot.start_time - now).num_milliseconds().max(0),
            None => -1,
        }
    }

    /// Rotation gate. Under `dpos` only the current slot holder mediates; under
    /// `hybrid` any member of the active set does. `poa` is gated by the
    /// authority set, not here.
    pub fn should_mediate(&self) -> bool {
        match self.inner.mode {
            ConsensusMode::Permissionless => true,
            ConsensusMode::Dpos => self.is_current_validator(),
            ConsensusMode::Hybrid => self
                .inner
                .state
                .lock()
                .validators
                .get(&self.inner.mediator_id)
                .map(|v| v.is_active)
                .unwrap_or(false),
            ConsensusMode::Poa => true,
        }
    }

    /// Merge a partial config update. An update that would make the config invalid is rejected.
    pub fn update_rotation_config(&self, update: &RotationConfigUpdate) -> Result<(), ConfigError> {
        let mut state = self.inner.state.lock();
        let mut merged = state.config.clone();
        merged.apply(update);
        merged.validate()?;
        state.config = merged;
        Ok(())
    }

    pub fn get_rotation_config(&self) -> RotationConfig {
        self.inner.state.lock().config.clone()
    }

    pub fn get_rotation_events(&self) -> Vec<RotationEvent> {
        self.inner.state.lock().events.snapshot()
    }

    pub fn get_validator(&self, mediator_id: &str) -> Option<ValidatorInfo> {
        self.inner.state.lock().validators.get(mediator_id).cloned()
    }

    /// All known validators ordered by mediator id.
    pub fn get_all_validators(&self) -> Vec<ValidatorInfo> {
        let state = self.inner.state.lock();
        let mut all: Vec<ValidatorInfo> = state.validators.values().cloned().collect();
        all.sort_by(|a, b| a.mediator_id.cmp(&b.mediator_id));
        all
    }

    /// Active validators in rank order.
    pub fn get_active_validators(&self) -> Vec<ValidatorInfo> {
        let state = self.inner.state.lock();
        let mut active: Vec<ValidatorInfo> = state
            .validators
            .values()
            .filter(|v| v.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|v| v.slot_index);
        active
    }

    pub fn get_jailed_validators(&self) -> BTreeMap<String, JailRecord> {
        self.inner
            .state
            .lock()
            .jailed
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Jailed validators whose cooldown has elapsed.
    pub fn validators_eligible_for_unjail(&self) -> Vec<String> {
        let now = self.now();
        self.inner.state.lock().eligible_for_unjail(now)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let now = self.now();
        let is_running = self.is_running();
        let state = self.inner.state.lock();
        let current_slot = state.current_slot(now);
        let is_current_validator = current_slot
            .as_ref()
            .map(|s| s.validator_id == self.inner.mediator_id)
            .unwrap_or(false);
        let time_until_next_slot_ms = state
            .next_slot_for(&self.inner.mediator_id, now)
            .map(|s| (s.start_time - now).num_milliseconds().max(0))
            .unwrap_or(-1);

        SchedulerStatus {
            mediator_id: self.inner.mediator_id.clone(),
            consensus_mode: self.inner.mode,
            is_running,
            current_epoch: state.current_epoch.as_ref().map(|e| e.epoch_number),
            epoch_start_time: state.current_epoch.as_ref().map(|e| e.start_time),
            epoch_end_time: state.current_epoch.as_ref().map(|e| e.end_time),
            total_validators: state.validators.len(),
            active_validators: state.validators.values().filter(|v| v.is_active).count(),
            jailed_validators: state.jailed.len(),
            current_slot,
            is_current_validator,
            time_until_next_slot_ms,
            config: state.config.clone(),
        }
    }

    pub fn mediator_id(&self) -> &str {
        &self.inner.mediator_id
    }

    pub fn mode(&self) -> ConsensusMode {
        self.inner.mode
    }
}

impl Drop for RotationScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
