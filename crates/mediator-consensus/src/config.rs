// Mediator consensus configuration
//
// RotationConfig is owned by the rotation scheduler and only changes through
// partial updates that merge into the existing values. MediatorConfig is the
// node-level configuration consumed by the three gating components.

use crate::mode::ConsensusMode;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid JSON configuration: {0}")]
    Parse(String),
    #[error("mediator_id cannot be empty")]
    EmptyMediatorId,
    #[error("chain endpoint must be an http(s) URL, got {0:?}")]
    InvalidEndpoint(String),
    #[error("request timeout must be > 0")]
    ZeroTimeout,
    #[error("rotation config: {0}")]
    Rotation(String),
}

/// Upper bound for hour-valued rotation settings (ten years).
pub const MAX_ROTATION_HOURS: u64 = 24 * 365 * 10;

const MINUTES_PER_HOUR: u64 = 60;
const MILLIS_PER_MINUTE: u64 = 60_000;

/// Validator rotation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationConfig {
    /// Size of the active validator set per epoch
    pub active_slots: usize,

    /// Epoch length in hours
    pub rotation_period_hours: u64,

    /// Length of one slot in minutes
    pub slot_duration_minutes: u64,

    /// Minimum effective stake to register and to be selected
    pub min_stake_for_rotation: u64,

    /// Consecutive missed slots that trigger automatic jailing
    pub jail_threshold: u32,

    /// Hours a jailed validator must wait before it can be unjailed
    pub unjail_cooldown_hours: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            active_slots: 21,
            rotation_period_hours: 24,
            slot_duration_minutes: 10,
            min_stake_for_rotation: 1000,
            jail_threshold: 3,
            unjail_cooldown_hours: 24,
        }
    }
}

/// Partial rotation config update. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationConfigUpdate {
    pub active_slots: Option<usize>,
    pub rotation_period_hours: Option<u64>,
    pub slot_duration_minutes: Option<u64>,
    pub min_stake_for_rotation: Option<u64>,
    pub jail_threshold: Option<u32>,
    pub unjail_cooldown_hours: Option<u64>,
}

impl RotationConfig {
    /// Merge a partial update into this config.
    pub fn apply(&mut self, update: &RotationConfigUpdate) {
        if let Some(v) = update.active_slots {
            self.active_slots = v;
        }
        if let Some(v) = update.rotation_period_hours {
            self.rotation_period_hours = v;
        }
        if let Some(v) = update.slot_duration_minutes {
            self.slot_duration_minutes = v;
        }
        if let Some(v) = update.min_stake_for_rotation {
            self.min_stake_for_rotation = v;
        }
        if let Some(v) = update.jail_threshold {
            self.jail_threshold = v;
        }
        if let Some(v) = update.unjail_cooldown_hours {
            self.unjail_cooldown_hours = v;
        }
    }

    // Hour values are clamped to MAX_ROTATION_HOURS so an unvalidated config
    // cannot overflow chrono durations.
    pub fn rotation_period(&self) -> Duration {
        Duration::hours(self.rotation_period_hours.min(MAX_ROTATION_HOURS) as i64)
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.slot_duration_minutes.saturating_mul(MILLIS_PER_MINUTE)
    }

    pub fn unjail_cooldown(&self) -> Duration {
        Duration::hours(self.unjail_cooldown_hours.min(MAX_ROTATION_HOURS) as i64)
    }

    /// Number of whole slots that fit in one epoch.
    pub fn slots_per_epoch(&self) -> u64 {
        if self.slot_duration_minutes == 0 {
            return 0;
        }
        self.rotation_period_hours.saturating_mul(MINUTES_PER_HOUR) / self.slot_duration_minutes
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_slots == 0 {
            return Err(ConfigError::Rotation("active_slots must be > 0".to_string()));
        }
        if self.rotation_period_hours == 0 {
            return Err(ConfigError::Rotation("rotation_period_hours must be > 0".to_string()));
        }
        if self.slot_duration_minutes == 0 {
            return Err(ConfigError::Rotation("slot_duration_minutes must be > 0".to_string()));
        }
        if self.jail_threshold == 0 {
            return Err(ConfigError::Rotation("jail_threshold must be > 0".to_string()));
        }
        if self.rotation_period_hours > MAX_ROTATION_HOURS {
            return Err(ConfigError::Rotation(format!(
                "rotation_period_hours must be <= {}",
                MAX_ROTATION_HOURS
            )));
        }
        if self.unjail_cooldown_hours > MAX_ROTATION_HOURS {
            return Err(ConfigError::Rotation(format!(
                "unjail_cooldown_hours must be <= {}",
                MAX_ROTATION_HOURS
            )));
        }
        let epoch_minutes = self
            .rotation_period_hours
            .checked_mul(MINUTES_PER_HOUR)
            .ok_or_else(|| ConfigError::Rotation("rotation_period_hours overflows".to_string()))?;
        if self
            .slot_duration_minutes
            .checked_mul(MILLIS_PER_MINUTE)
            .is_none()
        {
            return Err(ConfigError::Rotation("slot_duration_minutes overflows".to_string()));
        }
        if self.slot_duration_minutes > epoch_minutes {
            return Err(ConfigError::Rotation(format!(
                "slot of {} minutes does not fit in a {} hour epoch",
                self.slot_duration_minutes, self.rotation_period_hours
            )));
        }
        Ok(())
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Node configuration consumed by the consensus gating components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediatorConfig {
    pub mediator_id: String,

    /// Key submitted with authority-add proposals. Falls back to `mediator_id`.
    #[serde(default)]
    pub mediator_public_key: Option<String>,

    #[serde(default)]
    pub consensus_mode: ConsensusMode,

    /// Base URL of the chain API, e.g. `http://localhost:3000`
    pub chain_endpoint: String,

    /// Own stake bonded at startup
    #[serde(default)]
    pub bonded_stake_amount: u64,

    /// Minimum effective stake for mediating; `None` or 0 disables the check
    #[serde(default)]
    pub min_effective_stake: Option<u64>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub rotation: RotationConfig,
}

impl MediatorConfig {
    pub fn new(mediator_id: impl Into<String>, chain_endpoint: impl Into<String>) -> Self {
        MediatorConfig {
            mediator_id: mediator_id.into(),
            mediator_public_key: None,
            consensus_mode: ConsensusMode::default(),
            chain_endpoint: chain_endpoint.into(),
            bonded_stake_amount: 0,
            min_effective_stake: None,
            request_timeout_secs: default_request_timeout_secs(),
            rotation: RotationConfig::default(),
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: MediatorConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Key this node presents to governance.
    pub fn public_key(&self) -> &str {
        self.mediator_public_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.mediator_id)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mediator_id.trim().is_empty() {
            return Err(ConfigError::EmptyMediatorId);
        }
        if !(self.chain_endpoint.starts_with("http://") || self.chain_endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(self.chain_endpoint.clone()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        self.rotation.validate()
    }
}
