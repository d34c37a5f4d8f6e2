// Stake ledger
//
// Tracks this node's bonded stake and the delegations pointed at it.
//
// INVARIANTS:
// 1. effective_stake == amount + delegated_amount after every mutation
// 2. delegated_amount only counts delegations with status Active
// 3. A failed delegation fetch zeroes delegated stake instead of keeping it stale
// 4. Slashing is applied locally even when the chain notification fails

use crate::chain::{BondRequest, ChainApi, Delegation, SlashingReport, UnbondRequest};
use crate::clock::Clock;
use crate::config::MediatorConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Unbonding waiting period (30 days).
pub const UNBONDING_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeStatus {
    Bonded,
    Unbonding,
    Unbonded,
}

/// Stake position of this mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stake {
    pub mediator_id: String,

    /// Own bonded stake
    pub amount: u64,

    /// Sum of active delegations
    pub delegated_amount: u64,

    /// amount + delegated_amount
    pub effective_stake: u64,

    /// Every known delegation record, whatever its status
    pub delegators: Vec<Delegation>,

    pub unbonding_period_secs: u64,
    pub status: StakeStatus,
}

impl Stake {
    pub fn new(mediator_id: String, amount: u64) -> Self {
        Stake {
            mediator_id,
            amount,
            delegated_amount: 0,
            effective_stake: amount,
            delegators: Vec::new(),
            unbonding_period_secs: UNBONDING_PERIOD_SECS,
            status: StakeStatus::Unbonded,
        }
    }

    fn recompute(&mut self) {
        self.effective_stake = self.amount.saturating_add(self.delegated_amount);
    }

    fn set_delegations(&mut self, delegations: Vec<Delegation>) {
        self.delegated_amount = delegations
            .iter()
            .filter(|d| d.is_active())
            .fold(0u64, |acc, d| acc.saturating_add(d.amount));
        self.delegators = delegations;
        self.recompute();
    }
}

pub struct StakeLedger {
    mediator_id: String,
    min_effective_stake: Option<u64>,
    chain: Arc<dyn ChainApi>,
    clock: Arc<dyn Clock>,
    stake: Mutex<Stake>,
}

impl StakeLedger {
    pub fn new(
        mediator_id: impl Into<String>,
        initial_amount: u64,
        min_effective_stake: Option<u64>,
        chain: Arc<dyn ChainApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mediator_id = mediator_id.into();
        StakeLedger {
            stake: Mutex::new(Stake::new(mediator_id.clone(), initial_amount)),
            mediator_id,
            min_effective_stake,
            chain,
            clock,
        }
    }

    pub fn from_config(config: &MediatorConfig, chain: Arc<dyn ChainApi>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.mediator_id.clone(),
            config.bonded_stake_amount,
            config.min_effective_stake,
            chain,
            clock,
        )
    }

    /// Log the starting position and pull delegations once.
    pub async fn initialize(&self) {
        {
            let stake = self.stake.lock();
            info!(
                "Stake ledger for {} starting with amount={} status={:?}",
                self.mediator_id, stake.amount, stake.status
            );
        }
        self.load_delegations().await;
    }

    /// Bond `amount` of own stake. State changes only if the chain accepts.
    pub async fn bond_stake(&self, amount: u64) -> bool {
        let request = BondRequest {
            mediator_id: self.mediator_id.clone(),
            amount,
            timestamp: self.clock.now_millis(),
        };

        match self.chain.bond_stake(&request).await {
            Ok(()) => {
                let mut stake = self.stake.lock();
                stake.amount = amount;
                stake.status = StakeStatus::Bonded;
                stake.recompute();
                info!(
                    "Bonded {} for {} (effective stake {})",
                    amount, self.mediator_id, stake.effective_stake
                );
                true
            }
            Err(e) => {
                warn!("Failed to bond stake for {}: {}", self.mediator_id, e);
                false
            }
        }
    }

    /// Start unbonding. The amount is released chain-side after the unbonding period.
    pub async fn unbond_stake(&self) -> bool {
        let request = UnbondRequest {
            mediator_id: self.mediator_id.clone(),
            timestamp: self.clock.now_millis(),
        };

        match self.chain.unbond_stake(&request).await {
            Ok(()) => {
                self.stake.lock().status = StakeStatus::Unbonding;
                info!(
                    "Unbonding started for {} ({} day waiting period)",
                    self.mediator_id,
                    UNBONDING_PERIOD_SECS / 86_400
                );
                true
            }
            Err(e) => {
                warn!("Failed to unbond stake for {}: {}", self.mediator_id, e);
                false
            }
        }
    }

    /// Refresh delegations from the chain.
    pub async fn load_delegations(&self) {
        match self.chain.fetch_delegations(&self.mediator_id).await {
            Ok(delegations) => {
                let mut stake = self.stake.lock();
                stake.set_delegations(delegations);
                debug!(
                    "Loaded {} delegations for {} (delegated {}, effective {})",
                    stake.delegators.len(),
                    self.mediator_id,
                    stake.delegated_amount,
                    stake.effective_stake
                );
            }
            Err(e) => {
                warn!(
                    "Failed to load delegations for {}, dropping delegated stake: {}",
                    self.mediator_id, e
                );
                self.stake.lock().set_delegations(Vec::new());
            }
        }
    }

    pub fn meets_minimum_stake(&self) -> bool {
        match self.min_effective_stake {
            None | Some(0) => true,
            Some(min) => self.stake.lock().effective_stake >= min,
        }
    }

    /// Apply a slash locally, then notify the chain on a best-effort basis.
    pub async fn handle_slashing(&self, slash_amount: u64, reason: &str) {
        let (before, after) = {
            let mut stake = self.stake.lock();
            let before = stake.amount;
            stake.amount = stake.amount.saturating_sub(slash_amount);
            stake.recompute();
            (before, stake.amount)
        };
        info!(
            "Slashed {} by {} ({} -> {}): {}",
            self.mediator_id, slash_amount, before, after, reason
        );

        let report = SlashingReport {
            mediator_id: self.mediator_id.clone(),
            amount: slash_amount,
            reason: reason.to_string(),
            timestamp: self.clock.now_millis(),
        };
        if let Err(e) = self.chain.report_slashing(&report).await {
            warn!("Failed to report slashing of {} to chain: {}", self.mediator_id, e);
        }
    }

    /// Copy of the current stake position.
    pub fn get_stake(&self) -> Stake {
        self.stake.lock().clone()
    }

    pub fn effective_stake(&self) -> u64 {
        self.stake.lock().effective_stake
    }

    pub fn active_delegations(&self) -> Vec<Delegation> {
        self.stake
            .lock()
            .delegators
            .iter()
            .filter(|d| d.is_active())
            .cloned()
            .collect()
    }

    /// Distinct delegators with at least one active delegation.
    pub fn delegator_count(&self) -> usize {
        self.stake
            .lock()
            .delegators
            .iter()
            .filter(|d| d.is_active())
            .map(|d| d.delegator_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn mediator_id(&self) -> &str {
        &self.mediator_id
    }
}
