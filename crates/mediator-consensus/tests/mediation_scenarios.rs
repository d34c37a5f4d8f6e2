// End-to-end gating scenarios against an in-memory chain.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use mediator_consensus::chain::{
    BondRequest, GovernanceProposal, SlashingReport, UnbondRequest, ValidatorRegistration,
};
use mediator_consensus::{
    AuthoritySet, ChainApi, ChainError, ConsensusMode, Delegation, DelegationStatus, ManualClock,
    MediatorConfig, RotationConfig, RotationScheduler, StakeLedger, ValidatorRecord,
    MAX_ROTATION_EVENTS,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct FakeChain {
    online: Mutex<bool>,
    validators: Mutex<Vec<ValidatorRecord>>,
    authorities: Mutex<Vec<String>>,
    delegations: Mutex<Vec<Delegation>>,
    registrations: Mutex<Vec<ValidatorRegistration>>,
    slashings: Mutex<Vec<SlashingReport>>,
    proposals: Mutex<Vec<GovernanceProposal>>,
}

impl FakeChain {
    fn online() -> Arc<Self> {
        let chain = FakeChain::default();
        *chain.online.lock() = true;
        Arc::new(chain)
    }

    fn set_online(&self, online: bool) {
        *self.online.lock() = online;
    }

    fn check(&self) -> Result<(), ChainError> {
        if *self.online.lock() {
            Ok(())
        } else {
            Err(ChainError::Status { status: 503, body: "offline".to_string() })
        }
    }
}

#[async_trait]
impl ChainApi for FakeChain {
    async fn fetch_validators(&self) -> Result<Vec<ValidatorRecord>, ChainError> {
        self.check()?;
        Ok(self.validators.lock().clone())
    }

    async fn register_validator(&self, registration: &ValidatorRegistration) -> Result<(), ChainError> {
        self.check()?;
        self.registrations.lock().push(registration.clone());
        Ok(())
    }

    async fn fetch_authorities(&self) -> Result<Vec<String>, ChainError> {
        self.check()?;
        Ok(self.authorities.lock().clone())
    }

    async fn submit_proposal(&self, proposal: &GovernanceProposal) -> Result<(), ChainError> {
        self.check()?;
        self.proposals.lock().push(proposal.clone());
        Ok(())
    }

    async fn bond_stake(&self, _request: &BondRequest) -> Result<(), ChainError> {
        self.check()
    }

    async fn unbond_stake(&self, _request: &UnbondRequest) -> Result<(), ChainError> {
        self.check()
    }

    async fn fetch_delegations(&self, mediator_id: &str) -> Result<Vec<Delegation>, ChainError> {
        self.check()?;
        Ok(self
            .delegations
            .lock()
            .iter()
            .filter(|d| d.mediator_id == mediator_id)
            .cloned()
            .collect())
    }

    async fn report_slashing(&self, report: &SlashingReport) -> Result<(), ChainError> {
        self.check()?;
        self.slashings.lock().push(report.clone());
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
}

fn delegation(delegator: &str, amount: u64, status: DelegationStatus) -> Delegation {
    Delegation {
        delegator_id: delegator.to_string(),
        mediator_id: "me".to_string(),
        amount,
        timestamp: 0,
        status,
    }
}

#[tokio::test]
async fn bonded_stake_plus_active_delegations() {
    init_logging();
    let chain = FakeChain::online();
    chain.delegations.lock().extend(vec![
        delegation("d1", 1200, DelegationStatus::Active),
        delegation("d2", 800, DelegationStatus::Active),
        delegation("d3", 1000, DelegationStatus::Undelegating),
        delegation("d4", 5000, DelegationStatus::Withdrawn),
    ]);
    let ledger = StakeLedger::new("me", 0, Some(6000), chain.clone(), Arc::new(clock()));

    assert!(!ledger.meets_minimum_stake());
    assert!(ledger.bond_stake(5000).await);
    ledger.load_delegations().await;

    let stake = ledger.get_stake();
    assert_eq!(stake.effective_stake, 7000);
    assert_eq!(stake.delegators.len(), 4);
    assert!(ledger.meets_minimum_stake());

    chain.set_online(false);
    ledger.load_delegations().await;
    assert_eq!(ledger.get_stake().effective_stake, 5000);
    assert!(!ledger.meets_minimum_stake());

    ledger.handle_slashing(1500, "late settlement").await;
    assert_eq!(ledger.get_stake().amount, 3500);
    assert!(chain.slashings.lock().is_empty());
}

#[tokio::test]
async fn three_validators_ranked_by_stake() {
    let chain = FakeChain::online();
    let config = RotationConfig { active_slots: 3, ..Default::default() };
    let scheduler = RotationScheduler::new("me", ConsensusMode::Dpos, config, chain.clone(), Arc::new(clock()));

    assert!(scheduler.register_validator("v8", 8000).await);
    assert!(scheduler.register_validator("v6", 6000).await);
    assert!(scheduler.register_validator("v10", 10000).await);
    assert_eq!(chain.registrations.lock().len(), 3);

    scheduler.initialize_epoch();
    let active = scheduler.get_active_validators();
    assert_eq!(active.len(), 3);
    for (expected_rank, (id, stake)) in [("v10", 10000), ("v8", 8000), ("v6", 6000)].iter().enumerate() {
        assert_eq!(active[expected_rank].mediator_id, *id);
        assert_eq!(active[expected_rank].effective_stake, *stake);
        assert_eq!(active[expected_rank].slot_index, expected_rank as i64);
        assert!(active[expected_rank].is_active);
    }
}

#[tokio::test]
async fn registration_below_minimum_is_rejected() {
    let scheduler = RotationScheduler::new(
        "me",
        ConsensusMode::Dpos,
        RotationConfig::default(),
        FakeChain::online(),
        Arc::new(clock()),
    );
    assert!(!scheduler.register_validator("small", 500).await);
    assert!(scheduler.get_all_validators().iter().all(|v| v.mediator_id != "small"));
}

#[tokio::test]
async fn jailed_validator_returns_after_cooldown() {
    let clock = clock();
    let scheduler = RotationScheduler::new(
        "me",
        ConsensusMode::Dpos,
        RotationConfig::default(),
        FakeChain::online(),
        Arc::new(clock.clone()),
    );
    scheduler.register_validator("v1", 5000).await;
    scheduler.register_validator("v2", 4000).await;

    scheduler.jail_validator("v1", "operator request");
    let epoch = scheduler.initialize_epoch();
    assert_eq!(epoch.active_validators, vec!["v2"]);

    clock.advance(Duration::hours(25));
    assert!(scheduler.unjail_validator("v1"));
    let epoch = scheduler.initialize_epoch();
    assert_eq!(epoch.active_validators, vec!["v1", "v2"]);
}

#[tokio::test]
async fn current_slot_always_drawn_from_active_set() {
    let clock = clock();
    let config = RotationConfig { active_slots: 4, ..Default::default() };
    let scheduler = RotationScheduler::new("me", ConsensusMode::Dpos, config, FakeChain::online(), Arc::new(clock.clone()));
    for (i, stake) in [9000u64, 7000, 5000, 3000, 2000, 1500].iter().enumerate() {
        scheduler.register_validator(&format!("v{}", i), *stake).await;
    }
    let epoch = scheduler.initialize_epoch();
    assert_eq!(epoch.active_validators.len(), 4);

    scheduler.jail_validator("v1", "manual");
    for _ in 0..20 {
        let slot = scheduler.get_current_slot().unwrap();
        assert!(epoch.active_validators.contains(&slot.validator_id));
        assert!(!scheduler.get_jailed_validators().contains_key(&slot.validator_id));
        clock.advance(Duration::minutes(7));
    }
}

#[tokio::test]
async fn event_log_stays_bounded_under_churn() {
    let scheduler = RotationScheduler::new(
        "me",
        ConsensusMode::Dpos,
        RotationConfig::default(),
        FakeChain::online(),
        Arc::new(clock()),
    );
    for round in 0..12 {
        for i in 0..100 {
            scheduler.register_validator(&format!("v{}", i), 1000 + round).await;
        }
    }
    let events = scheduler.get_rotation_events();
    assert_eq!(events.len(), MAX_ROTATION_EVENTS);
    assert_eq!(scheduler.get_all_validators().len(), 100);
}

#[tokio::test]
async fn gates_follow_consensus_mode() {
    init_logging();
    let chain = FakeChain::online();
    chain.authorities.lock().push("me".to_string());
    chain.validators.lock().extend(vec![
        ValidatorRecord { mediator_id: "leader".to_string(), effective_stake: 9000 },
        ValidatorRecord { mediator_id: "me".to_string(), effective_stake: 3000 },
    ]);

    let mut config = MediatorConfig::new("me", "http://chain.local");
    config.consensus_mode = ConsensusMode::Hybrid;
    config.bonded_stake_amount = 3000;
    config.validate().unwrap();

    let clock = Arc::new(clock());
    let scheduler = RotationScheduler::from_config(&config, chain.clone(), clock.clone());
    let authorities = AuthoritySet::from_config(&config, chain.clone(), clock.clone());
    let ledger = StakeLedger::from_config(&config, chain.clone(), clock.clone());

    scheduler.start().await;
    authorities.initialize().await;
    ledger.initialize().await;
    scheduler.update_validator_stake("me", ledger.effective_stake());

    assert!(!scheduler.is_current_validator());
    assert!(scheduler.should_mediate());
    assert!(authorities.check_authorization());

    chain.set_online(false);
    authorities.load_authority_set().await;
    assert!(authorities.check_authorization());
    assert!(!authorities.request_authorization().await);

    chain.set_online(true);
    assert!(authorities.request_authorization().await);
    assert_eq!(chain.proposals.lock()[0].parameters.public_key, "me");

    scheduler.stop();
    assert!(scheduler.get_status().current_epoch.is_some());
}

#[tokio::test]
async fn permissionless_ignores_all_state() {
    let chain = FakeChain::online();
    let clock = Arc::new(clock());
    let scheduler = RotationScheduler::new(
        "me",
        ConsensusMode::Permissionless,
        RotationConfig::default(),
        chain.clone(),
        clock.clone(),
    );
    let authorities = AuthoritySet::new("me", "me", ConsensusMode::Permissionless, chain, clock);

    assert!(scheduler.should_mediate());
    assert!(authorities.check_authorization());
    scheduler.stop();
    assert!(scheduler.should_mediate());
}
