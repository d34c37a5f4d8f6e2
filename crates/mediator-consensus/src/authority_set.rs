// Proof-of-authority allow-list
//
// The authority set is replaced wholesale on every successful reload. A failed
// reload keeps the last known set so a transient chain outage does not revoke
// this node's authorization.

use crate::chain::{ChainApi, GovernanceProposal, ProposalParameters};
use crate::clock::Clock;
use crate::config::MediatorConfig;
use crate::mode::ConsensusMode;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const AUTHORITY_ADD_PROPOSAL: &str = "authority_add";

#[derive(Debug, Default)]
struct AuthorityState {
    authorities: BTreeSet<String>,
    is_authorized: bool,
}

pub struct AuthoritySet {
    mediator_id: String,
    public_key: String,
    mode: ConsensusMode,
    chain: Arc<dyn ChainApi>,
    clock: Arc<dyn Clock>,
    state: Mutex<AuthorityState>,
}

impl AuthoritySet {
    pub fn new(
        mediator_id: impl Into<String>,
        public_key: impl Into<String>,
        mode: ConsensusMode,
        chain: Arc<dyn ChainApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        AuthoritySet {
            mediator_id: mediator_id.into(),
            public_key: public_key.into(),
            mode,
            chain,
            clock,
            state: Mutex::new(AuthorityState::default()),
        }
    }

    pub fn from_config(config: &MediatorConfig, chain: Arc<dyn ChainApi>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.mediator_id.clone(),
            config.public_key().to_string(),
            config.consensus_mode,
            chain,
            clock,
        )
    }

    pub async fn initialize(&self) {
        self.load_authority_set().await;
        let state = self.state.lock();
        info!(
            "Authority set initialized: {} authorities, {} authorized={}",
            state.authorities.len(),
            self.mediator_id,
            state.is_authorized
        );
        if self.mode.uses_authority_set() && !state.is_authorized {
            warn!(
                "Key {} is not in the authority set; {} will not mediate in {} mode",
                self.public_key, self.mediator_id, self.mode
            );
        }
    }

    /// Reload the allow-list from the chain. This node is authorized when its
    /// public key, the one `request_authorization` proposes, is listed.
    pub async fn load_authority_set(&self) {
        match self.chain.fetch_authorities().await {
            Ok(list) => {
                let authorities: BTreeSet<String> = list.into_iter().collect();
                let mut state = self.state.lock();
                let was_authorized = state.is_authorized;
                state.is_authorized = authorities.contains(&self.public_key);
                state.authorities = authorities;
                if was_authorized != state.is_authorized {
                    info!(
                        "Authorization for {} changed: {} -> {}",
                        self.mediator_id, was_authorized, state.is_authorized
                    );
                }
            }
            Err(e) => {
                warn!("Failed to load authority set, keeping previous set: {}", e);
            }
        }
    }

    /// Whether the authority set permits this node to mediate under the configured mode.
    pub fn check_authorization(&self) -> bool {
        match self.mode {
            ConsensusMode::Poa | ConsensusMode::Hybrid => self.state.lock().is_authorized,
            ConsensusMode::Permissionless | ConsensusMode::Dpos => true,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().is_authorized
    }

    pub fn is_authority(&self, key: &str) -> bool {
        self.state.lock().authorities.contains(key)
    }

    /// Sorted snapshot of the current authorities.
    pub fn get_authorities(&self) -> Vec<String> {
        self.state.lock().authorities.iter().cloned().collect()
    }

    pub fn authority_count(&self) -> usize {
        self.state.lock().authorities.len()
    }

    /// Submit a governance proposal adding this node's key to the authority set.
    pub async fn request_authorization(&self) -> bool {
        let proposal = GovernanceProposal {
            proposal_type: AUTHORITY_ADD_PROPOSAL.to_string(),
            proposer_id: self.mediator_id.clone(),
            title: format!("Add authority {}", self.mediator_id),
            description: format!(
                "Request to add mediator {} to the proof-of-authority set",
                self.mediator_id
            ),
            parameters: ProposalParameters {
                public_key: self.public_key.clone(),
            },
            timestamp: self.clock.now_millis(),
        };

        match self.chain.submit_proposal(&proposal).await {
            Ok(()) => {
                info!("Submitted authority_add proposal for {}", self.mediator_id);
                true
            }
            Err(e) => {
                warn!("Authority request for {} failed: {}", self.mediator_id, e);
                false
            }
        }
    }

    pub fn mode(&self) -> ConsensusMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, MockChainApi};
    use crate::clock::SystemClock;

    fn authority_set(chain: MockChainApi, mode: ConsensusMode) -> AuthoritySet {
        AuthoritySet::new("m1", "pk-m1", mode, Arc::new(chain), Arc::new(SystemClock))
    }

    fn list(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_load_deduplicates_and_authorizes() {
        let mut chain = MockChainApi::new();
        chain
            .expect_fetch_authorities()
            .returning(|| Ok(list(&["m2", "pk-m1", "m2"])));
        let set = authority_set(chain, ConsensusMode::Poa);

        set.load_authority_set().await;
        assert_eq!(set.get_authorities(), vec!["m2", "pk-m1"]);
        assert!(set.is_authority("m2"));
        assert!(set.check_authorization());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_set() {
        let mut chain = MockChainApi::new();
        let mut calls = 0;
        chain.expect_fetch_authorities().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(list(&["pk-m1"]))
            } else {
                Err(ChainError::Decode("timeout".to_string()))
            }
        });
        let set = authority_set(chain, ConsensusMode::Hybrid);

        set.load_authority_set().await;
        set.load_authority_set().await;
        assert!(set.check_authorization());
        assert_eq!(set.authority_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_replaces_wholesale() {
        let mut chain = MockChainApi::new();
        let mut calls = 0;
        chain.expect_fetch_authorities().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(list(&["pk-m1", "m2"]))
            } else {
                Ok(list(&["m3"]))
            }
        });
        let set = authority_set(chain, ConsensusMode::Poa);

        set.load_authority_set().await;
        assert!(set.is_authorized());
        set.load_authority_set().await;
        assert_eq!(set.get_authorities(), vec!["m3"]);
        assert!(!set.is_authorized());
        assert!(!set.check_authorization());
    }

    #[tokio::test]
    async fn test_authorization_follows_public_key_not_mediator_id() {
        let mut chain = MockChainApi::new();
        let mut calls = 0;
        chain.expect_fetch_authorities().returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(list(&["m1"]))
            } else {
                Ok(list(&["pk-m1"]))
            }
        });
        let set = authority_set(chain, ConsensusMode::Poa);

        set.load_authority_set().await;
        assert!(set.is_authority("m1"));
        assert!(!set.check_authorization());

        set.load_authority_set().await;
        assert!(set.is_authority("pk-m1"));
        assert!(set.check_authorization());
    }

    #[tokio::test]
    async fn test_from_config_authorizes_configured_key() {
        let mut chain = MockChainApi::new();
        chain.expect_fetch_authorities().returning(|| Ok(list(&["pk-1"])));
        let mut config = MediatorConfig::new("mediator-1", "http://chain.local");
        config.mediator_public_key = Some("pk-1".to_string());
        config.consensus_mode = ConsensusMode::Poa;
        let set = AuthoritySet::from_config(&config, Arc::new(chain), Arc::new(SystemClock));

        set.initialize().await;
        assert!(set.is_authorized());
        assert!(set.check_authorization());
    }

    #[test]
    fn test_check_authorization_ignores_set_outside_poa() {
        assert!(authority_set(MockChainApi::new(), ConsensusMode::Permissionless).check_authorization());
        assert!(authority_set(MockChainApi::new(), ConsensusMode::Dpos).check_authorization());
        assert!(!authority_set(MockChainApi::new(), ConsensusMode::Poa).check_authorization());
        assert!(!authority_set(MockChainApi::new(), ConsensusMode::Hybrid).check_authorization());
    }

    #[tokio::test]
    async fn test_request_authorization_proposal() {
        let mut chain = MockChainApi::new();
        chain
            .expect_submit_proposal()
            .withf(|p| {
                p.proposal_type == "authority_add"
                    && p.proposer_id == "m1"
                    && p.parameters.public_key == "pk-m1"
            })
            .times(1)
            .returning(|_| Ok(()));
        let set = authority_set(chain, ConsensusMode::Poa);
        assert!(set.request_authorization().await);
    }

    #[tokio::test]
    async fn test_request_authorization_rejected() {
        let mut chain = MockChainApi::new();
        chain
            .expect_submit_proposal()
            .returning(|_| Err(ChainError::Status { status: 403, body: "denied".to_string() }));
        let set = authority_set(chain, ConsensusMode::Poa);
        assert!(!set.request_authorization().await);
    }
}
