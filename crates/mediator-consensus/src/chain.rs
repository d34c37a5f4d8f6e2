// Chain API client
//
// The remote chain is the source of truth for validators, delegations and the
// authority set, and the sink for registration, bonding and slashing
// notifications. Components only talk to it through `ChainApi` so every call
// site can apply its own fail-open or fail-safe policy.

use crate::config::MediatorConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout for chain calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chain returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected chain response: {0}")]
    Decode(String),
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Validator entry as listed by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub mediator_id: String,
    #[serde(default)]
    pub effective_stake: u64,
}

/// Body of a validator registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRegistration {
    pub mediator_id: String,
    pub effective_stake: u64,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Active,
    Undelegating,
    Withdrawn,
}

/// Stake delegated to a mediator by a third party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    pub delegator_id: String,
    pub mediator_id: String,
    pub amount: u64,
    pub timestamp: i64,
    pub status: DelegationStatus,
}

impl Delegation {
    pub fn is_active(&self) -> bool {
        self.status == DelegationStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondRequest {
    pub mediator_id: String,
    pub amount: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbondRequest {
    pub mediator_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashingReport {
    pub mediator_id: String,
    pub amount: u64,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalParameters {
    pub public_key: String,
}

/// Governance proposal submitted to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceProposal {
    #[serde(rename = "type")]
    pub proposal_type: String,
    pub proposer_id: String,
    pub title: String,
    pub description: String,
    pub parameters: ProposalParameters,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct ValidatorsResponse {
    #[serde(default)]
    validators: Vec<ValidatorRecord>,
}

#[derive(Debug, Deserialize)]
struct AuthoritiesResponse {
    #[serde(default)]
    authorities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DelegationsResponse {
    #[serde(default)]
    delegations: Vec<Delegation>,
}

/// Remote chain operations used by the gating components.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn fetch_validators(&self) -> Result<Vec<ValidatorRecord>, ChainError>;

    async fn register_validator(&self, registration: &ValidatorRegistration) -> Result<(), ChainError>;

    async fn fetch_authorities(&self) -> Result<Vec<String>, ChainError>;

    /// Succeeds only on HTTP 200 or 201.
    async fn submit_proposal(&self, proposal: &GovernanceProposal) -> Result<(), ChainError>;

    async fn bond_stake(&self, request: &BondRequest) -> Result<(), ChainError>;

    async fn unbond_stake(&self, request: &UnbondRequest) -> Result<(), ChainError>;

    async fn fetch_delegations(&self, mediator_id: &str) -> Result<Vec<Delegation>, ChainError>;

    async fn report_slashing(&self, report: &SlashingReport) -> Result<(), ChainError>;
}

/// `ChainApi` over the chain's HTTP/JSON endpoints.
#[derive(Clone)]
pub struct HttpChainClient {
    base: String,
    timeout: Duration,
    client: Client,
}

/// Governance accepts a proposal only with 200 or 201; other 2xx codes are rejections.
fn proposal_accepted(status: StatusCode) -> bool {
    matches!(status, StatusCode::OK | StatusCode::CREATED)
}

impl HttpChainClient {
    pub fn new(base: impl Into<String>) -> Result<Self, ChainError> {
        Self::with_timeout(base, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client for the configured chain endpoint and request timeout.
    pub fn from_config(config: &MediatorConfig) -> Result<Self, ChainError> {
        Self::with_timeout(config.chain_endpoint.clone(), config.request_timeout())
    }

    pub fn with_timeout(base: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::ClientBuild(e.to_string()))?;
        let base = base.into().trim_end_matches('/').to_string();
        Ok(HttpChainClient { base, timeout, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let resp = self.client.get(self.url(path)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChainError::Status { status: status.as_u16(), body });
        }
        resp.json::<T>().await.map_err(|e| ChainError::Decode(e.to_string()))
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<StatusCode, ChainError> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(ChainError::Status { status: status.as_u16(), body })
        }
    }
}

#[async_trait]
impl ChainApi for HttpChainClient {
    async fn fetch_validators(&self) -> Result<Vec<ValidatorRecord>, ChainError> {
        let resp: ValidatorsResponse = self.get_json("/api/v1/validators").await?;
        Ok(resp.validators)
    }

    async fn register_validator(&self, registration: &ValidatorRegistration) -> Result<(), ChainError> {
        self.post_json("/api/v1/validators/register", registration).await?;
        Ok(())
    }

    async fn fetch_authorities(&self) -> Result<Vec<String>, ChainError> {
        let resp: AuthoritiesResponse = self.get_json("/api/v1/consensus/authorities").await?;
        Ok(resp.authorities)
    }

    async fn submit_proposal(&self, proposal: &GovernanceProposal) -> Result<(), ChainError> {
        let status = self.post_json("/api/v1/governance/proposals", proposal).await?;
        if proposal_accepted(status) {
            Ok(())
        } else {
            Err(ChainError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }

    async fn bond_stake(&self, request: &BondRequest) -> Result<(), ChainError> {
        self.post_json("/api/v1/stake/bond", request).await?;
        Ok(())
    }

    async fn unbond_stake(&self, request: &UnbondRequest) -> Result<(), ChainError> {
        self.post_json("/api/v1/stake/unbond", request).await?;
        Ok(())
    }

    async fn fetch_delegations(&self, mediator_id: &str) -> Result<Vec<Delegation>, ChainError> {
        let path = format!("/api/v1/delegations/{}", mediator_id);
        let resp: DelegationsResponse = self.get_json(&path).await?;
        Ok(resp.delegations)
    }

    async fn report_slashing(&self, report: &SlashingReport) -> Result<(), ChainError> {
        self.post_json("/api/v1/stake/slash", report).await?;
        Ok(())
    }
}
