pub mod authority_set;
pub mod chain;
pub mod clock;
pub mod config;
pub mod epoch;
pub mod events;
pub mod mode;
pub mod rotation_scheduler;
pub mod stake_ledger;

pub use authority_set::AuthoritySet;
pub use chain::{ChainApi, ChainError, Delegation, DelegationStatus, HttpChainClient, ValidatorRecord};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MediatorConfig, RotationConfig, RotationConfigUpdate};
pub use epoch::{Epoch, JailRecord, SlotAssignment, ValidatorInfo};
pub use events::{RotationEvent, RotationEventLog, RotationEventType, MAX_ROTATION_EVENTS};
pub use mode::ConsensusMode;
pub use rotation_scheduler::{RotationScheduler, SchedulerStatus};
pub use stake_ledger::{Stake, StakeLedger, StakeStatus};
