//! # HotStuff Certification Engine
//!
//! This library implements the per-view certification core of a HotStuff-family
//! BFT protocol: it tracks the current view, collects votes and timeouts from
//! committee members, aggregates them into quorum and timeout certificates, and
//! enforces the safety rules that keep a correct participant from ever signing
//! two conflicting statements.
//!
//! ## Architecture
//!
//! Components, leaves first:
//!
//! - **Model** ([`model`], [`validation`]): immutable blocks, votes, timeouts,
//!   quorum certificates (QC) and timeout certificates (TC) plus their
//!   validation predicates
//! - **Safety rules** ([`safety`]): the single synchronization point that
//!   decides whether the local participant may vote or time out
//! - **Collectors** ([`vote_collector`], [`timeout_collector`]): one instance
//!   per view, accumulating weight and emitting at most one certificate
//! - **Registry** ([`registry`]): creates collectors on demand and evicts the
//!   ones below the pruning boundary
//! - **Pacemaker** ([`pacemaker`]): owns the current view and the adaptive
//!   view timer
//! - **Engine** ([`engine`]): routes inbound messages and wires the pieces
//!   together
//!
//! Networking, payload execution, block storage, leader election and the
//! signature scheme are consumed through the traits in [`committee`],
//! [`crypto`], [`misbehavior`] and [`engine::BlockSource`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hotstuff_certification::{
//!     committee::{Committee, RoundRobinLeaders, StaticCommitteeProvider},
//!     config::EngineConfig,
//!     crypto::Ed25519Scheme,
//!     engine::{CertificationEngine, EngineDeps, InMemoryBlockSource},
//!     misbehavior::LoggingMisbehaviorSink,
//!     safety::InMemorySafetyStore,
//! };
//!
//! # async fn start() -> hotstuff_certification::CertifyResult<()> {
//! let (scheme, signers) = Ed25519Scheme::generate_for_ids(&[0, 1, 2, 3]);
//! let committee = Committee::equal_weight(&[0, 1, 2, 3], 1)?;
//! let deps = EngineDeps {
//!     signer: Arc::new(signers[0].clone()),
//!     scheme: Arc::new(scheme),
//!     committees: Arc::new(StaticCommitteeProvider::single(committee.clone())),
//!     leaders: Arc::new(RoundRobinLeaders::new(&committee)),
//!     blocks: Arc::new(InMemoryBlockSource::default()),
//!     misbehavior: Arc::new(LoggingMisbehaviorSink),
//!     safety_store: Arc::new(InMemorySafetyStore::default()),
//! };
//! let (engine, handles) = CertificationEngine::new(EngineConfig::default(), deps)?;
//! # let _ = (engine, handles);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod committee;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod misbehavior;
pub mod model;
pub mod pacemaker;
pub mod registry;
pub mod safety;
pub mod timeout_collector;
pub mod validation;
pub mod vote_collector;

pub use committee::{Committee, CommitteeProvider, LeaderSelection};
pub use config::EngineConfig;
pub use engine::{CertificationEngine, EngineOutput};
pub use model::{
    Block, BlockId, HashValue, QuorumCertificate, Signature, AggregatedSignature,
    TimeoutCertificate, TimeoutObject, Vote,
};
pub use pacemaker::{Pacemaker, ViewChange, ViewChangeCause};
pub use safety::{SafetyData, SafetyRules};
pub use timeout_collector::TimeoutCollector;
pub use vote_collector::VoteCollector;

/// Validator identifier, opaque outside of a committee snapshot
pub type ValidatorId = u32;

/// Logical consensus round
pub type ViewNumber = u64;

/// Voting weight of a committee member
pub type Weight = u64;

/// Epoch counter keying committee snapshots
pub type EpochNumber = u64;

/// Errors produced by the certification engine.
///
/// Remote protocol violations, local safety violations and configuration
/// problems all surface here; [`CertifyError::is_fatal`] and
/// [`CertifyError::is_misbehavior`] tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum CertifyError {
    /// Structural problem with a QC or TC
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),

    /// Signer set does not reach the quorum threshold
    #[error("insufficient weight: have {have}, need {need}")]
    InsufficientWeight { have: Weight, need: Weight },

    /// Signature or aggregate signature failed verification
    #[error("invalid signature from {signer:?} at view {view}")]
    SignatureInvalid {
        view: ViewNumber,
        signer: Option<ValidatorId>,
    },

    #[error("already voted: requested view {view}, highest voted view {highest_voted_view}")]
    AlreadyVoted {
        view: ViewNumber,
        highest_voted_view: ViewNumber,
    },

    #[error("already timed out at view {view}")]
    AlreadyTimedOut { view: ViewNumber },

    /// Block would not extend the locked chain
    #[error("unsafe extension: parent QC view {parent_qc_view} is below locked QC view {locked_view}")]
    UnsafeExtension {
        parent_qc_view: ViewNumber,
        locked_view: ViewNumber,
    },

    #[error("view {view} is below the retained boundary {lowest_retained}")]
    StaleView {
        view: ViewNumber,
        lowest_retained: ViewNumber,
    },

    /// Vote references a block the collector has not seen; the vote was buffered
    #[error("unknown block {block_id} at view {view}")]
    UnknownBlock { view: ViewNumber, block_id: BlockId },

    /// Message for a view further ahead of the current view than collectors are opened for
    #[error("view {view} is more than {lookahead} views ahead of current view {current_view}")]
    ViewTooFarAhead {
        view: ViewNumber,
        current_view: ViewNumber,
        lookahead: ViewNumber,
    },

    #[error("pending vote buffer for view {view} is full ({limit})")]
    PendingLimitReached { view: ViewNumber, limit: usize },

    #[error("double vote by {voter} at view {view}")]
    DoubleVote { voter: ValidatorId, view: ViewNumber },

    #[error("double timeout by {voter} at view {view}")]
    DoubleTimeout { voter: ValidatorId, view: ViewNumber },

    #[error("double proposal by {proposer} at view {view}")]
    DoubleProposal {
        proposer: ValidatorId,
        view: ViewNumber,
    },

    #[error("timeout from {signer} at view {view} embeds an invalid certificate: {reason}")]
    InvalidEmbeddedQc {
        view: ViewNumber,
        signer: ValidatorId,
        reason: String,
    },

    /// No committee snapshot available for the view's epoch
    #[error("no committee known for view {view}")]
    EpochUnknown { view: ViewNumber },

    #[error("{id} is not a member of the committee for view {view}")]
    UnknownParticipant { id: ValidatorId, view: ViewNumber },

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("view mismatch: expected {expected}, got {got}")]
    ViewMismatch {
        expected: ViewNumber,
        got: ViewNumber,
    },

    /// The local node attempted to equivocate; indicates a bug in the safety rules
    #[error("local safety violation: {0}")]
    LocalSafetyViolation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to persist safety data: {0}")]
    Persistence(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("output channel closed")]
    ChannelClosed,
}

impl CertifyError {
    /// Errors after which the local node must stop participating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CertifyError::LocalSafetyViolation(_) | CertifyError::Persistence(_)
        )
    }

    /// Errors that constitute evidence against a remote participant.
    pub fn is_misbehavior(&self) -> bool {
        matches!(
            self,
            CertifyError::DoubleVote { .. }
                | CertifyError::DoubleTimeout { .. }
                | CertifyError::DoubleProposal { .. }
                | CertifyError::SignatureInvalid { signer: Some(_), .. }
        )
    }
}

/// Result type for certification operations
pub type CertifyResult<T> = Result<T, CertifyError>;

/// Kind of certificate a collector produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    Vote,
    Timeout,
}

impl std::fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorKind::Vote => write!(f, "vote"),
            CollectorKind::Timeout => write!(f, "timeout"),
        }
    }
}
