//! # Certificate Model
//!
//! Immutable data carried through the certification engine: blocks, votes,
//! timeout objects and the two certificate kinds built from them. These types
//! hold no behavior beyond construction helpers; validation predicates live in
//! [`crate::validation`].
//!
//! Certificates are shared as `Arc<QuorumCertificate>` / `Arc<TimeoutCertificate>`
//! once emitted by a collector, so the proposer, the pacemaker and persistence
//! all read the same value.

use crate::{CertifyError, CertifyResult, ValidatorId, ViewNumber, Weight};
use crate::committee::Committee;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 32-byte content hash
#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue(pub [u8; 32]);

impl HashValue {
    pub const ZERO: HashValue = HashValue([0u8; 32]);

    /// blake3 digest of `bytes`
    pub fn digest(bytes: &[u8]) -> Self {
        HashValue(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({})", self)
    }
}

/// Block identifier (content hash of the block)
pub type BlockId = HashValue;

/// Opaque signature bytes produced by the signing capability
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Signature(pub Vec<u8>);

/// Opaque aggregate of several signatures
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AggregatedSignature(pub Vec<u8>);

/// Proof that a quorum voted for `block_id` at `view`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct QuorumCertificate {
    pub view: ViewNumber,
    pub block_id: BlockId,
    pub signers: BTreeSet<ValidatorId>,
    pub signature: AggregatedSignature,
}

impl QuorumCertificate {
    /// Trusted root certificate at view 0.
    pub fn genesis() -> Self {
        Self {
            view: 0,
            block_id: HashValue::ZERO,
            signers: BTreeSet::new(),
            signature: AggregatedSignature::default(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::genesis()
    }

    /// Total weight of the signer set under `committee`. Unknown signers count zero.
    pub fn signer_weight(&self, committee: &Committee) -> Weight {
        committee.weight_of(self.signers.iter().copied())
    }
}

/// A proposed block as seen by the certification engine.
///
/// The payload itself is opaque; only its hash participates in the block id.
/// Fields are private so that a constructed block can never be mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    view: ViewNumber,
    id: BlockId,
    payload_hash: HashValue,
    proposer: ValidatorId,
    timestamp: DateTime<Utc>,
    parent_qc: QuorumCertificate,
}

/// Fields that feed the block id, in encoding order
#[derive(Serialize)]
struct BlockIdPreimage<'a> {
    view: ViewNumber,
    payload_hash: &'a HashValue,
    proposer: ValidatorId,
    timestamp: &'a DateTime<Utc>,
    parent_view: ViewNumber,
    parent_block_id: &'a BlockId,
    parent_signers: &'a BTreeSet<ValidatorId>,
}

impl Block {
    /// Build a block and compute its id.
    ///
    /// Fails with [`CertifyError::InvalidProposal`] unless `parent_qc.view < view`.
    pub fn new(
        view: ViewNumber,
        payload_hash: HashValue,
        proposer: ValidatorId,
        timestamp: DateTime<Utc>,
        parent_qc: QuorumCertificate,
    ) -> CertifyResult<Self> {
        if parent_qc.view >= view {
            return Err(CertifyError::InvalidProposal(format!(
                "parent QC view {} is not below block view {}",
                parent_qc.view, view
            )));
        }
        let id = Self::compute_id(view, &payload_hash, proposer, &timestamp, &parent_qc)?;
        Ok(Self {
            view,
            id,
            payload_hash,
            proposer,
            timestamp,
            parent_qc,
        })
    }

    /// Content hash over every field except the id itself.
    pub fn compute_id(
        view: ViewNumber,
        payload_hash: &HashValue,
        proposer: ValidatorId,
        timestamp: &DateTime<Utc>,
        parent_qc: &QuorumCertificate,
    ) -> CertifyResult<BlockId> {
        let preimage = BlockIdPreimage {
            view,
            payload_hash,
            proposer,
            timestamp,
            parent_view: parent_qc.view,
            parent_block_id: &parent_qc.block_id,
            parent_signers: &parent_qc.signers,
        };
        Ok(HashValue::digest(&bincode::serialize(&preimage)?))
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn payload_hash(&self) -> HashValue {
        self.payload_hash
    }

    pub fn proposer(&self) -> ValidatorId {
        self.proposer
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn parent_qc(&self) -> &QuorumCertificate {
        &self.parent_qc
    }

    /// Whether `id` matches the recomputed content hash.
    pub fn has_valid_id(&self) -> CertifyResult<bool> {
        let expected = Self::compute_id(
            self.view,
            &self.payload_hash,
            self.proposer,
            &self.timestamp,
            &self.parent_qc,
        )?;
        Ok(expected == self.id)
    }

    /// Whether this block directly extends its parent (no skipped views).
    pub fn extends_parent_directly(&self) -> bool {
        self.parent_qc.view + 1 == self.view
    }
}

/// A committee member's vote for `block_id` at `view`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Vote {
    pub view: ViewNumber,
    pub block_id: BlockId,
    pub voter: ValidatorId,
    pub signature: Signature,
}

impl Vote {
    /// Two votes from the same voter at the same view for different blocks.
    pub fn conflicts_with(&self, other: &Vote) -> bool {
        self.voter == other.voter && self.view == other.view && self.block_id != other.block_id
    }
}

/// "I am not seeing progress at `view`; the best certificate I hold is `newest_qc`."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutObject {
    pub view: ViewNumber,
    pub newest_qc: QuorumCertificate,
    /// TC for an earlier view that justifies entering `view` without a QC
    pub last_view_tc: Option<TimeoutCertificate>,
    pub signer: ValidatorId,
    pub signature: Signature,
}

impl TimeoutObject {
    /// Same signer and view, different content.
    pub fn conflicts_with(&self, other: &TimeoutObject) -> bool {
        self.signer == other.signer && self.view == other.view && self != other
    }
}

/// Proof that a quorum timed out at `view`.
///
/// `newest_qc_views` records the view of the newest QC each signer reported;
/// `newest_qc` is the highest of those QCs, which the next leader must extend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutCertificate {
    pub view: ViewNumber,
    pub newest_qc: QuorumCertificate,
    pub newest_qc_views: BTreeMap<ValidatorId, ViewNumber>,
    pub signature: AggregatedSignature,
}

impl TimeoutCertificate {
    pub fn signers(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.newest_qc_views.keys().copied()
    }

    pub fn signer_weight(&self, committee: &Committee) -> Weight {
        committee.weight_of(self.signers())
    }
}
