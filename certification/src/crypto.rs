//! # Signing Capability
//!
//! The engine never touches key material. It signs through a [`Signer`] and
//! checks signatures through a [`SignatureScheme`]; both are injected.
//!
//! ## Key Features
//!
//! - **Canonical messages**: votes and timeouts sign domain-separated bincode
//!   encodings, so a vote signature can never be replayed as a timeout
//! - **Per-signer aggregates**: an aggregate carries one signature per signer
//!   and is verified against the message each signer signed
//! - **Ed25519 backend**: [`Ed25519Scheme`] built on `ed25519-dalek`

use crate::model::{
    AggregatedSignature, BlockId, QuorumCertificate, Signature, TimeoutCertificate,
    TimeoutObject, Vote,
};
use crate::{CertifyError, CertifyResult, ValidatorId, ViewNumber};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use std::collections::HashMap;
use std::fmt;

/// Domain tag of vote signing messages
pub const VOTE_DOMAIN: &str = "hotstuff-vote";

/// Domain tag of timeout signing messages
pub const TIMEOUT_DOMAIN: &str = "hotstuff-timeout";

/// Local signing key of one committee member.
pub trait Signer: Send + Sync {
    fn id(&self) -> ValidatorId;

    fn sign(&self, message: &[u8]) -> Signature;
}

/// Verification and aggregation of committee signatures.
pub trait SignatureScheme: Send + Sync {
    /// Whether `signature` is `signer`'s signature over `message`.
    fn verify(&self, signer: ValidatorId, message: &[u8], signature: &Signature) -> bool;

    /// Combine individual signatures into one aggregate.
    fn aggregate(&self, parts: &[(ValidatorId, Signature)]) -> CertifyResult<AggregatedSignature>;

    /// Check an aggregate against the message each signer is expected to
    /// have signed. The signer sets must match exactly.
    fn verify_aggregate(
        &self,
        messages: &[(ValidatorId, Vec<u8>)],
        aggregate: &AggregatedSignature,
    ) -> bool;
}

/// Bytes a voter signs for `block_id` at `view`.
pub fn vote_message(view: ViewNumber, block_id: &BlockId) -> CertifyResult<Vec<u8>> {
    Ok(bincode::serialize(&(VOTE_DOMAIN, view, block_id))?)
}

/// Bytes a replica signs when timing out at `view` holding a QC of `newest_qc_view`.
pub fn timeout_message(view: ViewNumber, newest_qc_view: ViewNumber) -> CertifyResult<Vec<u8>> {
    Ok(bincode::serialize(&(TIMEOUT_DOMAIN, view, newest_qc_view))?)
}

/// Messages covered by a QC's aggregate: every signer signed the same vote.
pub fn qc_messages(qc: &QuorumCertificate) -> CertifyResult<Vec<(ValidatorId, Vec<u8>)>> {
    let message = vote_message(qc.view, &qc.block_id)?;
    Ok(qc
        .signers
        .iter()
        .map(|signer| (*signer, message.clone()))
        .collect())
}

/// Messages covered by a TC's aggregate: each signer's own timeout message.
pub fn tc_messages(tc: &TimeoutCertificate) -> CertifyResult<Vec<(ValidatorId, Vec<u8>)>> {
    tc.newest_qc_views
        .iter()
        .map(|(signer, qc_view)| Ok((*signer, timeout_message(tc.view, *qc_view)?)))
        .collect()
}

/// Sign a vote for `block_id` at `view`.
pub fn sign_vote(signer: &dyn Signer, view: ViewNumber, block_id: BlockId) -> CertifyResult<Vote> {
    let message = vote_message(view, &block_id)?;
    Ok(Vote {
        view,
        block_id,
        voter: signer.id(),
        signature: signer.sign(&message),
    })
}

/// Sign a timeout for `view`.
pub fn sign_timeout(
    signer: &dyn Signer,
    view: ViewNumber,
    newest_qc: QuorumCertificate,
    last_view_tc: Option<TimeoutCertificate>,
) -> CertifyResult<TimeoutObject> {
    let message = timeout_message(view, newest_qc.view)?;
    Ok(TimeoutObject {
        view,
        newest_qc,
        last_view_tc,
        signer: signer.id(),
        signature: signer.sign(&message),
    })
}

/// Ed25519 signing key bound to a validator id.
#[derive(Clone)]
pub struct Ed25519Signer {
    id: ValidatorId,
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(id: ValidatorId, key: SigningKey) -> Self {
        Self { id, key }
    }

    /// Deterministic key derived from `seed`; used for fixtures and local clusters.
    pub fn from_seed(id: ValidatorId, seed: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"hotstuff-ed25519-seed");
        hasher.update(&id.to_le_bytes());
        hasher.update(seed);
        Self::new(id, SigningKey::from_bytes(hasher.finalize().as_bytes()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("id", &self.id)
            .field("public_key", &self.key.verifying_key())
            .finish()
    }
}

impl Signer for Ed25519Signer {
    fn id(&self) -> ValidatorId {
        self.id
    }

    fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message).to_bytes().to_vec())
    }
}

/// Public keys of a committee; aggregates are the signer-sorted list of
/// individual Ed25519 signatures.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Scheme {
    keys: HashMap<ValidatorId, VerifyingKey>,
}

impl Ed25519Scheme {
    pub fn new(keys: impl IntoIterator<Item = (ValidatorId, VerifyingKey)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Deterministic signers for `ids` and the scheme that verifies them.
    pub fn generate_for_ids(ids: &[ValidatorId]) -> (Self, Vec<Ed25519Signer>) {
        let signers: Vec<Ed25519Signer> = ids
            .iter()
            .map(|id| Ed25519Signer::from_seed(*id, b"local-cluster"))
            .collect();
        let scheme = Self::new(signers.iter().map(|s| (s.id, s.verifying_key())));
        (scheme, signers)
    }

    pub fn insert(&mut self, id: ValidatorId, key: VerifyingKey) {
        self.keys.insert(id, key);
    }

    fn decode(aggregate: &AggregatedSignature) -> Option<Vec<(ValidatorId, Vec<u8>)>> {
        bincode::deserialize(&aggregate.0).ok()
    }
}

impl SignatureScheme for Ed25519Scheme {
    fn verify(&self, signer: ValidatorId, message: &[u8], signature: &Signature) -> bool {
        let Some(key) = self.keys.get(&signer) else {
            return false;
        };
        match ed25519_dalek::Signature::from_slice(&signature.0) {
            Ok(sig) => key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }

    fn aggregate(&self, parts: &[(ValidatorId, Signature)]) -> CertifyResult<AggregatedSignature> {
        let mut entries: Vec<(ValidatorId, Vec<u8>)> = parts
            .iter()
            .map(|(id, sig)| (*id, sig.0.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        if entries.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(CertifyError::MalformedCertificate(
                "duplicate signer in aggregate".to_string(),
            ));
        }
        Ok(AggregatedSignature(bincode::serialize(&entries)?))
    }

    fn verify_aggregate(
        &self,
        messages: &[(ValidatorId, Vec<u8>)],
        aggregate: &AggregatedSignature,
    ) -> bool {
        let Some(entries) = Self::decode(aggregate) else {
            return false;
        };
        if entries.len() != messages.len() {
            return false;
        }
        let expected: HashMap<ValidatorId, &Vec<u8>> =
            messages.iter().map(|(id, msg)| (*id, msg)).collect();
        if expected.len() != entries.len() {
            return false;
        }

        entries.iter().all(|(id, sig)| match expected.get(id) {
            Some(message) => self.verify(*id, message, &Signature(sig.clone())),
            None => false,
        })
    }
}
