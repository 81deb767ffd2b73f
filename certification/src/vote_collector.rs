//! # Vote Collector
//!
//! One instance per view. Accumulates votes for the block proposed in that
//! view and emits a [`QuorumCertificate`] exactly once when the voting weight
//! reaches the quorum threshold.
//!
//! ## Key Features
//!
//! - **Pre-proposal buffering**: votes that arrive before their block are
//!   kept in a bounded buffer and replayed when the block is registered
//! - **Equivocation detection**: a second vote from the same voter for a
//!   different block is reported as [`MisbehaviorKind::DoubleVote`] and never
//!   counted
//! - **At-most-once emission**: an atomic "certified" flag is claimed with
//!   compare-and-swap before a QC is built, so concurrent callers racing past
//!   the threshold produce a single certificate
//!
//! [`MisbehaviorKind::DoubleVote`]: crate::misbehavior::MisbehaviorKind::DoubleVote

use crate::committee::Committee;
use crate::crypto::{vote_message, SignatureScheme};
use crate::misbehavior::{MisbehaviorReport, MisbehaviorSink};
use crate::model::{Block, BlockId, QuorumCertificate, Signature, Vote};
use crate::registry::Collector;
use crate::validation::validate_vote;
use crate::{CertifyError, CertifyResult, ValidatorId, ViewNumber, Weight};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a vote collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteCollectorStatus {
    /// No block registered yet; votes are buffered
    Caching,
    /// Block known; votes are counted
    Verifying,
    /// QC emitted
    Certified,
    /// View fell below the retained boundary
    Pruned,
}

/// Result of a successfully processed vote.
#[derive(Debug, Clone, PartialEq)]
pub enum VoteAdded {
    /// Counted toward the registered block
    Counted { weight: Weight },
    /// Identical vote already known
    Duplicate,
    /// This vote completed the quorum
    Certified(Arc<QuorumCertificate>),
}

#[derive(Debug)]
struct VoteState {
    status: VoteCollectorStatus,
    block: Option<Block>,
    /// Votes not (yet) matching the registered block, in arrival order
    pending: IndexMap<ValidatorId, Vote>,
    counted: BTreeMap<ValidatorId, Vote>,
    weight: Weight,
    certificate: Option<Arc<QuorumCertificate>>,
    pruned_at: Option<ViewNumber>,
}

/// Signatures snapshotted by the caller that won the certification claim.
struct Claim {
    block_id: BlockId,
    parts: Vec<(ValidatorId, Signature)>,
}

pub struct VoteCollector {
    view: ViewNumber,
    committee: Arc<Committee>,
    scheme: Arc<dyn SignatureScheme>,
    misbehavior: Arc<dyn MisbehaviorSink>,
    max_pending: usize,
    state: Mutex<VoteState>,
    certified: AtomicBool,
}

impl VoteCollector {
    pub fn new(
        view: ViewNumber,
        committee: Arc<Committee>,
        scheme: Arc<dyn SignatureScheme>,
        misbehavior: Arc<dyn MisbehaviorSink>,
        max_pending: usize,
    ) -> Self {
        Self {
            view,
            committee,
            scheme,
            misbehavior,
            max_pending,
            state: Mutex::new(VoteState {
                status: VoteCollectorStatus::Caching,
                block: None,
                pending: IndexMap::new(),
                counted: BTreeMap::new(),
                weight: 0,
                certificate: None,
                pruned_at: None,
            }),
            certified: AtomicBool::new(false),
        }
    }

    /// Add a vote for this view.
    ///
    /// Returns [`CertifyError::UnknownBlock`] when the vote was buffered
    /// because its block is not registered; the vote is not lost.
    pub fn add_vote(&self, vote: Vote) -> CertifyResult<VoteAdded> {
        if vote.view != self.view {
            return Err(CertifyError::ViewMismatch {
                expected: self.view,
                got: vote.view,
            });
        }
        if let Err(e) = validate_vote(&vote, &self.committee, self.scheme.as_ref()) {
            if matches!(e, CertifyError::SignatureInvalid { .. }) {
                warn!(view = self.view, voter = vote.voter, "vote with invalid signature");
                self.misbehavior.report(MisbehaviorReport::invalid_vote(vote));
            }
            return Err(e);
        }

        let claim = {
            let mut state = self.state.lock();
            if let Some(boundary) = state.pruned_at {
                return Err(CertifyError::StaleView {
                    view: self.view,
                    lowest_retained: boundary,
                });
            }

            let previous = state
                .counted
                .get(&vote.voter)
                .or_else(|| state.pending.get(&vote.voter))
                .cloned();
            if let Some(first) = previous {
                if first.block_id == vote.block_id {
                    trace!(view = self.view, voter = vote.voter, "duplicate vote");
                    return Ok(VoteAdded::Duplicate);
                }
                drop(state);
                warn!(
                    view = self.view,
                    voter = vote.voter,
                    first = %first.block_id,
                    second = %vote.block_id,
                    "double vote detected"
                );
                let voter = vote.voter;
                self.misbehavior.report(MisbehaviorReport::double_vote(first, vote));
                return Err(CertifyError::DoubleVote {
                    voter,
                    view: self.view,
                });
            }

            let registered = state.block.as_ref().map(Block::id);
            if registered != Some(vote.block_id) {
                if state.pending.len() >= self.max_pending {
                    debug!(view = self.view, voter = vote.voter, "pending vote buffer full");
                    return Err(CertifyError::PendingLimitReached {
                        view: self.view,
                        limit: self.max_pending,
                    });
                }
                let block_id = vote.block_id;
                state.pending.insert(vote.voter, vote);
                return Err(CertifyError::UnknownBlock {
                    view: self.view,
                    block_id,
                });
            }

            self.count(&mut state, vote);
            match self.try_claim(&state) {
                Some(claim) => claim,
                None => return Ok(VoteAdded::Counted { weight: state.weight }),
            }
        };

        self.certify(claim).map(VoteAdded::Certified)
    }

    /// Register the block proposed for this view and replay buffered votes.
    ///
    /// The first registered block is authoritative; a different second block
    /// is reported as a double proposal.
    pub fn register_block(&self, block: Block) -> CertifyResult<Option<Arc<QuorumCertificate>>> {
        if block.view() != self.view {
            return Err(CertifyError::ViewMismatch {
                expected: self.view,
                got: block.view(),
            });
        }

        let claim = {
            let mut state = self.state.lock();
            if let Some(boundary) = state.pruned_at {
                return Err(CertifyError::StaleView {
                    view: self.view,
                    lowest_retained: boundary,
                });
            }
            if let Some(first) = state.block.clone() {
                if first.id() == block.id() {
                    return Ok(None);
                }
                drop(state);
                warn!(
                    view = self.view,
                    proposer = block.proposer(),
                    "double proposal detected"
                );
                let proposer = block.proposer();
                self.misbehavior
                    .report(MisbehaviorReport::double_proposal(first, block));
                return Err(CertifyError::DoubleProposal {
                    proposer,
                    view: self.view,
                });
            }

            let block_id = block.id();
            state.block = Some(block);
            state.status = VoteCollectorStatus::Verifying;

            let matching: Vec<ValidatorId> = state
                .pending
                .iter()
                .filter(|(_, vote)| vote.block_id == block_id)
                .map(|(voter, _)| *voter)
                .collect();
            for voter in matching {
                if let Some(vote) = state.pending.shift_remove(&voter) {
                    self.count(&mut state, vote);
                }
            }
            debug!(
                view = self.view,
                block = %block_id,
                weight = state.weight,
                "block registered"
            );
            self.try_claim(&state)
        };

        match claim {
            Some(claim) => self.certify(claim).map(Some),
            None => Ok(None),
        }
    }

    fn count(&self, state: &mut VoteState, vote: Vote) {
        let weight = self.committee.weight(vote.voter).unwrap_or_default();
        state.weight = state.weight.saturating_add(weight);
        state.counted.insert(vote.voter, vote);
    }

    /// Claim the one-time transition to `Certified` if the quorum is reached.
    fn try_claim(&self, state: &VoteState) -> Option<Claim> {
        if !self.committee.has_quorum(state.weight) {
            return None;
        }
        let block_id = state.block.as_ref()?.id();
        self.certified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Claim {
            block_id,
            parts: state
                .counted
                .values()
                .map(|vote| (vote.voter, vote.signature.clone()))
                .collect(),
        })
    }

    /// Aggregate the claimed signatures into a QC. Releases the claim if the
    /// aggregate does not verify so a later vote can retry.
    fn certify(&self, claim: Claim) -> CertifyResult<Arc<QuorumCertificate>> {
        let built = self.build_qc(&claim);
        let qc = match built {
            Ok(qc) => Arc::new(qc),
            Err(e) => {
                warn!(view = self.view, error = %e, "QC aggregation failed");
                self.certified.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.status != VoteCollectorStatus::Pruned {
            state.status = VoteCollectorStatus::Certified;
        }
        state.certificate = Some(qc.clone());
        info!(
            view = self.view,
            block = %qc.block_id,
            signers = qc.signers.len(),
            "quorum certificate formed"
        );
        Ok(qc)
    }

    fn build_qc(&self, claim: &Claim) -> CertifyResult<QuorumCertificate> {
        let signature = self.scheme.aggregate(&claim.parts)?;
        let message = vote_message(self.view, &claim.block_id)?;
        let messages: Vec<(ValidatorId, Vec<u8>)> = claim
            .parts
            .iter()
            .map(|(id, _)| (*id, message.clone()))
            .collect();
        if !self.scheme.verify_aggregate(&messages, &signature) {
            return Err(CertifyError::SignatureInvalid {
                view: self.view,
                signer: None,
            });
        }
        Ok(QuorumCertificate {
            view: self.view,
            block_id: claim.block_id,
            signers: claim.parts.iter().map(|(id, _)| *id).collect(),
            signature,
        })
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> VoteCollectorStatus {
        self.state.lock().status
    }

    pub fn weight(&self) -> Weight {
        self.state.lock().weight
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn block(&self) -> Option<Block> {
        self.state.lock().block.clone()
    }

    /// The QC emitted by this collector, if any.
    pub fn certificate(&self) -> Option<Arc<QuorumCertificate>> {
        self.state.lock().certificate.clone()
    }
}

impl Collector for VoteCollector {
    fn view(&self) -> ViewNumber {
        self.view
    }

    fn mark_pruned(&self, boundary: ViewNumber) {
        let mut state = self.state.lock();
        state.pruned_at = Some(boundary);
        state.status = VoteCollectorStatus::Pruned;
        state.pending.clear();
    }
}

impl std::fmt::Debug for VoteCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteCollector")
            .field("view", &self.view)
            .field("certified", &self.certified.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sign_vote, Ed25519Scheme, Ed25519Signer};
    use crate::misbehavior::{ChannelMisbehaviorSink, MisbehaviorKind};
    use crate::model::HashValue;
    use crate::validation::valid_qc;
    use chrono::Utc;
    use std::thread;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        scheme: Arc<Ed25519Scheme>,
        signers: Vec<Ed25519Signer>,
        committee: Arc<Committee>,
        collector: Arc<VoteCollector>,
        reports: UnboundedReceiver<MisbehaviorReport>,
    }

    fn fixture(view: ViewNumber, max_pending: usize) -> Fixture {
        let ids = [0, 1, 2, 3];
        let (scheme, signers) = Ed25519Scheme::generate_for_ids(&ids);
        let scheme = Arc::new(scheme);
        let committee = Arc::new(Committee::equal_weight(&ids, 1).unwrap());
        let (sink, reports) = ChannelMisbehaviorSink::new();
        let collector = Arc::new(VoteCollector::new(
            view,
            committee.clone(),
            scheme.clone(),
            Arc::new(sink),
            max_pending,
        ));
        Fixture {
            scheme,
            signers,
            committee,
            collector,
            reports,
        }
    }

    fn block(view: ViewNumber, tag: &[u8]) -> Block {
        Block::new(view, HashValue::digest(tag), 0, Utc::now(), QuorumCertificate::genesis()).unwrap()
    }

    #[test]
    fn test_quorum_emits_single_qc() {
        let f = fixture(10, 16);
        let b = block(10, b"a");
        assert_eq!(f.collector.register_block(b.clone()).unwrap(), None);

        for i in 0..2 {
            let vote = sign_vote(&f.signers[i], 10, b.id()).unwrap();
            assert!(matches!(f.collector.add_vote(vote).unwrap(), VoteAdded::Counted { .. }));
        }
        let third = sign_vote(&f.signers[2], 10, b.id()).unwrap();
        let qc = match f.collector.add_vote(third).unwrap() {
            VoteAdded::Certified(qc) => qc,
            other => panic!("expected QC, got {:?}", other),
        };
        assert_eq!(qc.signers.len(), 3);
        assert!(valid_qc(&qc, &f.committee, f.scheme.as_ref()).is_ok());
        assert_eq!(f.collector.status(), VoteCollectorStatus::Certified);

        let fourth = sign_vote(&f.signers[3], 10, b.id()).unwrap();
        assert_eq!(
            f.collector.add_vote(fourth).unwrap(),
            VoteAdded::Counted { weight: 4 }
        );
        assert_eq!(f.collector.certificate().unwrap(), qc);
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let f = fixture(3, 16);
        let b = block(3, b"a");
        f.collector.register_block(b.clone()).unwrap();
        let vote = sign_vote(&f.signers[1], 3, b.id()).unwrap();
        f.collector.add_vote(vote.clone()).unwrap();
        assert_eq!(f.collector.add_vote(vote).unwrap(), VoteAdded::Duplicate);
        assert_eq!(f.collector.weight(), 1);
    }

    #[test]
    fn test_double_vote_reported_and_not_counted() {
        let mut f = fixture(10, 16);
        let a = block(10, b"a");
        f.collector.register_block(a.clone()).unwrap();
        f.collector
            .add_vote(sign_vote(&f.signers[3], 10, a.id()).unwrap())
            .unwrap();

        let other = HashValue::digest(b"other");
        let err = f
            .collector
            .add_vote(sign_vote(&f.signers[3], 10, other).unwrap())
            .unwrap_err();
        assert!(matches!(err, CertifyError::DoubleVote { voter: 3, view: 10 }));
        assert_eq!(f.collector.weight(), 1);

        let report = f.reports.try_recv().unwrap();
        assert_eq!(report.kind, MisbehaviorKind::DoubleVote);
        assert_eq!(report.offender, 3);
    }

    #[test]
    fn test_votes_buffered_until_block() {
        let f = fixture(7, 16);
        let b = block(7, b"a");
        for i in 0..3 {
            let err = f
                .collector
                .add_vote(sign_vote(&f.signers[i], 7, b.id()).unwrap())
                .unwrap_err();
            assert!(matches!(err, CertifyError::UnknownBlock { view: 7, .. }));
        }
        assert_eq!(f.collector.status(), VoteCollectorStatus::Caching);
        assert_eq!(f.collector.pending_len(), 3);

        let qc = f.collector.register_block(b.clone()).unwrap().unwrap();
        assert_eq!(qc.block_id, b.id());
        assert_eq!(f.collector.pending_len(), 0);
    }

    #[test]
    fn test_pending_buffer_bounded() {
        let f = fixture(7, 2);
        let id = HashValue::digest(b"unseen");
        for i in 0..2 {
            assert!(matches!(
                f.collector.add_vote(sign_vote(&f.signers[i], 7, id).unwrap()),
                Err(CertifyError::UnknownBlock { .. })
            ));
        }
        assert!(matches!(
            f.collector.add_vote(sign_vote(&f.signers[2], 7, id).unwrap()),
            Err(CertifyError::PendingLimitReached { view: 7, limit: 2 })
        ));
    }

    #[test]
    fn test_double_proposal_keeps_first_block() {
        let mut f = fixture(5, 16);
        let first = block(5, b"a");
        let second = block(5, b"b");
        f.collector.register_block(first.clone()).unwrap();
        assert!(matches!(
            f.collector.register_block(second),
            Err(CertifyError::DoubleProposal { view: 5, .. })
        ));
        assert_eq!(f.collector.block().unwrap().id(), first.id());
        assert_eq!(
            f.reports.try_recv().unwrap().kind,
            MisbehaviorKind::DoubleProposal
        );
        // Re-registering the same block is harmless
        assert_eq!(f.collector.register_block(first).unwrap(), None);
    }

    #[test]
    fn test_invalid_signature_reported() {
        let mut f = fixture(4, 16);
        let mut vote = sign_vote(&f.signers[1], 4, HashValue::digest(b"a")).unwrap();
        vote.signature = Signature(vec![7; 64]);
        assert!(matches!(
            f.collector.add_vote(vote),
            Err(CertifyError::SignatureInvalid { signer: Some(1), .. })
        ));
        assert_eq!(
            f.reports.try_recv().unwrap().kind,
            MisbehaviorKind::InvalidSignature
        );
    }

    #[test]
    fn test_pruned_collector_rejects_votes() {
        let f = fixture(4, 16);
        let b = block(4, b"a");
        f.collector.register_block(b.clone()).unwrap();
        f.collector.mark_pruned(6);
        assert_eq!(f.collector.status(), VoteCollectorStatus::Pruned);
        assert!(matches!(
            f.collector.add_vote(sign_vote(&f.signers[0], 4, b.id()).unwrap()),
            Err(CertifyError::StaleView { view: 4, lowest_retained: 6 })
        ));
    }

    #[test]
    fn test_concurrent_votes_single_qc() {
        let ids: Vec<ValidatorId> = (0..10).collect();
        let (scheme, signers) = Ed25519Scheme::generate_for_ids(&ids);
        let committee = Arc::new(Committee::equal_weight(&ids, 1).unwrap());
        let (sink, _reports) = ChannelMisbehaviorSink::new();
        let collector = Arc::new(VoteCollector::new(
            2,
            committee,
            Arc::new(scheme),
            Arc::new(sink),
            64,
        ));
        let b = block(2, b"a");
        collector.register_block(b.clone()).unwrap();

        let handles: Vec<_> = signers
            .into_iter()
            .map(|signer| {
                let collector = collector.clone();
                let id = b.id();
                thread::spawn(move || {
                    let vote = sign_vote(&signer, 2, id).unwrap();
                    matches!(collector.add_vote(vote), Ok(VoteAdded::Certified(_)))
                })
            })
            .collect();
        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|certified| *certified)
            .count();
        assert_eq!(emitted, 1);
        assert_eq!(collector.weight(), 10);
    }
}
