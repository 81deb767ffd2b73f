//! Validation predicates for certificates, proposals, votes and timeouts.
//!
//! All checks are side-effect free. Each returns `Ok(())` when the object is
//! valid and otherwise the first violated rule as a [`CertifyError`]. The
//! boolean forms [`is_valid_qc`] and [`is_valid_tc`] are provided for callers
//! that only need a yes/no answer.

use crate::committee::{Committee, CommitteeProvider, LeaderSelection};
use crate::crypto::{qc_messages, tc_messages, timeout_message, vote_message, SignatureScheme};
use crate::model::{Block, QuorumCertificate, TimeoutCertificate, TimeoutObject, Vote};
use crate::{CertifyError, CertifyResult};

/// Check signer membership, quorum weight and the aggregate signature of a QC.
///
/// The genesis QC is trusted without further checks. Signer uniqueness is
/// structural: the signer set is a `BTreeSet`.
pub fn valid_qc(
    qc: &QuorumCertificate,
    committee: &Committee,
    scheme: &dyn SignatureScheme,
) -> CertifyResult<()> {
    if qc.is_genesis() {
        return Ok(());
    }
    if qc.view == 0 {
        return Err(CertifyError::MalformedCertificate(
            "only the genesis QC may certify view 0".to_string(),
        ));
    }
    if qc.signers.is_empty() {
        return Err(CertifyError::MalformedCertificate(format!(
            "QC for view {} has no signers",
            qc.view
        )));
    }
    if let Some(outsider) = qc.signers.iter().find(|id| !committee.contains(**id)) {
        return Err(CertifyError::MalformedCertificate(format!(
            "QC for view {} signed by non-member {}",
            qc.view, outsider
        )));
    }

    let have = qc.signer_weight(committee);
    let need = committee.quorum_threshold();
    if have < need {
        return Err(CertifyError::InsufficientWeight { have, need });
    }

    if !scheme.verify_aggregate(&qc_messages(qc)?, &qc.signature) {
        return Err(CertifyError::SignatureInvalid {
            view: qc.view,
            signer: None,
        });
    }
    Ok(())
}

pub fn is_valid_qc(qc: &QuorumCertificate, committee: &Committee, scheme: &dyn SignatureScheme) -> bool {
    valid_qc(qc, committee, scheme).is_ok()
}

/// Validate a QC against the committee of its own view.
pub fn valid_qc_for_view(
    qc: &QuorumCertificate,
    committees: &dyn CommitteeProvider,
    scheme: &dyn SignatureScheme,
) -> CertifyResult<()> {
    if qc.is_genesis() {
        return Ok(());
    }
    let committee = committees.committee_for(qc.view)?;
    valid_qc(qc, &committee, scheme)
}

/// Check a TC: signer membership, quorum weight, consistency of the reported
/// QC views with the embedded newest QC, and the aggregate signature.
///
/// The embedded QC is validated against its own view's committee.
pub fn valid_tc(
    tc: &TimeoutCertificate,
    committee: &Committee,
    committees: &dyn CommitteeProvider,
    scheme: &dyn SignatureScheme,
) -> CertifyResult<()> {
    if tc.newest_qc_views.is_empty() {
        return Err(CertifyError::MalformedCertificate(format!(
            "TC for view {} has no signers",
            tc.view
        )));
    }
    if let Some(outsider) = tc.signers().find(|id| !committee.contains(*id)) {
        return Err(CertifyError::MalformedCertificate(format!(
            "TC for view {} signed by non-member {}",
            tc.view, outsider
        )));
    }
    if let Some((signer, qc_view)) = tc.newest_qc_views.iter().find(|(_, v)| **v >= tc.view) {
        return Err(CertifyError::MalformedCertificate(format!(
            "signer {} reported QC view {} not below TC view {}",
            signer, qc_view, tc.view
        )));
    }
    let reported_max = tc.newest_qc_views.values().copied().max().unwrap_or_default();
    if tc.newest_qc.view != reported_max {
        return Err(CertifyError::MalformedCertificate(format!(
            "TC newest QC view {} differs from highest reported view {}",
            tc.newest_qc.view, reported_max
        )));
    }

    let have = tc.signer_weight(committee);
    let need = committee.quorum_threshold();
    if have < need {
        return Err(CertifyError::InsufficientWeight { have, need });
    }

    valid_qc_for_view(&tc.newest_qc, committees, scheme)?;

    if !scheme.verify_aggregate(&tc_messages(tc)?, &tc.signature) {
        return Err(CertifyError::SignatureInvalid {
            view: tc.view,
            signer: None,
        });
    }
    Ok(())
}

pub fn is_valid_tc(
    tc: &TimeoutCertificate,
    committees: &dyn CommitteeProvider,
    scheme: &dyn SignatureScheme,
) -> bool {
    committees
        .committee_for(tc.view)
        .and_then(|committee| valid_tc(tc, &committee, committees, scheme))
        .is_ok()
}

/// Check a proposal before it is registered with a vote collector: content
/// hash, parent ordering, proposer leadership and the parent QC.
pub fn validate_block(
    block: &Block,
    committees: &dyn CommitteeProvider,
    leaders: &dyn LeaderSelection,
    scheme: &dyn SignatureScheme,
) -> CertifyResult<()> {
    if !block.has_valid_id()? {
        return Err(CertifyError::InvalidProposal(format!(
            "block id {} does not match its content at view {}",
            block.id(),
            block.view()
        )));
    }
    if block.parent_qc().view >= block.view() {
        return Err(CertifyError::InvalidProposal(format!(
            "parent QC view {} is not below block view {}",
            block.parent_qc().view,
            block.view()
        )));
    }

    let committee = committees.committee_for(block.view())?;
    if !committee.contains(block.proposer()) {
        return Err(CertifyError::UnknownParticipant {
            id: block.proposer(),
            view: block.view(),
        });
    }
    let leader = leaders.leader_for(block.view());
    if block.proposer() != leader {
        return Err(CertifyError::InvalidProposal(format!(
            "proposer {} is not the leader {} of view {}",
            block.proposer(),
            leader,
            block.view()
        )));
    }

    valid_qc_for_view(block.parent_qc(), committees, scheme)
}

/// Check a vote's voter membership and signature.
pub fn validate_vote(vote: &Vote, committee: &Committee, scheme: &dyn SignatureScheme) -> CertifyResult<()> {
    if !committee.contains(vote.voter) {
        return Err(CertifyError::UnknownParticipant {
            id: vote.voter,
            view: vote.view,
        });
    }
    let message = vote_message(vote.view, &vote.block_id)?;
    if !scheme.verify(vote.voter, &message, &vote.signature) {
        return Err(CertifyError::SignatureInvalid {
            view: vote.view,
            signer: Some(vote.voter),
        });
    }
    Ok(())
}

/// Check a timeout object: signer membership, the embedded QC and optional
/// TC, and the signature.
///
/// Problems with the embedded certificates are reported as
/// [`CertifyError::InvalidEmbeddedQc`].
pub fn validate_timeout(
    timeout: &TimeoutObject,
    committee: &Committee,
    committees: &dyn CommitteeProvider,
    scheme: &dyn SignatureScheme,
) -> CertifyResult<()> {
    if !committee.contains(timeout.signer) {
        return Err(CertifyError::UnknownParticipant {
            id: timeout.signer,
            view: timeout.view,
        });
    }

    let embedded = |reason: String| CertifyError::InvalidEmbeddedQc {
        view: timeout.view,
        signer: timeout.signer,
        reason,
    };

    if timeout.newest_qc.view >= timeout.view {
        return Err(embedded(format!(
            "newest QC view {} is not below timeout view {}",
            timeout.newest_qc.view, timeout.view
        )));
    }
    if let Some(tc) = &timeout.last_view_tc {
        if tc.view >= timeout.view {
            return Err(embedded(format!(
                "last view TC {} is not below timeout view {}",
                tc.view, timeout.view
            )));
        }
        if timeout.newest_qc.view < tc.newest_qc.view {
            return Err(embedded(format!(
                "newest QC view {} is older than the QC {} carried by the last view TC",
                timeout.newest_qc.view, tc.newest_qc.view
            )));
        }
        let tc_committee = committees.committee_for(tc.view).map_err(|e| embedded(e.to_string()))?;
        valid_tc(tc, &tc_committee, committees, scheme).map_err(|e| embedded(e.to_string()))?;
    }
    valid_qc_for_view(&timeout.newest_qc, committees, scheme).map_err(|e| embedded(e.to_string()))?;

    let message = timeout_message(timeout.view, timeout.newest_qc.view)?;
    if !scheme.verify(timeout.signer, &message, &timeout.signature) {
        return Err(CertifyError::SignatureInvalid {
            view: timeout.view,
            signer: Some(timeout.signer),
        });
    }
    Ok(())
}
