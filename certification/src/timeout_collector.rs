//! # Timeout Collector
//!
//! One instance per view. Accumulates [`TimeoutObject`]s and emits a
//! [`TimeoutCertificate`] exactly once when the timed-out weight reaches the
//! quorum threshold.
//!
//! Every accepted timeout carries the signer's newest QC. The collector keeps
//! the highest of them so the TC tells the next leader which QC it has to
//! extend. Before the quorum is reached it also raises a one-time partial-TC
//! event once enough weight has timed out that at least one honest replica is
//! among the signers.

use crate::committee::{Committee, CommitteeProvider};
use crate::crypto::{timeout_message, SignatureScheme};
use crate::misbehavior::{MisbehaviorReport, MisbehaviorSink};
use crate::model::{QuorumCertificate, Signature, TimeoutCertificate, TimeoutObject};
use crate::registry::Collector;
use crate::validation::validate_timeout;
use crate::{CertifyError, CertifyResult, ValidatorId, ViewNumber, Weight};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Notifications produced while adding a timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutEvent {
    /// Timed-out weight passed the partial threshold; replicas may time out early
    PartialTc { view: ViewNumber, weight: Weight },
    /// A timeout carried a QC newer than any seen so far in this view
    NewQcDiscovered(Arc<QuorumCertificate>),
    /// A timeout carried a TC for an earlier view
    NewTcDiscovered(Arc<TimeoutCertificate>),
    /// Quorum reached; the TC for this view
    TcFormed(Arc<TimeoutCertificate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCollectorStatus {
    Collecting,
    Certified,
    Pruned,
}

#[derive(Debug)]
struct TimeoutState {
    status: TimeoutCollectorStatus,
    timeouts: BTreeMap<ValidatorId, TimeoutObject>,
    weight: Weight,
    newest_qc: QuorumCertificate,
    newest_tc_view: ViewNumber,
    partial_emitted: bool,
    certificate: Option<Arc<TimeoutCertificate>>,
    pruned_at: Option<ViewNumber>,
}

struct Claim {
    newest_qc: QuorumCertificate,
    parts: Vec<(ValidatorId, ViewNumber, Signature)>,
}

pub struct TimeoutCollector {
    view: ViewNumber,
    committee: Arc<Committee>,
    committees: Arc<dyn CommitteeProvider>,
    scheme: Arc<dyn SignatureScheme>,
    misbehavior: Arc<dyn MisbehaviorSink>,
    state: Mutex<TimeoutState>,
    certified: AtomicBool,
}

impl TimeoutCollector {
    pub fn new(
        view: ViewNumber,
        committee: Arc<Committee>,
        committees: Arc<dyn CommitteeProvider>,
        scheme: Arc<dyn SignatureScheme>,
        misbehavior: Arc<dyn MisbehaviorSink>,
    ) -> Self {
        Self {
            view,
            committee,
            committees,
            scheme,
            misbehavior,
            state: Mutex::new(TimeoutState {
                status: TimeoutCollectorStatus::Collecting,
                timeouts: BTreeMap::new(),
                weight: 0,
                newest_qc: QuorumCertificate::genesis(),
                newest_tc_view: 0,
                partial_emitted: false,
                certificate: None,
                pruned_at: None,
            }),
            certified: AtomicBool::new(false),
        }
    }

    /// Add a timeout for this view. Duplicates yield no events.
    pub fn add_timeout(&self, timeout: TimeoutObject) -> CertifyResult<Vec<TimeoutEvent>> {
        if timeout.view != self.view {
            return Err(CertifyError::ViewMismatch {
                expected: self.view,
                got: timeout.view,
            });
        }
        if let Err(e) = validate_timeout(
            &timeout,
            &self.committee,
            self.committees.as_ref(),
            self.scheme.as_ref(),
        ) {
            match &e {
                CertifyError::SignatureInvalid { .. } => {
                    warn!(view = self.view, signer = timeout.signer, "timeout with invalid signature");
                    self.misbehavior.report(MisbehaviorReport::invalid_timeout(timeout));
                }
                CertifyError::InvalidEmbeddedQc { reason, .. } => {
                    debug!(view = self.view, signer = timeout.signer, %reason, "timeout rejected");
                }
                _ => {}
            }
            return Err(e);
        }

        let mut events = Vec::new();
        let claim = {
            let mut state = self.state.lock();
            if let Some(boundary) = state.pruned_at {
                return Err(CertifyError::StaleView {
                    view: self.view,
                    lowest_retained: boundary,
                });
            }

            if let Some(first) = state.timeouts.get(&timeout.signer).cloned() {
                if first == timeout {
                    trace!(view = self.view, signer = timeout.signer, "duplicate timeout");
                    return Ok(events);
                }
                drop(state);
                warn!(view = self.view, signer = timeout.signer, "double timeout detected");
                let signer = timeout.signer;
                self.misbehavior
                    .report(MisbehaviorReport::double_timeout(first, timeout));
                return Err(CertifyError::DoubleTimeout {
                    voter: signer,
                    view: self.view,
                });
            }

            if timeout.newest_qc.view > state.newest_qc.view {
                state.newest_qc = timeout.newest_qc.clone();
                events.push(TimeoutEvent::NewQcDiscovered(Arc::new(timeout.newest_qc.clone())));
            }
            if let Some(tc) = &timeout.last_view_tc {
                if tc.view > state.newest_tc_view {
                    state.newest_tc_view = tc.view;
                    events.push(TimeoutEvent::NewTcDiscovered(Arc::new(tc.clone())));
                }
            }

            let weight = self.committee.weight(timeout.signer).unwrap_or_default();
            state.weight = state.weight.saturating_add(weight);
            state.timeouts.insert(timeout.signer, timeout);

            if !state.partial_emitted && state.weight >= self.committee.partial_threshold() {
                state.partial_emitted = true;
                debug!(view = self.view, weight = state.weight, "partial timeout certificate");
                events.push(TimeoutEvent::PartialTc {
                    view: self.view,
                    weight: state.weight,
                });
            }

            self.try_claim(&state)
        };

        if let Some(claim) = claim {
            events.push(TimeoutEvent::TcFormed(self.certify(claim)?));
        }
        Ok(events)
    }

    fn try_claim(&self, state: &TimeoutState) -> Option<Claim> {
        if !self.committee.has_quorum(state.weight) {
            return None;
        }
        self.certified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Claim {
            newest_qc: state.newest_qc.clone(),
            parts: state
                .timeouts
                .values()
                .map(|t| (t.signer, t.newest_qc.view, t.signature.clone()))
                .collect(),
        })
    }

    fn certify(&self, claim: Claim) -> CertifyResult<Arc<TimeoutCertificate>> {
        let tc = match self.build_tc(claim) {
            Ok(tc) => Arc::new(tc),
            Err(e) => {
                warn!(view = self.view, error = %e, "TC aggregation failed");
                self.certified.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.status != TimeoutCollectorStatus::Pruned {
            state.status = TimeoutCollectorStatus::Certified;
        }
        state.certificate = Some(tc.clone());
        info!(
            view = self.view,
            newest_qc_view = tc.newest_qc.view,
            signers = tc.newest_qc_views.len(),
            "timeout certificate formed"
        );
        Ok(tc)
    }

    fn build_tc(&self, claim: Claim) -> CertifyResult<TimeoutCertificate> {
        let signatures: Vec<(ValidatorId, Signature)> = claim
            .parts
            .iter()
            .map(|(id, _, sig)| (*id, sig.clone()))
            .collect();
        let signature = self.scheme.aggregate(&signatures)?;
        let messages = claim
            .parts
            .iter()
            .map(|(id, qc_view, _)| Ok((*id, timeout_message(self.view, *qc_view)?)))
            .collect::<CertifyResult<Vec<_>>>()?;
        if !self.scheme.verify_aggregate(&messages, &signature) {
            return Err(CertifyError::SignatureInvalid {
                view: self.view,
                signer: None,
            });
        }

        Ok(TimeoutCertificate {
            view: self.view,
            newest_qc: claim.newest_qc,
            newest_qc_views: claim
                .parts
                .iter()
                .map(|(id, qc_view, _)| (*id, *qc_view))
                .collect(),
            signature,
        })
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> TimeoutCollectorStatus {
        self.state.lock().status
    }

    pub fn weight(&self) -> Weight {
        self.state.lock().weight
    }

    /// Highest QC carried by any accepted timeout.
    pub fn newest_qc(&self) -> QuorumCertificate {
        self.state.lock().newest_qc.clone()
    }

    pub fn certificate(&self) -> Option<Arc<TimeoutCertificate>> {
        self.state.lock().certificate.clone()
    }
}

impl Collector for TimeoutCollector {
    fn view(&self) -> ViewNumber {
        self.view
    }

    fn mark_pruned(&self, boundary: ViewNumber) {
        let mut state = self.state.lock();
        state.pruned_at = Some(boundary);
        state.status = TimeoutCollectorStatus::Pruned;
    }
}

impl std::fmt::Debug for TimeoutCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutCollector")
            .field("view", &self.view)
            .field("certified", &self.certified.load(Ordering::Acquire))
            .finish()
    }
}
