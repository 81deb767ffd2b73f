//! # Misbehavior Reporting
//!
//! Equivocations and forged signatures detected by the collectors are handed to
//! a [`MisbehaviorSink`] together with the conflicting messages, so they can
//! be used as slashing evidence. Reporting is fire-and-forget: a sink must
//! never block certificate processing.

use crate::model::{Block, TimeoutObject, Vote};
use crate::{ValidatorId, ViewNumber};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Offense classes the engine can prove.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MisbehaviorKind {
    /// Two votes for different blocks at the same view
    DoubleVote,
    /// Two different timeouts at the same view
    DoubleTimeout,
    /// Two different blocks proposed by the leader of one view
    DoubleProposal,
    /// A message whose signature does not verify under the claimed identity
    InvalidSignature,
}

impl MisbehaviorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisbehaviorKind::DoubleVote => "double_vote",
            MisbehaviorKind::DoubleTimeout => "double_timeout",
            MisbehaviorKind::DoubleProposal => "double_proposal",
            MisbehaviorKind::InvalidSignature => "invalid_signature",
        }
    }
}

/// The signed messages that prove an offense.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Evidence {
    ConflictingVotes { first: Vote, second: Vote },
    ConflictingTimeouts {
        first: Box<TimeoutObject>,
        second: Box<TimeoutObject>,
    },
    ConflictingProposals { first: Box<Block>, second: Box<Block> },
    InvalidVote(Vote),
    InvalidTimeout(Box<TimeoutObject>),
}

/// One detected offense.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MisbehaviorReport {
    pub kind: MisbehaviorKind,
    pub offender: ValidatorId,
    pub view: ViewNumber,
    pub evidence: Evidence,
    pub detected_at: DateTime<Utc>,
}

impl MisbehaviorReport {
    pub fn double_vote(first: Vote, second: Vote) -> Self {
        Self {
            kind: MisbehaviorKind::DoubleVote,
            offender: second.voter,
            view: second.view,
            evidence: Evidence::ConflictingVotes { first, second },
            detected_at: Utc::now(),
        }
    }

    pub fn double_timeout(first: TimeoutObject, second: TimeoutObject) -> Self {
        Self {
            kind: MisbehaviorKind::DoubleTimeout,
            offender: second.signer,
            view: second.view,
            evidence: Evidence::ConflictingTimeouts {
                first: Box::new(first),
                second: Box::new(second),
            },
            detected_at: Utc::now(),
        }
    }

    pub fn double_proposal(first: Block, second: Block) -> Self {
        Self {
            kind: MisbehaviorKind::DoubleProposal,
            offender: second.proposer(),
            view: second.view(),
            evidence: Evidence::ConflictingProposals {
                first: Box::new(first),
                second: Box::new(second),
            },
            detected_at: Utc::now(),
        }
    }

    pub fn invalid_vote(vote: Vote) -> Self {
        Self {
            kind: MisbehaviorKind::InvalidSignature,
            offender: vote.voter,
            view: vote.view,
            evidence: Evidence::InvalidVote(vote),
            detected_at: Utc::now(),
        }
    }

    pub fn invalid_timeout(timeout: TimeoutObject) -> Self {
        Self {
            kind: MisbehaviorKind::InvalidSignature,
            offender: timeout.signer,
            view: timeout.view,
            evidence: Evidence::InvalidTimeout(Box::new(timeout)),
            detected_at: Utc::now(),
        }
    }
}

/// Receives misbehavior reports. Implementations must not block.
pub trait MisbehaviorSink: Send + Sync {
    fn report(&self, report: MisbehaviorReport);
}

/// Forwards reports over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelMisbehaviorSink {
    tx: mpsc::UnboundedSender<MisbehaviorReport>,
}

impl ChannelMisbehaviorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MisbehaviorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MisbehaviorSink for ChannelMisbehaviorSink {
    fn report(&self, report: MisbehaviorReport) {
        if let Err(dropped) = self.tx.send(report) {
            debug!(
                kind = dropped.0.kind.as_str(),
                offender = dropped.0.offender,
                "misbehavior receiver dropped, discarding report"
            );
        }
    }
}

/// Logs every report at `warn` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMisbehaviorSink;

impl MisbehaviorSink for LoggingMisbehaviorSink {
    fn report(&self, report: MisbehaviorReport) {
        warn!(
            kind = report.kind.as_str(),
            offender = report.offender,
            view = report.view,
            "misbehavior detected"
        );
    }
}
