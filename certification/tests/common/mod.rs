// Author: Ayush Srivastava
//! # Shared Test Fixtures
//!
//! Deterministic committees, signers and certificate builders used by the
//! integration test suites.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use hotstuff_certification::{
    committee::{Committee, RoundRobinLeaders, StaticCommitteeProvider},
    crypto::{sign_timeout, sign_vote, Ed25519Scheme, Ed25519Signer, SignatureScheme},
    engine::{EngineDeps, InMemoryBlockSource},
    misbehavior::{ChannelMisbehaviorSink, MisbehaviorReport},
    model::{Block, HashValue, QuorumCertificate, TimeoutCertificate},
    registry::CollectorContext,
    safety::InMemorySafetyStore,
    ValidatorId, ViewNumber,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An equal-weight committee with matching signers.
pub struct Cluster {
    pub committee: Committee,
    pub scheme: Arc<Ed25519Scheme>,
    pub signers: Vec<Ed25519Signer>,
}

impl Cluster {
    pub fn new(size: u32) -> Self {
        let ids: Vec<ValidatorId> = (0..size).collect();
        let (scheme, signers) = Ed25519Scheme::generate_for_ids(&ids);
        Self {
            committee: Committee::equal_weight(&ids, 1).expect("non-empty committee"),
            scheme: Arc::new(scheme),
            signers,
        }
    }

    /// Member `i` gets `weights[i]`.
    pub fn weighted(weights: &[u64]) -> Self {
        let ids: Vec<ValidatorId> = (0..weights.len() as u32).collect();
        let (scheme, signers) = Ed25519Scheme::generate_for_ids(&ids);
        let committee = Committee::new(0, ids.iter().copied().zip(weights.iter().copied()))
            .expect("positive total weight");
        Self {
            committee,
            scheme: Arc::new(scheme),
            signers,
        }
    }

    pub fn provider(&self) -> Arc<StaticCommitteeProvider> {
        Arc::new(StaticCommitteeProvider::single(self.committee.clone()))
    }

    pub fn leaders(&self) -> Arc<RoundRobinLeaders> {
        Arc::new(RoundRobinLeaders::new(&self.committee))
    }

    pub fn context(&self) -> (CollectorContext, mpsc::UnboundedReceiver<MisbehaviorReport>) {
        let (sink, reports) = ChannelMisbehaviorSink::new();
        let context = CollectorContext {
            committees: self.provider(),
            scheme: self.scheme.clone(),
            misbehavior: Arc::new(sink),
        };
        (context, reports)
    }

    /// A block at `view` proposed by that view's round-robin leader.
    pub fn block(&self, view: ViewNumber, parent_qc: QuorumCertificate) -> Block {
        let proposer = (view % self.signers.len() as u64) as ValidatorId;
        Block::new(
            view,
            HashValue::digest(&view.to_be_bytes()),
            proposer,
            Utc.timestamp_opt(1_700_000_000 + view as i64, 0).unwrap(),
            parent_qc,
        )
        .unwrap()
    }

    /// A valid QC for `block` signed by `voters`.
    pub fn qc(&self, block: &Block, voters: &[ValidatorId]) -> QuorumCertificate {
        let parts: Vec<_> = voters
            .iter()
            .map(|id| {
                let vote = sign_vote(&self.signers[*id as usize], block.view(), block.id()).unwrap();
                (*id, vote.signature)
            })
            .collect();
        QuorumCertificate {
            view: block.view(),
            block_id: block.id(),
            signers: voters.iter().copied().collect(),
            signature: self.scheme.aggregate(&parts).unwrap(),
        }
    }

    /// A valid TC for `view` where every signer reports `newest_qc`.
    pub fn tc(&self, view: ViewNumber, newest_qc: &QuorumCertificate, signers: &[ValidatorId]) -> TimeoutCertificate {
        let parts: Vec<_> = signers
            .iter()
            .map(|id| {
                let timeout =
                    sign_timeout(&self.signers[*id as usize], view, newest_qc.clone(), None).unwrap();
                (*id, timeout.signature)
            })
            .collect();
        TimeoutCertificate {
            view,
            newest_qc: newest_qc.clone(),
            newest_qc_views: signers.iter().map(|id| (*id, newest_qc.view)).collect::<BTreeMap<_, _>>(),
            signature: self.scheme.aggregate(&parts).unwrap(),
        }
    }

    /// Engine dependencies for validator `me`.
    pub fn deps(
        &self,
        me: ValidatorId,
        store: Arc<InMemorySafetyStore>,
    ) -> (EngineDeps, mpsc::UnboundedReceiver<MisbehaviorReport>) {
        let (sink, reports) = ChannelMisbehaviorSink::new();
        let deps = EngineDeps {
            signer: Arc::new(self.signers[me as usize].clone()),
            scheme: self.scheme.clone(),
            committees: self.provider(),
            leaders: self.leaders(),
            blocks: Arc::new(InMemoryBlockSource::default()),
            misbehavior: Arc::new(sink),
            safety_store: store,
        };
        (deps, reports)
    }
}
