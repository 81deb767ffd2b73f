// Author: Ayush Srivastava
//! # End-to-End Certification Tests
//!
//! Drives collectors and whole engines through happy-path views, view
//! timeouts and equivocation.
//!
//! ## Test Coverage
//!
//! - QC formation from a quorum of votes, at most once per view
//! - Double-vote detection and reporting
//! - Four engines certifying a chain and finalizing under the 2-chain rule
//! - Partial TC acceleration and TC formation
//! - Local timer expiry producing exactly one timeout per view

mod common;
use common::*;

use hotstuff_certification::{
    config::EngineConfig,
    crypto::{sign_timeout, sign_vote},
    engine::{CertificationEngine, EngineHandles, EngineOutput},
    misbehavior::MisbehaviorKind,
    model::QuorumCertificate,
    registry::{CollectorRegistry, VoteCollectorFactory},
    safety::{InMemorySafetyStore, SafetyData, SafetyRules},
    vote_collector::VoteAdded,
    CertifyError, ViewChangeCause, ViewNumber,
};
use std::sync::Arc;
use std::time::Duration;

fn drain(handles: &mut EngineHandles) -> Vec<EngineOutput> {
    let mut outputs = Vec::new();
    while let Ok(output) = handles.outputs.try_recv() {
        outputs.push(output);
    }
    outputs
}

/// Safety data of a replica that has already seen a QC for view 9.
fn resumed_at_view_10(cluster: &Cluster) -> (Arc<InMemorySafetyStore>, QuorumCertificate) {
    let block9 = cluster.block(9, QuorumCertificate::genesis());
    let qc9 = cluster.qc(&block9, &[0, 1, 2]);
    let store = Arc::new(InMemorySafetyStore::with_data(SafetyData {
        highest_qc_seen: qc9.clone(),
        ..SafetyData::default()
    }));
    (store, qc9)
}

#[tokio::test]
async fn test_quorum_of_votes_forms_single_qc() {
    init_tracing();
    let cluster = Cluster::new(4);
    let (context, mut reports) = cluster.context();
    let registry = CollectorRegistry::new(VoteCollectorFactory::new(context, 64));

    let block9 = cluster.block(9, QuorumCertificate::genesis());
    let block10 = cluster.block(10, cluster.qc(&block9, &[1, 2, 3]));
    let collector = registry.get_or_create(10).unwrap();
    assert!(collector.register_block(block10.clone()).unwrap().is_none());

    let vote = |id: u32| sign_vote(&cluster.signers[id as usize], 10, block10.id()).unwrap();

    assert!(matches!(collector.add_vote(vote(0)).unwrap(), VoteAdded::Counted { weight: 1 }));
    assert!(matches!(collector.add_vote(vote(1)).unwrap(), VoteAdded::Counted { weight: 2 }));
    let qc = match collector.add_vote(vote(2)).unwrap() {
        VoteAdded::Certified(qc) => qc,
        other => panic!("expected a QC, got {:?}", other),
    };
    assert_eq!(qc.view, 10);
    assert_eq!(qc.block_id, block10.id());
    assert_eq!(qc.signers.len(), 3);

    // A fourth vote is counted but never yields a second QC
    assert!(!matches!(collector.add_vote(vote(3)).unwrap(), VoteAdded::Certified(_)));
    assert_eq!(collector.certificate().unwrap(), qc);

    // Validator 1 equivocates
    let conflicting = sign_vote(&cluster.signers[1], 10, block9.id()).unwrap();
    assert!(matches!(
        collector.add_vote(conflicting),
        Err(CertifyError::DoubleVote { voter: 1, view: 10 })
    ));
    let report = reports.try_recv().unwrap();
    assert_eq!(report.kind, MisbehaviorKind::DoubleVote);
    assert_eq!(report.offender, 1);

    // Validator 3's vote was counted after the QC; it equivocates on a different block
    let block10b = cluster.block(10, cluster.qc(&block9, &[0, 1, 2]));
    assert_ne!(block10b.id(), block10.id());
    let conflicting = sign_vote(&cluster.signers[3], 10, block10b.id()).unwrap();
    assert!(matches!(
        collector.add_vote(conflicting),
        Err(CertifyError::DoubleVote { voter: 3, view: 10 })
    ));
    let report = reports.try_recv().unwrap();
    assert_eq!(report.kind, MisbehaviorKind::DoubleVote);
    assert_eq!(report.offender, 3);
    assert_eq!(collector.certificate().unwrap(), qc);
}

#[tokio::test]
async fn test_four_engines_certify_and_finalize_chain() {
    init_tracing();
    let cluster = Cluster::new(4);
    let mut engines = Vec::new();
    let mut handles = Vec::new();
    for id in 0..4 {
        let (deps, _reports) = cluster.deps(id, Arc::new(InMemorySafetyStore::default()));
        let (engine, engine_handles) = CertificationEngine::new(EngineConfig::default(), deps).unwrap();
        engines.push(engine);
        handles.push(engine_handles);
    }

    let mut parent_qc = QuorumCertificate::genesis();
    let mut blocks = Vec::new();
    let mut finalized: Vec<(usize, ViewNumber)> = Vec::new();

    for view in 1..=4u64 {
        let block = cluster.block(view, parent_qc.clone());
        blocks.push(block.clone());
        for engine in &engines {
            engine.handle_proposal(block.clone()).unwrap();
        }

        let next_leader = ((view + 1) % 4) as usize;
        let mut votes = Vec::new();
        for (id, engine_handles) in handles.iter_mut().enumerate() {
            for output in drain(engine_handles) {
                match output {
                    EngineOutput::Vote { to, vote } => {
                        assert_eq!(to as usize, next_leader);
                        votes.push(vote);
                    }
                    EngineOutput::Finalized { view, block_id } => {
                        assert_eq!(block_id, blocks[view as usize - 1].id());
                        finalized.push((id, view));
                    }
                    EngineOutput::Timeout(_) | EngineOutput::Tc(_) => {
                        panic!("unexpected timeout activity at view {}", view)
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(votes.len(), 4, "every replica votes at view {}", view);

        for vote in votes {
            engines[next_leader].handle_vote(vote).unwrap();
        }
        let mut formed = None;
        for output in drain(&mut handles[next_leader]) {
            match output {
                EngineOutput::Qc(qc) => formed = Some(qc),
                EngineOutput::Finalized { view, .. } => finalized.push((next_leader, view)),
                _ => {}
            }
        }
        let qc = formed.expect("next leader forms a QC");
        assert_eq!(qc.view, view);
        assert_eq!(qc.block_id, block.id());
        assert_eq!(engines[next_leader].current_view(), view + 1);
        parent_qc = (*qc).clone();
    }

    // Blocks 1 and 2 are final everywhere; each replica reports each view once
    for (id, engine) in engines.iter().enumerate() {
        assert!(engine.finalized_view() >= 2, "replica {} finalized too little", id);
        let reported: Vec<_> = finalized.iter().filter(|(i, _)| *i == id).map(|(_, v)| *v).collect();
        let mut deduped = reported.clone();
        deduped.dedup();
        assert_eq!(reported, deduped);
        assert!(engine.vote_collectors().lowest_retained() >= 1);
    }
    assert!(finalized.iter().any(|(_, view)| *view == 1));
}

#[tokio::test]
async fn test_partial_timeouts_accelerate_local_timeout() {
    init_tracing();
    let cluster = Cluster::new(4);
    let (store, qc9) = resumed_at_view_10(&cluster);
    let (deps, _reports) = cluster.deps(0, store);
    let (engine, mut handles) = CertificationEngine::new(EngineConfig::default(), deps).unwrap();
    assert_eq!(engine.current_view(), 10);

    let timeout = |id: usize| sign_timeout(&cluster.signers[id], 10, qc9.clone(), None).unwrap();

    engine.handle_timeout(timeout(1)).unwrap();
    assert!(drain(&mut handles).is_empty());

    // Weight 2 reaches the partial threshold: the replica times out early
    engine.handle_timeout(timeout(2)).unwrap();
    let outputs = drain(&mut handles);
    assert_eq!(outputs.len(), 3, "{:?}", outputs);
    match &outputs[0] {
        EngineOutput::Timeout(own) => {
            assert_eq!(own.signer, 0);
            assert_eq!(own.view, 10);
            assert_eq!(own.newest_qc, qc9);
        }
        other => panic!("expected local timeout, got {:?}", other),
    }
    match &outputs[1] {
        EngineOutput::Tc(tc) => {
            assert_eq!(tc.view, 10);
            assert_eq!(tc.newest_qc, qc9);
            assert_eq!(tc.signers().count(), 3);
        }
        other => panic!("expected TC, got {:?}", other),
    }
    match &outputs[2] {
        EngineOutput::ViewChanged(change) => {
            assert_eq!(change.old_view, 10);
            assert_eq!(change.new_view, 11);
            assert_eq!(change.cause, ViewChangeCause::Tc);
        }
        other => panic!("expected view change, got {:?}", other),
    }
    assert_eq!(engine.pacemaker().round_failures(), 1);

    // A late timeout for view 10 produces nothing new
    engine.handle_timeout(timeout(3)).unwrap();
    assert!(drain(&mut handles).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timer_expiry_emits_one_timeout_per_view() {
    init_tracing();
    let cluster = Cluster::new(4);
    let (store, qc9) = resumed_at_view_10(&cluster);
    let (deps, _reports) = cluster.deps(0, store.clone());
    let config = EngineConfig::new().with_timeout_bounds(1, 100);
    let (engine, mut handles) = CertificationEngine::new(config, deps).unwrap();

    let shutdown = handles.shutdown.clone();
    let task = tokio::spawn(engine.run());

    let mut view10_timeouts = 0;
    loop {
        let output = tokio::time::timeout(Duration::from_secs(5), handles.outputs.recv())
            .await
            .expect("engine keeps timing out")
            .expect("engine running");
        if let EngineOutput::Timeout(timeout) = output {
            assert_eq!(timeout.newest_qc, qc9);
            match timeout.view {
                10 => view10_timeouts += 1,
                11 => break,
                other => panic!("unexpected timeout view {}", other),
            }
        }
    }
    assert_eq!(view10_timeouts, 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let persisted = store.snapshot().unwrap();
    assert!(persisted.last_timeout_view >= 11);
    // Views 10 and 11 were signed before the restart; both stay closed
    let restarted = SafetyRules::new(store).unwrap();
    assert!(matches!(
        restarted.can_timeout(10),
        Err(CertifyError::AlreadyVoted { view: 10, highest_voted_view }) if highest_voted_view >= 11
    ));
    assert!(restarted.can_timeout(persisted.last_timeout_view).is_err());
}

#[tokio::test]
async fn test_remote_double_vote_reported_through_engine() {
    let cluster = Cluster::new(4);
    let (deps, mut reports) = cluster.deps(2, Arc::new(InMemorySafetyStore::default()));
    let (engine, _handles) = CertificationEngine::new(EngineConfig::default(), deps).unwrap();

    let block = cluster.block(1, QuorumCertificate::genesis());
    engine.handle_proposal(block.clone()).unwrap();
    engine
        .handle_vote(sign_vote(&cluster.signers[3], 1, block.id()).unwrap())
        .unwrap();

    let other = cluster.block(2, QuorumCertificate::genesis());
    let err = engine
        .handle_vote(sign_vote(&cluster.signers[3], 1, other.id()).unwrap())
        .unwrap_err();
    assert!(err.is_misbehavior());
    assert!(!err.is_fatal());
    assert_eq!(reports.try_recv().unwrap().kind, MisbehaviorKind::DoubleVote);
}
