// Author: Ayush Srivastava
//! # Pacemaker Timing Tests
//!
//! Runs a full engine on a paused clock and checks when view timers fire.
//!
//! ## Test Coverage
//!
//! - A QC cancels the timer of the view it leaves
//! - Consecutive local timeouts back off exponentially up to the cap
//! - A QC after a run of failures shrinks the timeout again

mod common;
use common::*;

use hotstuff_certification::{
    config::EngineConfig,
    engine::{CertificationEngine, EngineHandles, EngineInput, EngineOutput},
    model::QuorumCertificate,
    safety::InMemorySafetyStore,
    ViewChange, ViewChangeCause,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn next_output(handles: &mut EngineHandles) -> EngineOutput {
    tokio::time::timeout(Duration::from_secs(60), handles.outputs.recv())
        .await
        .expect("engine produced output")
        .expect("engine running")
}

async fn next_view_change(handles: &mut EngineHandles) -> ViewChange {
    loop {
        if let EngineOutput::ViewChanged(change) = next_output(handles).await {
            return change;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_qc_cancels_timer_of_previous_view() {
    init_tracing();
    let cluster = Cluster::new(4);
    let (deps, _reports) = cluster.deps(0, Arc::new(InMemorySafetyStore::default()));
    let config = EngineConfig::new().with_timeout_bounds(100, 1_000);
    let (engine, mut handles) = CertificationEngine::new(config, deps).unwrap();
    let shutdown = handles.shutdown.clone();
    let started = Instant::now();
    let task = tokio::spawn(engine.run());

    let block1 = cluster.block(1, QuorumCertificate::genesis());
    handles.inputs.send(EngineInput::Proposal(block1.clone())).unwrap();

    // Halfway through view 1 a proposal for view 2 certifies block 1
    tokio::time::sleep(Duration::from_millis(50)).await;
    let block2 = cluster.block(2, cluster.qc(&block1, &[1, 2, 3]));
    handles.inputs.send(EngineInput::Proposal(block2)).unwrap();

    let mut saw_qc_change = false;
    let first_timeout = loop {
        match next_output(&mut handles).await {
            EngineOutput::ViewChanged(change) => {
                assert_eq!(change.old_view, 1);
                assert_eq!(change.new_view, 2);
                assert_eq!(change.cause, ViewChangeCause::Qc);
                assert_eq!(change.timeout, Duration::from_millis(100));
                saw_qc_change = true;
            }
            EngineOutput::Timeout(timeout) => break timeout,
            _ => {}
        }
    };
    assert!(saw_qc_change);

    // View 1's timer would have fired at 100ms; view 2's fires at 150ms
    assert_eq!(first_timeout.view, 2);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(started.elapsed() < Duration::from_millis(200));

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_and_shrinks() {
    init_tracing();
    let cluster = Cluster::new(4);
    let (deps, _reports) = cluster.deps(0, Arc::new(InMemorySafetyStore::default()));
    let config = EngineConfig::new()
        .with_timeout_bounds(10, 1_000)
        .with_increase_factor(2.0)
        .with_happy_path_max_round_failures(1);
    let (engine, mut handles) = CertificationEngine::new(config, deps).unwrap();
    let shutdown = handles.shutdown.clone();
    let task = tokio::spawn(engine.run());

    let mut timeouts = Vec::new();
    for expected_view in 2..=6 {
        let change = next_view_change(&mut handles).await;
        assert_eq!(change.new_view, expected_view);
        assert_eq!(change.cause, ViewChangeCause::LocalTimeout);
        timeouts.push(change.timeout.as_millis());
    }
    assert_eq!(timeouts, vec![10, 20, 40, 80, 160]);

    // A proposal for view 7 carries a QC for view 6
    let block6 = cluster.block(6, QuorumCertificate::genesis());
    let block7 = cluster.block(7, cluster.qc(&block6, &[1, 2, 3]));
    handles.inputs.send(EngineInput::Proposal(block7)).unwrap();

    let change = next_view_change(&mut handles).await;
    assert_eq!(change.old_view, 6);
    assert_eq!(change.new_view, 7);
    assert_eq!(change.cause, ViewChangeCause::Qc);
    assert_eq!(change.timeout, Duration::from_millis(80));

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backoff_capped_at_max_timeout() {
    let cluster = Cluster::new(4);
    let (deps, _reports) = cluster.deps(1, Arc::new(InMemorySafetyStore::default()));
    let config = EngineConfig::new()
        .with_timeout_bounds(10, 50)
        .with_happy_path_max_round_failures(0);
    let (engine, mut handles) = CertificationEngine::new(config, deps).unwrap();
    let shutdown = handles.shutdown.clone();
    let task = tokio::spawn(engine.run());

    let mut last = Duration::ZERO;
    for _ in 0..8 {
        let change = next_view_change(&mut handles).await;
        assert!(change.timeout >= last);
        assert!(change.timeout <= Duration::from_millis(50));
        last = change.timeout;
    }
    assert_eq!(last, Duration::from_millis(50));

    // Closing the input channel stops the engine cleanly
    drop(handles.inputs);
    task.await.unwrap().unwrap();
    assert!(!shutdown.is_cancelled());
}
