//! # Certification Engine
//!
//! Routes inbound proposals, votes and timeouts to the per-view collectors,
//! feeds the resulting certificates to the pacemaker, and signs the local
//! replica's votes and timeouts through the safety rules.
//!
//! ## Data Flow
//!
//! - **Proposal**: validated, registered with the view's vote collector, and
//!   voted for if it belongs to the current view; the vote goes to the next
//!   view's leader
//! - **Vote**: added to the view's vote collector; a formed QC advances the
//!   pacemaker and may finalize the grandparent chain (2-chain rule), which
//!   prunes both registries
//! - **Timeout**: added to the view's timeout collector; a partial TC makes
//!   the local replica time out early, a TC advances the pacemaker
//! - **Timer expiry**: the local replica times out and the view advances
//!
//! Results are published as [`EngineOutput`] values on an unbounded channel.

use crate::committee::{CommitteeProvider, LeaderSelection};
use crate::config::EngineConfig;
use crate::crypto::{SignatureScheme, Signer};
use crate::misbehavior::MisbehaviorSink;
use crate::model::{Block, BlockId, QuorumCertificate, TimeoutCertificate, TimeoutObject, Vote};
use crate::pacemaker::{Pacemaker, TimerExpired, ViewChange};
use crate::registry::{
    CollectorContext, CollectorRegistry, TimeoutCollectorFactory, TimeoutCollectors,
    VoteCollectorFactory, VoteCollectors,
};
use crate::safety::{SafetyDataStore, SafetyRules};
use crate::timeout_collector::TimeoutEvent;
use crate::validation::validate_block;
use crate::vote_collector::VoteAdded;
use crate::{CertifyError, CertifyResult, ValidatorId, ViewNumber};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Supplies blocks referenced by votes whose proposal has not been seen.
pub trait BlockSource: Send + Sync {
    fn get_block(&self, id: &BlockId) -> Option<Block>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlockSource {
    blocks: DashMap<BlockId, Block>,
}

impl InMemoryBlockSource {
    pub fn insert(&self, block: Block) {
        self.blocks.insert(block.id(), block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockSource for InMemoryBlockSource {
    fn get_block(&self, id: &BlockId) -> Option<Block> {
        self.blocks.get(id).map(|entry| entry.value().clone())
    }
}

/// External collaborators of the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub signer: Arc<dyn Signer>,
    pub scheme: Arc<dyn SignatureScheme>,
    pub committees: Arc<dyn CommitteeProvider>,
    pub leaders: Arc<dyn LeaderSelection>,
    pub blocks: Arc<dyn BlockSource>,
    pub misbehavior: Arc<dyn MisbehaviorSink>,
    pub safety_store: Arc<dyn SafetyDataStore>,
}

/// Messages delivered to the engine by the network layer.
#[derive(Debug, Clone)]
pub enum EngineInput {
    Proposal(Block),
    Vote(Vote),
    Timeout(TimeoutObject),
}

/// Everything the engine publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    /// Local vote, to be sent to the leader of the next view
    Vote { to: ValidatorId, vote: Vote },
    /// Local timeout, to be broadcast
    Timeout(TimeoutObject),
    Qc(Arc<QuorumCertificate>),
    Tc(Arc<TimeoutCertificate>),
    Finalized { view: ViewNumber, block_id: BlockId },
    ViewChanged(ViewChange),
}

/// Channels connecting a running engine to its host.
#[derive(Debug)]
pub struct EngineHandles {
    pub inputs: mpsc::UnboundedSender<EngineInput>,
    pub outputs: mpsc::UnboundedReceiver<EngineOutput>,
    pub shutdown: CancellationToken,
}

enum Wakeup {
    Shutdown,
    InputsClosed,
    Timer(TimerExpired),
    Input(EngineInput),
}

pub struct CertificationEngine {
    me: ValidatorId,
    signer: Arc<dyn Signer>,
    scheme: Arc<dyn SignatureScheme>,
    committees: Arc<dyn CommitteeProvider>,
    leaders: Arc<dyn LeaderSelection>,
    blocks: Arc<dyn BlockSource>,
    safety: SafetyRules,
    pacemaker: Pacemaker,
    votes: VoteCollectors,
    timeouts: TimeoutCollectors,
    finalized_view: AtomicU64,
    max_view_lookahead: ViewNumber,
    outputs: mpsc::UnboundedSender<EngineOutput>,
    inputs: mpsc::UnboundedReceiver<EngineInput>,
    timer_rx: mpsc::UnboundedReceiver<TimerExpired>,
    shutdown: CancellationToken,
}

impl CertificationEngine {
    /// Build an engine resuming from the persisted safety data. The view
    /// starts right after the highest QC the replica has seen.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> CertifyResult<(Self, EngineHandles)> {
        config.validate()?;

        let safety = SafetyRules::new(deps.safety_store)?;
        let highest_qc = safety.highest_qc_seen();
        let start_view = highest_qc.view + 1;
        let (pacemaker, timer_rx) = Pacemaker::new(config.timeouts.clone(), start_view, highest_qc);

        let context = CollectorContext {
            committees: deps.committees.clone(),
            scheme: deps.scheme.clone(),
            misbehavior: deps.misbehavior,
        };
        let votes = CollectorRegistry::new(VoteCollectorFactory::new(
            context.clone(),
            config.collectors.max_pending_votes_per_view,
        ));
        let timeouts = CollectorRegistry::new(TimeoutCollectorFactory::new(context));

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let engine = Self {
            me: deps.signer.id(),
            signer: deps.signer,
            scheme: deps.scheme,
            committees: deps.committees,
            leaders: deps.leaders,
            blocks: deps.blocks,
            safety,
            pacemaker,
            votes,
            timeouts,
            finalized_view: AtomicU64::new(0),
            max_view_lookahead: config.collectors.max_view_lookahead,
            outputs: output_tx,
            inputs: input_rx,
            timer_rx,
            shutdown: shutdown.clone(),
        };
        let handles = EngineHandles {
            inputs: input_tx,
            outputs: output_rx,
            shutdown,
        };
        Ok((engine, handles))
    }

    /// Drive the engine until shutdown, until the input channel closes, or
    /// until a fatal error occurs (which is returned).
    pub async fn run(mut self) -> CertifyResult<()> {
        self.pacemaker.start();
        info!(
            validator = self.me,
            view = self.pacemaker.current_view(),
            "certification engine running"
        );

        loop {
            let wakeup = tokio::select! {
                _ = self.shutdown.cancelled() => Wakeup::Shutdown,
                Some(expired) = self.timer_rx.recv() => Wakeup::Timer(expired),
                input = self.inputs.recv() => match input {
                    Some(input) => Wakeup::Input(input),
                    None => Wakeup::InputsClosed,
                },
            };

            let result = match wakeup {
                Wakeup::Timer(expired) => self.handle_timer_expired(expired),
                Wakeup::Input(input) => self.handle_input(input),
                Wakeup::Shutdown => {
                    info!(validator = self.me, "certification engine shutting down");
                    break;
                }
                Wakeup::InputsClosed => {
                    info!(validator = self.me, "input channel closed");
                    break;
                }
            };

            if let Err(e) = result {
                if e.is_fatal() || matches!(e, CertifyError::ChannelClosed) {
                    error!(validator = self.me, error = %e, "certification engine stopped");
                    self.pacemaker.stop();
                    return Err(e);
                }
                debug!(validator = self.me, error = %e, "input rejected");
            }
        }

        self.pacemaker.stop();
        Ok(())
    }

    pub fn handle_input(&self, input: EngineInput) -> CertifyResult<()> {
        match input {
            EngineInput::Proposal(block) => self.handle_proposal(block),
            EngineInput::Vote(vote) => self.handle_vote(vote),
            EngineInput::Timeout(timeout) => self.handle_timeout(timeout),
        }
    }

    pub fn handle_proposal(&self, block: Block) -> CertifyResult<()> {
        validate_block(
            &block,
            self.committees.as_ref(),
            self.leaders.as_ref(),
            self.scheme.as_ref(),
        )?;
        debug!(view = block.view(), block = %block.id(), proposer = block.proposer(), "proposal received");

        let parent_qc = block.parent_qc();
        if let Some(parent) = self.known_block(parent_qc.view, &parent_qc.block_id) {
            self.safety.observe_certified_block(&parent)?;
            self.try_finalize(&parent)?;
        }
        self.observe_qc(Arc::new(parent_qc.clone()))?;

        self.check_horizon(block.view())?;
        let collector = self.votes.get_or_create(block.view())?;
        if let Some(qc) = collector.register_block(block.clone())? {
            self.on_qc_formed(qc)?;
        }

        if block.view() == self.pacemaker.current_view() {
            self.vote_for(&block)?;
        }
        Ok(())
    }

    pub fn handle_vote(&self, vote: Vote) -> CertifyResult<()> {
        self.admit(vote.view, vote.voter)?;
        let collector = self.votes.get_or_create(vote.view)?;
        match collector.add_vote(vote) {
            Ok(VoteAdded::Certified(qc)) => self.on_qc_formed(qc),
            Ok(_) => Ok(()),
            Err(CertifyError::UnknownBlock { view, block_id }) => match self.blocks.get_block(&block_id) {
                Some(block) if block.view() == view => {
                    debug!(view, block = %block_id, "fetched block referenced by buffered vote");
                    self.handle_proposal(block)
                }
                _ => Err(CertifyError::UnknownBlock { view, block_id }),
            },
            Err(CertifyError::DoubleVote { voter, view }) if voter == self.me => {
                Err(CertifyError::LocalSafetyViolation(format!(
                    "local replica {} voted twice at view {}",
                    voter, view
                )))
            }
            Err(e) => Err(e),
        }
    }

    pub fn handle_timeout(&self, timeout: TimeoutObject) -> CertifyResult<()> {
        self.admit(timeout.view, timeout.signer)?;
        let collector = self.timeouts.get_or_create(timeout.view)?;
        let events = match collector.add_timeout(timeout) {
            Ok(events) => events,
            Err(CertifyError::DoubleTimeout { voter, view }) if voter == self.me => {
                return Err(CertifyError::LocalSafetyViolation(format!(
                    "local replica {} timed out twice at view {}",
                    voter, view
                )));
            }
            Err(e) => return Err(e),
        };

        for event in events {
            match event {
                TimeoutEvent::PartialTc { view, .. } => {
                    if view == self.pacemaker.current_view() {
                        self.broadcast_timeout(view)?;
                    }
                }
                TimeoutEvent::NewQcDiscovered(qc) => self.observe_qc(qc)?,
                TimeoutEvent::NewTcDiscovered(tc) => self.observe_tc(tc)?,
                TimeoutEvent::TcFormed(tc) => {
                    self.emit(EngineOutput::Tc(tc.clone()))?;
                    self.observe_tc(tc)?;
                }
            }
        }
        Ok(())
    }

    pub fn handle_timer_expired(&self, expired: TimerExpired) -> CertifyResult<()> {
        let Some(change) = self.pacemaker.on_timer_expired(expired) else {
            return Ok(());
        };
        self.broadcast_timeout(expired.view)?;
        self.emit(EngineOutput::ViewChanged(change))
    }

    /// Checks that run before a collector is created for `view` on behalf of
    /// `sender`. Signatures are verified by the collector itself.
    fn admit(&self, view: ViewNumber, sender: ValidatorId) -> CertifyResult<()> {
        self.check_horizon(view)?;
        let committee = self.committees.committee_for(view)?;
        if !committee.contains(sender) {
            return Err(CertifyError::UnknownParticipant { id: sender, view });
        }
        Ok(())
    }

    fn check_horizon(&self, view: ViewNumber) -> CertifyResult<()> {
        let current_view = self.pacemaker.current_view();
        if view > current_view.saturating_add(self.max_view_lookahead) {
            return Err(CertifyError::ViewTooFarAhead {
                view,
                current_view,
                lookahead: self.max_view_lookahead,
            });
        }
        Ok(())
    }

    fn vote_for(&self, block: &Block) -> CertifyResult<()> {
        let committee = self.committees.committee_for(block.view())?;
        if !committee.contains(self.me) {
            return Ok(());
        }
        let vote = match self.safety.produce_vote(self.signer.as_ref(), block) {
            Ok(vote) => vote,
            Err(
                e @ (CertifyError::AlreadyVoted { .. }
                | CertifyError::AlreadyTimedOut { .. }
                | CertifyError::UnsafeExtension { .. }),
            ) => {
                debug!(view = block.view(), reason = %e, "not voting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let next_leader = self.leaders.leader_for(block.view() + 1);
        debug!(view = block.view(), block = %block.id(), to = next_leader, "voted");
        self.emit(EngineOutput::Vote {
            to: next_leader,
            vote: vote.clone(),
        })?;
        if next_leader == self.me {
            self.handle_vote(vote)?;
        }
        Ok(())
    }

    fn broadcast_timeout(&self, view: ViewNumber) -> CertifyResult<()> {
        let committee = self.committees.committee_for(view)?;
        if !committee.contains(self.me) {
            return Ok(());
        }
        let newest_qc = (*self.pacemaker.newest_qc()).clone();
        let last_view_tc = self
            .pacemaker
            .last_view_tc()
            .filter(|tc| tc.view + 1 == view)
            .map(|tc| (*tc).clone());

        let timeout = match self
            .safety
            .produce_timeout(self.signer.as_ref(), view, newest_qc, last_view_tc)
        {
            Ok(timeout) => timeout,
            Err(e @ (CertifyError::AlreadyVoted { .. } | CertifyError::AlreadyTimedOut { .. })) => {
                debug!(view, reason = %e, "not timing out");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(view, newest_qc_view = timeout.newest_qc.view, "timing out");
        self.emit(EngineOutput::Timeout(timeout.clone()))?;
        self.handle_timeout(timeout)
    }

    fn on_qc_formed(&self, qc: Arc<QuorumCertificate>) -> CertifyResult<()> {
        self.emit(EngineOutput::Qc(qc.clone()))?;
        if let Some(block) = self.known_block(qc.view, &qc.block_id) {
            self.safety.observe_certified_block(&block)?;
            self.try_finalize(&block)?;
        }
        self.observe_qc(qc)
    }

    fn observe_qc(&self, qc: Arc<QuorumCertificate>) -> CertifyResult<()> {
        self.safety.observe_qc(&qc)?;
        if let Some(change) = self.pacemaker.process_qc(qc) {
            self.emit(EngineOutput::ViewChanged(change))?;
        }
        Ok(())
    }

    fn observe_tc(&self, tc: Arc<TimeoutCertificate>) -> CertifyResult<()> {
        self.safety.observe_qc(&tc.newest_qc)?;
        if let Some(change) = self.pacemaker.process_tc(tc) {
            self.emit(EngineOutput::ViewChanged(change))?;
        }
        Ok(())
    }

    /// `block` is certified; if it directly extends its parent, the parent is final.
    fn try_finalize(&self, block: &Block) -> CertifyResult<()> {
        let parent = block.parent_qc();
        if parent.is_genesis() || !block.extends_parent_directly() {
            return Ok(());
        }
        let previous = self.finalized_view.fetch_max(parent.view, Ordering::AcqRel);
        if previous >= parent.view {
            return Ok(());
        }

        let evicted = self.votes.prune_below(parent.view) + self.timeouts.prune_below(parent.view);
        info!(view = parent.view, block = %parent.block_id, evicted, "block finalized");
        self.emit(EngineOutput::Finalized {
            view: parent.view,
            block_id: parent.block_id,
        })
    }

    fn known_block(&self, view: ViewNumber, id: &BlockId) -> Option<Block> {
        self.votes
            .get(view)
            .and_then(|collector| collector.block())
            .filter(|block| block.id() == *id)
            .or_else(|| self.blocks.get_block(id))
    }

    fn emit(&self, output: EngineOutput) -> CertifyResult<()> {
        self.outputs
            .send(output)
            .map_err(|_| CertifyError::ChannelClosed)
    }

    pub fn id(&self) -> ValidatorId {
        self.me
    }

    pub fn current_view(&self) -> ViewNumber {
        self.pacemaker.current_view()
    }

    pub fn finalized_view(&self) -> ViewNumber {
        self.finalized_view.load(Ordering::Acquire)
    }

    pub fn safety(&self) -> &SafetyRules {
        &self.safety
    }

    pub fn pacemaker(&self) -> &Pacemaker {
        &self.pacemaker
    }

    pub fn vote_collectors(&self) -> &VoteCollectors {
        &self.votes
    }

    pub fn timeout_collectors(&self) -> &TimeoutCollectors {
        &self.timeouts
    }
}
