//! # Collector Registry
//!
//! Creates per-view collectors on demand and evicts them once their view falls
//! below the pruning boundary.
//!
//! ## Key Features
//!
//! - **Single instance per view**: concurrent `get_or_create` calls for the
//!   same view collapse onto one collector through the map's entry API
//! - **Monotonic boundary**: views below the boundary are never recreated;
//!   requests for them fail with [`CertifyError::StaleView`]
//! - **Reported creation failures**: a missing committee snapshot surfaces
//!   as an error and nothing is inserted

use crate::committee::CommitteeProvider;
use crate::crypto::SignatureScheme;
use crate::misbehavior::MisbehaviorSink;
use crate::timeout_collector::TimeoutCollector;
use crate::vote_collector::VoteCollector;
use crate::{CertifyError, CertifyResult, CollectorKind, ViewNumber};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

/// A per-view accumulator owned by a [`CollectorRegistry`].
pub trait Collector: Send + Sync {
    fn view(&self) -> ViewNumber;

    /// Called once when the registry evicts the collector. Later operations
    /// on a retained handle must fail with [`CertifyError::StaleView`].
    fn mark_pruned(&self, boundary: ViewNumber);
}

/// Builds the collector for a view.
pub trait CollectorFactory: Send + Sync {
    type Output: Collector;

    const KIND: CollectorKind;

    fn create(&self, view: ViewNumber) -> CertifyResult<Self::Output>;
}

/// View-keyed arena of collectors with explicit eviction.
pub struct CollectorRegistry<F: CollectorFactory> {
    factory: F,
    collectors: DashMap<ViewNumber, Arc<F::Output>>,
    lowest_retained: RwLock<ViewNumber>,
}

impl<F: CollectorFactory> CollectorRegistry<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            collectors: DashMap::new(),
            lowest_retained: RwLock::new(0),
        }
    }

    /// The collector for `view`, created if this is the first request.
    pub fn get_or_create(&self, view: ViewNumber) -> CertifyResult<Arc<F::Output>> {
        // Held across the insert so pruning cannot interleave
        let lowest_retained = self.lowest_retained.read();
        if view < *lowest_retained {
            return Err(CertifyError::StaleView {
                view,
                lowest_retained: *lowest_retained,
            });
        }

        match self.collectors.entry(view) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let collector = Arc::new(self.factory.create(view)?);
                trace!(kind = %F::KIND, view, "collector created");
                entry.insert(collector.clone());
                Ok(collector)
            }
        }
    }

    pub fn get(&self, view: ViewNumber) -> Option<Arc<F::Output>> {
        self.collectors.get(&view).map(|entry| entry.value().clone())
    }

    /// Evict every collector for a view strictly below `boundary`. Lowering
    /// the boundary is a no-op. Returns the number of evicted collectors.
    pub fn prune_below(&self, boundary: ViewNumber) -> usize {
        let mut lowest_retained = self.lowest_retained.write();
        if boundary <= *lowest_retained {
            return 0;
        }
        *lowest_retained = boundary;

        let before = self.collectors.len();
        self.collectors.retain(|view, collector| {
            if *view < boundary {
                collector.mark_pruned(boundary);
                false
            } else {
                true
            }
        });
        let evicted = before - self.collectors.len();
        debug!(kind = %F::KIND, boundary, evicted, "collectors pruned");
        evicted
    }

    pub fn lowest_retained(&self) -> ViewNumber {
        *self.lowest_retained.read()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

/// Shared collaborators every collector needs.
#[derive(Clone)]
pub struct CollectorContext {
    pub committees: Arc<dyn CommitteeProvider>,
    pub scheme: Arc<dyn SignatureScheme>,
    pub misbehavior: Arc<dyn MisbehaviorSink>,
}

pub struct VoteCollectorFactory {
    context: CollectorContext,
    max_pending: usize,
}

impl VoteCollectorFactory {
    pub fn new(context: CollectorContext, max_pending: usize) -> Self {
        Self {
            context,
            max_pending,
        }
    }
}

impl CollectorFactory for VoteCollectorFactory {
    type Output = VoteCollector;

    const KIND: CollectorKind = CollectorKind::Vote;

    fn create(&self, view: ViewNumber) -> CertifyResult<VoteCollector> {
        let committee = self.context.committees.committee_for(view)?;
        Ok(VoteCollector::new(
            view,
            committee,
            self.context.scheme.clone(),
            self.context.misbehavior.clone(),
            self.max_pending,
        ))
    }
}

pub struct TimeoutCollectorFactory {
    context: CollectorContext,
}

impl TimeoutCollectorFactory {
    pub fn new(context: CollectorContext) -> Self {
        Self { context }
    }
}

impl CollectorFactory for TimeoutCollectorFactory {
    type Output = TimeoutCollector;

    const KIND: CollectorKind = CollectorKind::Timeout;

    fn create(&self, view: ViewNumber) -> CertifyResult<TimeoutCollector> {
        let committee = self.context.committees.committee_for(view)?;
        Ok(TimeoutCollector::new(
            view,
            committee,
            self.context.committees.clone(),
            self.context.scheme.clone(),
            self.context.misbehavior.clone(),
        ))
    }
}

pub type VoteCollectors = CollectorRegistry<VoteCollectorFactory>;
pub type TimeoutCollectors = CollectorRegistry<TimeoutCollectorFactory>;
