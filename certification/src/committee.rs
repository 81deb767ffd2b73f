//! Committee snapshots and the lookups the engine consumes.
//!
//! A [`Committee`] is the read-only identity → weight table of one epoch. It is
//! shared as `Arc<Committee>` by every collector of that epoch and never
//! mutated. Where the committee comes from and who leads a view are injected
//! through [`CommitteeProvider`] and [`LeaderSelection`], so the engine can be
//! exercised against synthetic committees.

use crate::{CertifyError, CertifyResult, EpochNumber, ValidatorId, ViewNumber, Weight};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weighted membership of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Committee {
    epoch: EpochNumber,
    members: BTreeMap<ValidatorId, Weight>,
    total_weight: Weight,
    quorum_threshold: Weight,
}

impl Committee {
    /// Build a committee with the default quorum threshold (strictly more than 2/3).
    pub fn new(
        epoch: EpochNumber,
        members: impl IntoIterator<Item = (ValidatorId, Weight)>,
    ) -> CertifyResult<Self> {
        let mut table = BTreeMap::new();
        let mut total: Weight = 0;
        for (id, weight) in members {
            if table.insert(id, weight).is_some() {
                return Err(CertifyError::InvalidConfig(format!(
                    "validator {} listed twice in committee",
                    id
                )));
            }
            total = total.checked_add(weight).ok_or_else(|| {
                CertifyError::InvalidConfig("committee weight overflows".to_string())
            })?;
        }
        if total == 0 {
            return Err(CertifyError::InvalidConfig(
                "committee must have positive total weight".to_string(),
            ));
        }

        Ok(Self {
            epoch,
            members: table,
            total_weight: total,
            quorum_threshold: Self::default_quorum_threshold(total),
        })
    }

    /// Every id gets the same weight; epoch 0.
    pub fn equal_weight(ids: &[ValidatorId], weight: Weight) -> CertifyResult<Self> {
        Self::new(0, ids.iter().map(|id| (*id, weight)))
    }

    /// Smallest weight strictly greater than 2/3 of `total`.
    pub fn default_quorum_threshold(total: Weight) -> Weight {
        ((total as u128 * 2) / 3 + 1) as Weight
    }

    /// Override the quorum threshold. It must stay above 2/3 of the total
    /// weight and be reachable.
    pub fn with_quorum_threshold(mut self, threshold: Weight) -> CertifyResult<Self> {
        if (threshold as u128) * 3 <= (self.total_weight as u128) * 2 {
            return Err(CertifyError::InvalidConfig(format!(
                "quorum threshold {} does not exceed 2/3 of total weight {}",
                threshold, self.total_weight
            )));
        }
        if threshold > self.total_weight {
            return Err(CertifyError::InvalidConfig(format!(
                "quorum threshold {} exceeds total weight {}",
                threshold, self.total_weight
            )));
        }
        self.quorum_threshold = threshold;
        Ok(self)
    }

    pub fn epoch(&self) -> EpochNumber {
        self.epoch
    }

    pub fn total_weight(&self) -> Weight {
        self.total_weight
    }

    pub fn quorum_threshold(&self) -> Weight {
        self.quorum_threshold
    }

    /// Weight that guarantees at least one honest member is included.
    pub fn partial_threshold(&self) -> Weight {
        self.total_weight - self.quorum_threshold + 1
    }

    pub fn weight(&self, id: ValidatorId) -> Option<Weight> {
        self.members.get(&id).copied()
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.members.contains_key(&id)
    }

    /// Sum of member weights; non-members contribute zero.
    pub fn weight_of(&self, ids: impl IntoIterator<Item = ValidatorId>) -> Weight {
        ids.into_iter()
            .filter_map(|id| self.weight(id))
            .fold(0, Weight::saturating_add)
    }

    pub fn has_quorum(&self, weight: Weight) -> bool {
        weight >= self.quorum_threshold
    }

    pub fn members(&self) -> impl Iterator<Item = (ValidatorId, Weight)> + '_ {
        self.members.iter().map(|(id, w)| (*id, *w))
    }

    pub fn ids(&self) -> Vec<ValidatorId> {
        self.members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Resolves the committee responsible for a view.
pub trait CommitteeProvider: Send + Sync {
    /// Fails with [`CertifyError::EpochUnknown`] when no snapshot covers `view`.
    fn committee_for(&self, view: ViewNumber) -> CertifyResult<Arc<Committee>>;
}

/// Picks the leader of a view. Must be a pure function of the view.
pub trait LeaderSelection: Send + Sync {
    fn leader_for(&self, view: ViewNumber) -> ValidatorId;
}

/// Fixed epoch schedule: each committee covers views from its first view up to
/// the next epoch's first view. Views past `final_view` are unknown.
#[derive(Debug, Clone, Default)]
pub struct StaticCommitteeProvider {
    epochs: BTreeMap<ViewNumber, Arc<Committee>>,
    final_view: Option<ViewNumber>,
}

impl StaticCommitteeProvider {
    /// One committee for every view.
    pub fn single(committee: Committee) -> Self {
        Self::default().with_epoch(0, committee)
    }

    pub fn with_epoch(mut self, first_view: ViewNumber, committee: Committee) -> Self {
        self.epochs.insert(first_view, Arc::new(committee));
        self
    }

    /// Last view any configured epoch covers.
    pub fn with_final_view(mut self, view: ViewNumber) -> Self {
        self.final_view = Some(view);
        self
    }
}

impl CommitteeProvider for StaticCommitteeProvider {
    fn committee_for(&self, view: ViewNumber) -> CertifyResult<Arc<Committee>> {
        if self.final_view.map_or(false, |last| view > last) {
            return Err(CertifyError::EpochUnknown { view });
        }
        self.epochs
            .range(..=view)
            .next_back()
            .map(|(_, committee)| Arc::clone(committee))
            .ok_or(CertifyError::EpochUnknown { view })
    }
}

/// Rotates leadership over the committee's ids in ascending order.
#[derive(Debug, Clone)]
pub struct RoundRobinLeaders {
    order: Vec<ValidatorId>,
}

impl RoundRobinLeaders {
    pub fn new(committee: &Committee) -> Self {
        Self {
            order: committee.ids(),
        }
    }
}

impl LeaderSelection for RoundRobinLeaders {
    fn leader_for(&self, view: ViewNumber) -> ValidatorId {
        // Committees are never empty, see Committee::new
        let index = (view % self.order.len().max(1) as u64) as usize;
        self.order.get(index).copied().unwrap_or_default()
    }
}
