//! # Safety Rules
//!
//! The single synchronization point that decides whether the local replica may
//! sign a vote or a timeout. Every outbound signature passes through
//! [`SafetyRules`] exactly once.
//!
//! ## Key Features
//!
//! - **Atomic check-and-update**: the decision and the state change happen
//!   under one lock, so two concurrent requests for the same view never both
//!   succeed
//! - **Write-then-release**: the updated [`SafetyData`] is persisted before the
//!   lock is released; a failed write rolls the update back and is fatal
//! - **Locking rule**: a block may only be voted for if its parent QC is not
//!   older than the locked QC

use crate::crypto::{sign_timeout, sign_vote, Signer};
use crate::model::{Block, QuorumCertificate, TimeoutCertificate, TimeoutObject, Vote};
use crate::{CertifyError, CertifyResult, ViewNumber};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Persisted safety state of the local replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyData {
    /// Highest view in which a vote or timeout was signed
    pub highest_voted_view: ViewNumber,
    /// Highest view in which a timeout was signed (0 = none)
    pub last_timeout_view: ViewNumber,
    /// Votes must extend a block certified at least this recently
    pub locked_qc: QuorumCertificate,
    pub highest_qc_seen: QuorumCertificate,
}

impl Default for SafetyData {
    fn default() -> Self {
        Self {
            highest_voted_view: 0,
            last_timeout_view: 0,
            locked_qc: QuorumCertificate::genesis(),
            highest_qc_seen: QuorumCertificate::genesis(),
        }
    }
}

/// Durable storage for [`SafetyData`].
pub trait SafetyDataStore: Send + Sync {
    fn load(&self) -> CertifyResult<Option<SafetyData>>;

    /// Must not return before `data` is durable.
    fn store(&self, data: &SafetyData) -> CertifyResult<()>;
}

/// Keeps the last stored value in memory.
#[derive(Debug, Default)]
pub struct InMemorySafetyStore {
    data: Mutex<Option<SafetyData>>,
}

impl InMemorySafetyStore {
    /// Start from previously persisted state.
    pub fn with_data(data: SafetyData) -> Self {
        Self {
            data: Mutex::new(Some(data)),
        }
    }

    pub fn snapshot(&self) -> Option<SafetyData> {
        self.data.lock().clone()
    }
}

impl SafetyDataStore for InMemorySafetyStore {
    fn load(&self) -> CertifyResult<Option<SafetyData>> {
        Ok(self.data.lock().clone())
    }

    fn store(&self, data: &SafetyData) -> CertifyResult<()> {
        *self.data.lock() = Some(data.clone());
        Ok(())
    }
}

/// bincode file, replaced atomically through a sibling temp file.
#[derive(Debug, Clone)]
pub struct FileSafetyStore {
    path: PathBuf,
}

impl FileSafetyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SafetyDataStore for FileSafetyStore {
    fn load(&self) -> CertifyResult<Option<SafetyData>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CertifyError::Persistence(e.to_string())),
        }
    }

    fn store(&self, data: &SafetyData) -> CertifyResult<()> {
        let bytes = bincode::serialize(data)?;
        let tmp = self.path.with_extension("tmp");
        let persist = || -> std::io::Result<()> {
            fs::write(&tmp, &bytes)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            // Make the rename itself durable
            let dir = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            fs::File::open(dir)?.sync_all()
        };
        persist().map_err(|e| CertifyError::Persistence(e.to_string()))
    }
}

/// Guards the local replica against equivocation.
pub struct SafetyRules {
    state: Mutex<SafetyData>,
    store: Arc<dyn SafetyDataStore>,
}

impl SafetyRules {
    /// Resume from `store`, or start from genesis when it is empty.
    pub fn new(store: Arc<dyn SafetyDataStore>) -> CertifyResult<Self> {
        let data = store.load()?.unwrap_or_default();
        debug!(
            highest_voted_view = data.highest_voted_view,
            locked_view = data.locked_qc.view,
            "safety rules loaded"
        );
        Ok(Self {
            state: Mutex::new(data),
            store,
        })
    }

    /// Decide whether the local replica may vote for `block` at `view`, and
    /// record the vote if so.
    pub fn can_vote(&self, block: &Block, view: ViewNumber) -> CertifyResult<()> {
        let mut state = self.state.lock();
        if view <= state.highest_voted_view {
            return Err(CertifyError::AlreadyVoted {
                view,
                highest_voted_view: state.highest_voted_view,
            });
        }
        if block.view() != view {
            return Err(CertifyError::ViewMismatch {
                expected: view,
                got: block.view(),
            });
        }
        if block.parent_qc().view < state.locked_qc.view {
            return Err(CertifyError::UnsafeExtension {
                parent_qc_view: block.parent_qc().view,
                locked_view: state.locked_qc.view,
            });
        }

        let mut next = state.clone();
        next.highest_voted_view = view;
        if block.parent_qc().view > next.highest_qc_seen.view {
            next.highest_qc_seen = block.parent_qc().clone();
        }
        Self::commit(&mut state, next, self.store.as_ref())
    }

    /// Decide whether the local replica may time out at `view`, and record
    /// the timeout if so.
    ///
    /// Timing out in a view the replica already voted in is allowed; voting
    /// in a view after timing out in it is not.
    pub fn can_timeout(&self, view: ViewNumber) -> CertifyResult<()> {
        let mut state = self.state.lock();
        if view < state.highest_voted_view {
            return Err(CertifyError::AlreadyVoted {
                view,
                highest_voted_view: state.highest_voted_view,
            });
        }
        if view <= state.last_timeout_view {
            return Err(CertifyError::AlreadyTimedOut { view });
        }

        let mut next = state.clone();
        next.last_timeout_view = view;
        next.highest_voted_view = view;
        Self::commit(&mut state, next, self.store.as_ref())
    }

    /// Record that `block` was certified or proposed on top of its parent QC:
    /// the parent QC becomes a lock candidate.
    pub fn observe_certified_block(&self, block: &Block) -> CertifyResult<()> {
        self.observe(block.parent_qc(), true)
    }

    /// Track the newest QC without touching the lock.
    pub fn observe_qc(&self, qc: &QuorumCertificate) -> CertifyResult<()> {
        self.observe(qc, false)
    }

    fn observe(&self, qc: &QuorumCertificate, lock: bool) -> CertifyResult<()> {
        let mut state = self.state.lock();
        let raise_lock = lock && qc.view > state.locked_qc.view;
        let raise_seen = qc.view > state.highest_qc_seen.view;
        if !raise_lock && !raise_seen {
            return Ok(());
        }

        let mut next = state.clone();
        if raise_lock {
            next.locked_qc = qc.clone();
        }
        if raise_seen {
            next.highest_qc_seen = qc.clone();
        }
        Self::commit(&mut state, next, self.store.as_ref())
    }

    /// Persist `next` and install it; on failure the in-memory state is left
    /// untouched.
    fn commit(
        state: &mut SafetyData,
        next: SafetyData,
        store: &dyn SafetyDataStore,
    ) -> CertifyResult<()> {
        if let Err(e) = store.store(&next) {
            error!(error = %e, "failed to persist safety data");
            return Err(match e {
                CertifyError::Persistence(_) => e,
                other => CertifyError::Persistence(other.to_string()),
            });
        }
        *state = next;
        Ok(())
    }

    /// Check [`Self::can_vote`] and sign the vote.
    pub fn produce_vote(&self, signer: &dyn Signer, block: &Block) -> CertifyResult<Vote> {
        self.can_vote(block, block.view())?;
        sign_vote(signer, block.view(), block.id())
    }

    /// Check [`Self::can_timeout`] and sign the timeout.
    pub fn produce_timeout(
        &self,
        signer: &dyn Signer,
        view: ViewNumber,
        newest_qc: QuorumCertificate,
        last_view_tc: Option<TimeoutCertificate>,
    ) -> CertifyResult<TimeoutObject> {
        self.can_timeout(view)?;
        sign_timeout(signer, view, newest_qc, last_view_tc)
    }

    pub fn data(&self) -> SafetyData {
        self.state.lock().clone()
    }

    pub fn highest_voted_view(&self) -> ViewNumber {
        self.state.lock().highest_voted_view
    }

    pub fn locked_qc(&self) -> QuorumCertificate {
        self.state.lock().locked_qc.clone()
    }

    pub fn highest_qc_seen(&self) -> QuorumCertificate {
        self.state.lock().highest_qc_seen.clone()
    }
}

impl std::fmt::Debug for SafetyRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyRules").field("state", &*self.state.lock()).finish()
    }
}
