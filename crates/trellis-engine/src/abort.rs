use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trellis_core::error::Result;
use trellis_core::signal::AbortSignal;
use trellis_core::types::{Checkpoint, StateId};

/// Snapshot of the controller's cancellation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortState {
    pub aborted: bool,
    pub reason: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Latest checkpoint id known when the abort fired.
    pub checkpoint: Option<String>,
}

/// Which checkpoint a resume should start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    /// Latest checkpoint this controller has seen.
    Latest,
    /// Latest checkpoint for a state, looked up in persistence when the
    /// local index has nothing for it.
    LatestOf(StateId),
    Id(String),
}

#[derive(Default)]
struct CheckpointIndex {
    by_id: HashMap<String, Checkpoint>,
    latest: Option<String>,
}

struct Inner {
    signal: AbortSignal,
    checkpoint_at_abort: Option<String>,
    index: CheckpointIndex,
}

/// Cooperative cancellation for one run at a time, plus the local index of
/// checkpoints that run produced.
pub struct AbortController {
    inner: Mutex<Inner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                signal: AbortSignal::new(),
                checkpoint_at_abort: None,
                index: CheckpointIndex::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel the current run. Only the first call after a reset has any
    /// effect; returns whether this call was it.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut inner = self.lock();
        let reason = reason.into();
        if !inner.signal.abort(reason.clone()) {
            debug!(reason = %reason, "Abort already requested, ignoring");
            return false;
        }
        inner.checkpoint_at_abort = inner.index.latest.clone();
        info!(reason = %reason, checkpoint = ?inner.checkpoint_at_abort, "Run aborted");
        true
    }

    /// Issue a fresh signal. Required before re-running after an abort.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.signal = AbortSignal::new();
        inner.checkpoint_at_abort = None;
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().signal.is_aborted()
    }

    pub fn state(&self) -> AbortState {
        let inner = self.lock();
        AbortState {
            aborted: inner.signal.is_aborted(),
            reason: inner.signal.reason(),
            timestamp: inner.signal.aborted_at(),
            checkpoint: inner.checkpoint_at_abort.clone(),
        }
    }

    /// The signal for the current run, handed to nodes.
    pub fn signal(&self) -> AbortSignal {
        self.lock().signal.clone()
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        self.signal().throw_if_aborted()
    }

    /// Race `task` against cancellation.
    ///
    /// Whichever side loses is dropped when this returns, so nothing stays
    /// registered on the signal.
    pub async fn wrap_with_abort<T, F>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let signal = self.signal();
        signal.throw_if_aborted()?;
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(signal.to_error()),
            result = task => result,
        }
    }

    pub fn register_checkpoint(&self, checkpoint: Checkpoint) {
        let mut inner = self.lock();
        inner.index.latest = Some(checkpoint.id.clone());
        inner.index.by_id.insert(checkpoint.id.clone(), checkpoint);
    }

    pub fn checkpoint(&self, target: &ResumeTarget) -> Option<Checkpoint> {
        let inner = self.lock();
        match target {
            ResumeTarget::Latest => {
                let id = inner.index.latest.as_ref()?;
                inner.index.by_id.get(id).cloned()
            }
            ResumeTarget::LatestOf(state_id) => {
                let id = inner.index.latest.as_ref()?;
                inner
                    .index
                    .by_id
                    .get(id)
                    .filter(|c| &c.state_id == state_id)
                    .cloned()
            }
            ResumeTarget::Id(id) => inner.index.by_id.get(id).cloned(),
        }
    }

    pub fn latest_checkpoint_id(&self) -> Option<String> {
        self.lock().index.latest.clone()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
