use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TrellisError};

#[derive(Debug, Default)]
struct AbortRecord {
    reason: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// One-shot cancellation handle shared between a run and its nodes.
///
/// The first `abort` records its reason and cancels the token; later calls
/// are no-ops. A fired signal is never reset; the owner replaces it instead.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    record: Arc<Mutex<AbortRecord>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns false if it had already fired.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        {
            let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
            if record.reason.is_some() {
                return false;
            }
            record.reason = Some(reason.into());
            record.timestamp = Some(Utc::now());
        }
        self.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reason
            .clone()
    }

    pub fn aborted_at(&self) -> Option<DateTime<Utc>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner()).timestamp
    }

    /// Synchronous guard for cooperative suspension points.
    pub fn throw_if_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(self.to_error())
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The error surfaced to callers once this signal has fired.
    pub fn to_error(&self) -> TrellisError {
        TrellisError::Aborted {
            reason: self.reason().unwrap_or_else(|| "aborted".to_string()),
        }
    }
}
