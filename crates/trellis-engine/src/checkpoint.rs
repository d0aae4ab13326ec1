use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EmitOptions, EventStatus, EventStream, EventType};
use trellis_core::hooks::HookSet;
use trellis_core::traits::PersistenceAdapter;
use trellis_core::types::{Checkpoint, State, StateId, Transition};

/// Builds checkpoints and hands them to the persistence collaborator.
///
/// Without a collaborator, saving is a silent no-op and loading always
/// fails with `CheckpointNotFound`.
pub struct CheckpointManager {
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    events: Arc<EventStream>,
}

impl CheckpointManager {
    pub fn new(persistence: Option<Arc<dyn PersistenceAdapter>>, events: Arc<EventStream>) -> Self {
        Self { persistence, events }
    }

    pub fn is_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    /// Persist `state` with its loop position.
    pub async fn save(
        &self,
        state: &State,
        step: usize,
        node_id: &str,
        pending: Option<Transition>,
        hooks: &HookSet,
    ) -> Result<Option<Checkpoint>> {
        let Some(persistence) = &self.persistence else {
            return Ok(None);
        };

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            state_id: state.id.clone(),
            state: state.clone(),
            event_index: self.events.cursor(),
            timestamp: Utc::now(),
            step,
            node_id: node_id.to_string(),
            pending,
        };

        persistence.save_checkpoint(&checkpoint).await?;

        debug!(checkpoint_id = %checkpoint.id, step, node_id = %node_id, "Checkpoint saved");
        self.events.emit(
            EventType::Checkpoint,
            EventStatus::Success,
            format!("Checkpoint saved at step {}", step),
            EmitOptions::node(node_id).with_metadata(serde_json::json!({
                "checkpoint_id": checkpoint.id,
                "step": step,
                "event_index": checkpoint.event_index,
            })),
        );
        hooks.checkpoint(&checkpoint);

        Ok(Some(checkpoint))
    }

    pub async fn load(&self, id: &str) -> Result<Checkpoint> {
        let Some(persistence) = &self.persistence else {
            return Err(TrellisError::CheckpointNotFound(format!(
                "{} (no persistence configured)",
                id
            )));
        };
        let checkpoint = persistence
            .load_checkpoint(id)
            .await?
            .ok_or_else(|| TrellisError::CheckpointNotFound(id.to_string()))?;
        info!(checkpoint_id = %id, step = checkpoint.step, "Checkpoint loaded");
        Ok(checkpoint)
    }

    pub async fn list(&self, state_id: &StateId) -> Result<Vec<Checkpoint>> {
        match &self.persistence {
            Some(p) => p.list_checkpoints(state_id).await,
            None => Ok(vec![]),
        }
    }

    /// Most recent checkpoint persisted for `state_id`, if any.
    pub async fn latest(&self, state_id: &StateId) -> Result<Option<Checkpoint>> {
        let latest = self.list(state_id).await?.pop();
        if let Some(checkpoint) = &latest {
            debug!(checkpoint_id = %checkpoint.id, step = checkpoint.step, "Latest persisted checkpoint found");
        }
        Ok(latest)
    }

    /// Administrative removal; never called by the runner.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match &self.persistence {
            Some(p) => p.delete_checkpoint(id).await,
            None => Err(TrellisError::Persistence(
                "no persistence configured".to_string(),
            )),
        }
    }
}
