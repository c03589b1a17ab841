use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::{SpecState, StateTransition};
use super::ws::{WsMessage, broadcast_message};
use crate::errors::FactoryError;

/// Validated, audited state changes for game specs.
///
/// Every transition is a compare-and-set against the state it records as
/// `state_before`, so each spec's audit trail forms an unbroken chain.
#[derive(Clone)]
pub struct StateTracker {
    db: DbHandle,
    ws_tx: broadcast::Sender<String>,
}

impl StateTracker {
    pub fn new(db: DbHandle, ws_tx: broadcast::Sender<String>) -> Self {
        Self { db, ws_tx }
    }

    /// Transition by label, as received from the outside world.
    pub async fn transition(
        &self,
        spec_id: &str,
        new_state: &str,
        detail: Option<&str>,
    ) -> Result<StateTransition, FactoryError> {
        let next: SpecState = new_state.parse().map_err(FactoryError::InvalidInput)?;
        self.transition_to(spec_id, next, detail).await
    }

    pub async fn transition_to(
        &self,
        spec_id: &str,
        next: SpecState,
        detail: Option<&str>,
    ) -> Result<StateTransition, FactoryError> {
        let current = self.current(spec_id).await?;
        if !current.can_transition_to(next) {
            return Err(FactoryError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        let id = spec_id.to_string();
        let detail_owned = detail.map(str::to_string);
        let record = self
            .db
            .call(move |db| db.compare_and_set_state(&id, current, next, detail_owned.as_deref()))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| {
                FactoryError::Conflict(format!(
                    "spec {} left state {} before the transition to {} was applied",
                    spec_id, current, next
                ))
            })?;

        tracing::info!(
            spec_id,
            from = %current,
            to = %next,
            detail = detail.unwrap_or(""),
            "Spec state changed"
        );
        broadcast_message(
            &self.ws_tx,
            &WsMessage::SpecStateChanged {
                spec_id: spec_id.to_string(),
                transition: record.clone(),
            },
        );
        Ok(record)
    }

    /// Like [`transition_to`](Self::transition_to), but returns `Ok(None)`
    /// without writing anything when the spec is already in `next`.
    pub async fn advance_to(
        &self,
        spec_id: &str,
        next: SpecState,
        detail: &str,
    ) -> Result<Option<StateTransition>, FactoryError> {
        if self.current(spec_id).await? == next {
            return Ok(None);
        }
        self.transition_to(spec_id, next, Some(detail)).await.map(Some)
    }

    pub async fn current(&self, spec_id: &str) -> Result<SpecState, FactoryError> {
        let id = spec_id.to_string();
        self.db
            .call(move |db| db.get_spec_state(&id))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| FactoryError::not_found("Game spec", spec_id))
    }

    /// Audit trail, oldest first.
    pub async fn history(&self, spec_id: &str) -> Result<Vec<StateTransition>, FactoryError> {
        let id = spec_id.to_string();
        let logs = self
            .db
            .call(move |db| {
                if db.get_spec_state(&id)?.is_none() {
                    return Ok(None);
                }
                db.get_state_logs(&id).map(Some)
            })
            .await
            .map_err(FactoryError::Database)?;
        logs.ok_or_else(|| FactoryError::not_found("Game spec", spec_id))
    }
}
