//! Webhook ingress: typed worker events and their handlers.
//!
//! Handlers are re-entrant and carry no in-process guard. Persistence errors
//! propagate to the caller so the worker sees a failed delivery and can
//! retry it.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::dispatcher::Dispatcher;
use crate::evaluator::{self, Evaluation};
use crate::model::BatchStatus;
use crate::tracker::{self, Payload};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unknown batch {0}")]
    UnknownBatch(String),
    #[error("unknown unit {0}")]
    UnknownUnit(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// First-stage result for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitResult {
    pub batch_id: String,
    pub user_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReady {
    pub unit_id: String,
    pub user_id: String,
    pub artifact_url: String,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFailed {
    pub batch_id: String,
    pub error_message: String,
    pub user_id: String,
}

/// Second-stage events as posted by the audio worker, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioEvent {
    ArtifactReady(ArtifactReady),
    ArtifactFailed(ArtifactFailed),
}

/// The closed set of events the engine accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngressEvent {
    UnitResult(UnitResult),
    ArtifactReady(ArtifactReady),
    ArtifactFailed(ArtifactFailed),
}

impl From<AudioEvent> for IngressEvent {
    fn from(ev: AudioEvent) -> Self {
        match ev {
            AudioEvent::ArtifactReady(e) => IngressEvent::ArtifactReady(e),
            AudioEvent::ArtifactFailed(e) => IngressEvent::ArtifactFailed(e),
        }
    }
}

fn require(field: &'static str, value: &str) -> Result<(), IngressError> {
    if value.trim().is_empty() {
        return Err(IngressError::Malformed(format!("{} must be non-empty", field)));
    }
    Ok(())
}

impl UnitResult {
    pub fn validate(&self) -> Result<(), IngressError> {
        require("batchId", &self.batch_id)?;
        require("userId", &self.user_id)?;
        require("content", &self.content)
    }
}

impl ArtifactReady {
    pub fn validate(&self) -> Result<(), IngressError> {
        require("unitId", &self.unit_id)?;
        require("userId", &self.user_id)?;
        require("artifactUrl", &self.artifact_url)?;
        if let Some(batch_id) = &self.batch_id {
            require("batchId", batch_id)?;
        }
        Ok(())
    }
}

impl ArtifactFailed {
    pub fn validate(&self) -> Result<(), IngressError> {
        require("batchId", &self.batch_id)?;
        require("userId", &self.user_id)?;
        require("errorMessage", &self.error_message)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitAck {
    pub unit_id: String,
    pub created: bool,
    pub late_dispatch: bool,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactAck {
    pub batch_id: String,
    pub flagged: bool,
    pub batch_completed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAck {
    pub batch_id: String,
    pub previous_status: Option<BatchStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Ack {
    Unit(UnitAck),
    Artifact(ArtifactAck),
    Failure(FailureAck),
}

pub async fn handle_event(
    pool: &Pool,
    dispatcher: &Dispatcher,
    event: IngressEvent,
) -> Result<Ack, IngressError> {
    match event {
        IngressEvent::UnitResult(ev) => handle_unit_result(pool, dispatcher, ev).await.map(Ack::Unit),
        IngressEvent::ArtifactReady(ev) => handle_artifact_ready(pool, ev).await.map(Ack::Artifact),
        IngressEvent::ArtifactFailed(ev) => handle_artifact_failed(pool, ev).await.map(Ack::Failure),
    }
}

/// Persist a first-stage result and run the completion evaluator.
#[instrument(skip_all, fields(batch_id = %ev.batch_id, user_id = %ev.user_id))]
pub async fn handle_unit_result(
    pool: &Pool,
    dispatcher: &Dispatcher,
    ev: UnitResult,
) -> Result<UnitAck, IngressError> {
    ev.validate()?;
    if db::fetch_batch_status(pool, &ev.batch_id).await?.is_none() {
        return Err(IngressError::UnknownBatch(ev.batch_id));
    }

    let (unit_id, created) =
        db::upsert_unit(pool, &ev.batch_id, &ev.user_id, &ev.content, Utc::now()).await?;
    if !created {
        info!(unit_id = %unit_id, "duplicate unit result; content refreshed");
    }

    let evaluation = evaluator::evaluate(pool, dispatcher, &ev.batch_id).await?;

    // A unit that lands after the batch was dispatched as a whole would never
    // be picked up by a threshold pass.
    let mut late_dispatch = false;
    match db::fetch_batch_status(pool, &ev.batch_id).await? {
        Some(BatchStatus::Complete | BatchStatus::AudioRequested) => {
            if let Some(unit) = db::fetch_unit(pool, &unit_id).await? {
                late_dispatch = dispatcher.dispatch_unit(&unit).await?;
            }
        }
        Some(status) if status.is_terminal() => {
            warn!(unit_id = %unit_id, %status, "unit arrived for a finished batch; kept without audio");
        }
        _ => {}
    }

    Ok(UnitAck {
        unit_id,
        created,
        late_dispatch,
        evaluation,
    })
}

/// Flag a unit's artifact and re-check whether the whole batch has its audio.
#[instrument(skip_all, fields(unit_id = %ev.unit_id))]
pub async fn handle_artifact_ready(pool: &Pool, ev: ArtifactReady) -> Result<ArtifactAck, IngressError> {
    ev.validate()?;
    let unit = db::fetch_unit(pool, &ev.unit_id)
        .await?
        .ok_or_else(|| IngressError::UnknownUnit(ev.unit_id.clone()))?;
    if let Some(batch_id) = &ev.batch_id {
        if batch_id != &unit.batch_id {
            return Err(IngressError::Malformed(format!(
                "unit {} belongs to batch {}, not {}",
                unit.unit_id, unit.batch_id, batch_id
            )));
        }
    }
    if ev.user_id != unit.user_id {
        return Err(IngressError::Malformed(format!(
            "unit {} belongs to user {}, not {}",
            unit.unit_id, unit.user_id, ev.user_id
        )));
    }

    let flagged = db::mark_artifact_ready(pool, &unit.unit_id, &ev.artifact_url, Utc::now()).await?;
    if !flagged {
        info!("artifact already recorded for unit");
    }
    let batch_completed =
        evaluator::check_audio_completion(pool, &unit.batch_id, Some(&ev.artifact_url)).await?;
    Ok(ArtifactAck {
        batch_id: unit.batch_id,
        flagged,
        batch_completed,
    })
}

/// A permanent second-stage failure fails the batch. Repeated reports
/// overwrite the reason; only `audio_complete` is final.
#[instrument(skip_all, fields(batch_id = %ev.batch_id, user_id = %ev.user_id))]
pub async fn handle_artifact_failed(pool: &Pool, ev: ArtifactFailed) -> Result<FailureAck, IngressError> {
    ev.validate()?;
    if db::fetch_batch_status(pool, &ev.batch_id).await?.is_none() {
        return Err(IngressError::UnknownBatch(ev.batch_id));
    }
    let sources: Vec<BatchStatus> = BatchStatus::ALL
        .into_iter()
        .filter(|s| s.can_transition_to(BatchStatus::AudioFailed))
        .collect();
    let reason = format!("user {}: {}", ev.user_id, ev.error_message);
    let previous = tracker::transition(
        pool,
        &ev.batch_id,
        &sources,
        BatchStatus::AudioFailed,
        Payload {
            audio_url: None,
            failure_reason: Some(&reason),
        },
    )
    .await?;
    if previous.is_none() {
        warn!("artifact failure reported for a batch that already has its audio; ignored");
    }
    Ok(FailureAck {
        batch_id: ev.batch_id,
        previous_status: previous,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audio_events_are_tagged_by_type() {
        let ready: AudioEvent = serde_json::from_value(json!({
            "type": "artifact_ready",
            "unitId": "u-1",
            "userId": "alice",
            "artifactUrl": "https://cdn/a.mp3"
        }))
        .unwrap();
        assert_eq!(
            ready,
            AudioEvent::ArtifactReady(ArtifactReady {
                unit_id: "u-1".into(),
                user_id: "alice".into(),
                artifact_url: "https://cdn/a.mp3".into(),
                batch_id: None,
            })
        );

        let failed: AudioEvent = serde_json::from_value(json!({
            "type": "artifact_failed",
            "batchId": "b1",
            "userId": "alice",
            "errorMessage": "voice model unavailable"
        }))
        .unwrap();
        assert!(matches!(failed, AudioEvent::ArtifactFailed(_)));
    }

    #[test]
    fn missing_fields_and_unknown_types_are_rejected() {
        let missing = serde_json::from_value::<AudioEvent>(json!({
            "type": "artifact_ready",
            "unitId": "u-1"
        }));
        assert!(missing.is_err());

        let unknown = serde_json::from_value::<IngressEvent>(json!({
            "type": "something_else",
            "batchId": "b1"
        }));
        assert!(unknown.is_err());
    }

    #[test]
    fn blank_fields_fail_validation() {
        let ev = UnitResult {
            batch_id: "b1".into(),
            user_id: " ".into(),
            content: "text".into(),
        };
        match ev.validate() {
            Err(IngressError::Malformed(msg)) => assert!(msg.contains("userId")),
            other => panic!("unexpected {:?}", other),
        }

        let ev = ArtifactReady {
            unit_id: "u".into(),
            user_id: "a".into(),
            artifact_url: "https://cdn/x".into(),
            batch_id: Some("".into()),
        };
        assert!(matches!(ev.validate(), Err(IngressError::Malformed(_))));
    }
}
