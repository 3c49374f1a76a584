//! Typed loop events.
//!
//! The set of event kinds is closed; every kind carries a concrete payload.
//! Events serialize as `{"type": "<kind>", "payload": {...}}`.

use crate::types::{LoopRecord, ProgressSnapshot, SpecRecord, SteeringQuestion, SummaryRecord};
use serde::{Deserialize, Serialize};

/// Event kind names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LoopUpdated,
    LoopRemoved,
    ProgressUpdated,
    SteeringUpdated,
    SummaryUpdated,
    SpecCreated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopUpdated => "loop_updated",
            Self::LoopRemoved => "loop_removed",
            Self::ProgressUpdated => "progress_updated",
            Self::SteeringUpdated => "steering_updated",
            Self::SummaryUpdated => "summary_updated",
            Self::SpecCreated => "spec_created",
        }
    }

    /// Room-scoped events go only to observers that joined the task.
    pub fn is_room_scoped(&self) -> bool {
        matches!(
            self,
            Self::ProgressUpdated | Self::SteeringUpdated | Self::SummaryUpdated
        )
    }
}

/// Payload for `loop_removed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRemovedPayload {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LoopEvent {
    LoopUpdated(LoopRecord),
    LoopRemoved(LoopRemovedPayload),
    ProgressUpdated(ProgressSnapshot),
    SteeringUpdated(SteeringQuestion),
    SummaryUpdated(SummaryRecord),
    SpecCreated(SpecRecord),
}

impl LoopEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LoopUpdated(_) => EventKind::LoopUpdated,
            Self::LoopRemoved(_) => EventKind::LoopRemoved,
            Self::ProgressUpdated(_) => EventKind::ProgressUpdated,
            Self::SteeringUpdated(_) => EventKind::SteeringUpdated,
            Self::SummaryUpdated(_) => EventKind::SummaryUpdated,
            Self::SpecCreated(_) => EventKind::SpecCreated,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::LoopUpdated(record) => &record.task_id,
            Self::LoopRemoved(payload) => &payload.task_id,
            Self::ProgressUpdated(progress) => &progress.task_id,
            Self::SteeringUpdated(question) => &question.task_id,
            Self::SummaryUpdated(summary) => &summary.task_id,
            Self::SpecCreated(spec) => &spec.task_id,
        }
    }

    pub fn removed(task_id: impl Into<String>) -> Self {
        Self::LoopRemoved(LoopRemovedPayload {
            task_id: task_id.into(),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = LoopEvent::removed("t1");
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "loop_removed");
        assert_eq!(json["payload"]["task_id"], "t1");
    }

    #[test]
    fn kind_names_match_serde_tags() {
        let event = LoopEvent::removed("t1");
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind().as_str());
    }

    #[test]
    fn room_scoping() {
        assert!(EventKind::ProgressUpdated.is_room_scoped());
        assert!(EventKind::SteeringUpdated.is_room_scoped());
        assert!(EventKind::SummaryUpdated.is_room_scoped());
        assert!(!EventKind::LoopUpdated.is_room_scoped());
        assert!(!EventKind::LoopRemoved.is_room_scoped());
        assert!(!EventKind::SpecCreated.is_room_scoped());
    }

    #[test]
    fn task_id_is_extracted_from_payload() {
        assert_eq!(LoopEvent::removed("abc").task_id(), "abc");
    }
}
