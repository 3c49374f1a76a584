//! Core types for the loop monitor.
//!
//! Every record here is derived from artifacts written by an external agent
//! loop; nothing is persisted by the monitor itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default iteration cap when a spec does not declare one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Maximum length (in characters) of a spec summary.
pub const SPEC_SUMMARY_MAX_CHARS: usize = 200;

// --- Enumerations ---

/// How the loop is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// One long-lived agent session with a frontmatter state artifact.
    Persistent,
    /// A fresh agent per iteration, observable only through its logs.
    Fresh,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Fresh => "fresh",
        }
    }
}

/// Whether the loop pauses for human steering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Yolo,
    Review,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yolo => "yolo",
            Self::Review => "review",
        }
    }

    /// Parse a mode string; unknown values fall back to `Yolo`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "review" => Self::Review,
            _ => Self::Yolo,
        }
    }
}

/// Derived loop lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Completed,
    Cancelled,
    MaxReached,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::MaxReached => "max_reached",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Steering state merged into a loop record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringStatus {
    #[default]
    None,
    Pending,
    Answered,
}

impl SteeringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Answered => "answered",
        }
    }
}

/// Status of a single steering question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
        }
    }
}

impl From<QuestionStatus> for SteeringStatus {
    fn from(status: QuestionStatus) -> Self {
        match status {
            QuestionStatus::Pending => Self::Pending,
            QuestionStatus::Answered => Self::Answered,
        }
    }
}

/// Outcome reported by a loop summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "complete" | "completed" => Self::Success,
            "failure" | "failed" | "error" => Self::Failure,
            "partial" => Self::Partial,
            _ => Self::Unknown,
        }
    }
}

// --- Records ---

/// One reconciled view of a loop. Exactly one per task id per snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRecord {
    pub task_id: String,
    pub loop_type: LoopType,
    pub iteration: u32,
    /// `0` means unlimited.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub mode: LoopMode,
    pub started_at: DateTime<Utc>,
    pub status: LoopStatus,
    /// Present only for persistent loops.
    pub state_path: Option<PathBuf>,
    pub progress_path: PathBuf,
    pub steering_path: PathBuf,
    pub steering_status: SteeringStatus,
    /// Present only for fresh loops.
    pub logs_dir: Option<PathBuf>,
    pub spec: Option<SpecRecord>,
}

/// A task definition written before the loop starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecRecord {
    pub task_id: String,
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub mode: LoopMode,
    pub body: String,
    /// At most [`SPEC_SUMMARY_MAX_CHARS`] characters.
    pub summary: String,
    pub source_path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
}

/// A question the loop raised for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringQuestion {
    pub task_id: String,
    pub status: QuestionStatus,
    pub iteration: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub question: String,
    pub context: Option<String>,
    pub options: Vec<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub content: String,
    pub summary: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub task_id: String,
    pub content: String,
    pub outcome: Outcome,
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&LoopStatus::MaxReached).unwrap(),
            "\"max_reached\""
        );
        assert_eq!(
            serde_json::to_string(&LoopType::Persistent).unwrap(),
            "\"persistent\""
        );
        assert_eq!(
            serde_json::to_string(&SteeringStatus::None).unwrap(),
            "\"none\""
        );
    }

    #[test]
    fn as_str_matches_serde() {
        for status in [
            LoopStatus::Running,
            LoopStatus::Completed,
            LoopStatus::Cancelled,
            LoopStatus::MaxReached,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
        }
    }

    #[test]
    fn mode_parse_defaults_to_yolo() {
        assert_eq!(LoopMode::parse("review"), LoopMode::Review);
        assert_eq!(LoopMode::parse(" REVIEW "), LoopMode::Review);
        assert_eq!(LoopMode::parse("whatever"), LoopMode::Yolo);
    }

    #[test]
    fn outcome_parse_accepts_synonyms() {
        assert_eq!(Outcome::parse("Succeeded"), Outcome::Success);
        assert_eq!(Outcome::parse("failed"), Outcome::Failure);
        assert_eq!(Outcome::parse("partial"), Outcome::Partial);
        assert_eq!(Outcome::parse("?"), Outcome::Unknown);
    }

    #[test]
    fn question_status_maps_to_steering_status() {
        assert_eq!(
            SteeringStatus::from(QuestionStatus::Pending),
            SteeringStatus::Pending
        );
        assert_eq!(
            SteeringStatus::from(QuestionStatus::Answered),
            SteeringStatus::Answered
        );
    }
}
