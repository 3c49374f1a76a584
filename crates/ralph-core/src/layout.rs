//! Artifact naming convention.
//!
//! All artifacts for every task live directly under one artifact root:
//!
//! ```text
//! ralph-loop-<task>.local.md           persistent loop state
//! ralph-spec-<task>.md                 task spec
//! ralph-progress-<task>.md             progress notes
//! ralph-steering-<task>.md             steering question
//! ralph-summary-<task>.md              final summary
//! ralph-logs-<task>/iteration-<n>.log  fresh-mode iteration logs
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOOP_PREFIX: &str = "ralph-loop-";
const LOOP_SUFFIX: &str = ".local.md";
const SPEC_PREFIX: &str = "ralph-spec-";
const PROGRESS_PREFIX: &str = "ralph-progress-";
const STEERING_PREFIX: &str = "ralph-steering-";
const SUMMARY_PREFIX: &str = "ralph-summary-";
const LOGS_PREFIX: &str = "ralph-logs-";
const MD_SUFFIX: &str = ".md";
const ITERATION_PREFIX: &str = "iteration-";
const LOG_SUFFIX: &str = ".log";

/// Kind of artifact a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    LoopState,
    Spec,
    Progress,
    Steering,
    Summary,
    IterationLog,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopState => "loop_state",
            Self::Spec => "spec",
            Self::Progress => "progress",
            Self::Steering => "steering",
            Self::Summary => "summary",
            Self::IterationLog => "iteration_log",
        }
    }
}

/// A path resolved against the naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedPath {
    pub kind: ArtifactKind,
    pub task_id: String,
    /// Iteration number, for iteration logs only.
    pub iteration: Option<u32>,
}

/// Builds and recognizes artifact paths below one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{LOOP_PREFIX}{task_id}{LOOP_SUFFIX}"))
    }

    pub fn spec_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{SPEC_PREFIX}{task_id}{MD_SUFFIX}"))
    }

    pub fn progress_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{PROGRESS_PREFIX}{task_id}{MD_SUFFIX}"))
    }

    pub fn steering_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{STEERING_PREFIX}{task_id}{MD_SUFFIX}"))
    }

    pub fn summary_path(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{SUMMARY_PREFIX}{task_id}{MD_SUFFIX}"))
    }

    pub fn logs_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{LOGS_PREFIX}{task_id}"))
    }

    pub fn iteration_log_path(&self, task_id: &str, iteration: u32) -> PathBuf {
        self.logs_dir(task_id)
            .join(format!("{ITERATION_PREFIX}{iteration}{LOG_SUFFIX}"))
    }

    /// Glob pattern matching every artifact of `kind`.
    pub fn pattern(&self, kind: ArtifactKind) -> String {
        let name = match kind {
            ArtifactKind::LoopState => format!("{LOOP_PREFIX}*{LOOP_SUFFIX}"),
            ArtifactKind::Spec => format!("{SPEC_PREFIX}*{MD_SUFFIX}"),
            ArtifactKind::Progress => format!("{PROGRESS_PREFIX}*{MD_SUFFIX}"),
            ArtifactKind::Steering => format!("{STEERING_PREFIX}*{MD_SUFFIX}"),
            ArtifactKind::Summary => format!("{SUMMARY_PREFIX}*{MD_SUFFIX}"),
            ArtifactKind::IterationLog => {
                format!("{LOGS_PREFIX}*/{ITERATION_PREFIX}*{LOG_SUFFIX}")
            }
        };
        format!("{}/{name}", self.root.display())
    }

    /// Glob pattern matching the iteration logs of one task.
    pub fn iteration_log_pattern(&self, task_id: &str) -> String {
        format!(
            "{}/{ITERATION_PREFIX}*{LOG_SUFFIX}",
            self.logs_dir(task_id).display()
        )
    }

    /// Recognize `path` as an artifact under this root.
    ///
    /// Returns `None` for anything outside the root, unrelated files, and
    /// names whose task id would be empty.
    pub fn classify(&self, path: &Path) -> Option<ClassifiedPath> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let first = components.next()?.as_os_str().to_str()?;

        match (components.next(), components.next()) {
            (None, _) => classify_file_name(first),
            (Some(second), None) => {
                let task_id = non_empty(first.strip_prefix(LOGS_PREFIX)?)?;
                let iteration = parse_iteration_file_name(second.as_os_str().to_str()?)?;
                Some(ClassifiedPath {
                    kind: ArtifactKind::IterationLog,
                    task_id: task_id.to_string(),
                    iteration: Some(iteration),
                })
            }
            _ => None,
        }
    }
}

fn classify_file_name(name: &str) -> Option<ClassifiedPath> {
    let (kind, task_id) = if let Some(rest) = name.strip_prefix(LOOP_PREFIX) {
        (ArtifactKind::LoopState, rest.strip_suffix(LOOP_SUFFIX)?)
    } else if let Some(rest) = name.strip_prefix(SPEC_PREFIX) {
        (ArtifactKind::Spec, rest.strip_suffix(MD_SUFFIX)?)
    } else if let Some(rest) = name.strip_prefix(PROGRESS_PREFIX) {
        (ArtifactKind::Progress, rest.strip_suffix(MD_SUFFIX)?)
    } else if let Some(rest) = name.strip_prefix(STEERING_PREFIX) {
        (ArtifactKind::Steering, rest.strip_suffix(MD_SUFFIX)?)
    } else if let Some(rest) = name.strip_prefix(SUMMARY_PREFIX) {
        (ArtifactKind::Summary, rest.strip_suffix(MD_SUFFIX)?)
    } else {
        return None;
    };

    Some(ClassifiedPath {
        kind,
        task_id: non_empty(task_id)?.to_string(),
        iteration: None,
    })
}

/// Iteration number from an `iteration-<n>.log` file name.
pub fn parse_iteration_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(ITERATION_PREFIX)?
        .strip_suffix(LOG_SUFFIX)?
        .parse()
        .ok()
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
