//! Loop-state reconciliation.
//!
//! There is no authoritative record of which loops exist. The reconciler
//! derives one from whatever artifacts the agent left behind:
//!
//! - a persistent loop owns a `ralph-loop-<task>.local.md` state artifact;
//! - a fresh loop has a spec plus a logs directory of `iteration-<n>.log` files.
//!
//! Persistent data always wins over fresh inference for the same task id.
//! A bad artifact for one task is logged and skipped; it never hides others.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use ralph_core::parse::{self, ParseError};
use ralph_core::{
    ArtifactKind, ArtifactLayout, LoopRecord, LoopType, ProgressSnapshot, SpecRecord,
    SteeringQuestion, SteeringStatus, SummaryRecord,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{ArtifactEntry, ArtifactStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

fn parse_err(path: &std::path::Path) -> impl FnOnce(ParseError) -> ReconcileError + '_ {
    move |source| ReconcileError::Parse {
        path: path.to_path_buf(),
        source,
    }
}

/// Derives [`LoopRecord`]s from an [`ArtifactStore`].
#[derive(Clone)]
pub struct LoopReconciler {
    store: Arc<dyn ArtifactStore>,
    stale_after: Duration,
}

impl std::fmt::Debug for LoopReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopReconciler")
            .field("root", &self.layout().root())
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl LoopReconciler {
    pub fn new(store: Arc<dyn ArtifactStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        self.store.layout()
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Every loop the artifacts justify, newest first.
    pub async fn list_loops(&self) -> Vec<LoopRecord> {
        self.list_loops_at(Utc::now()).await
    }

    /// [`LoopReconciler::list_loops`] against an explicit clock.
    pub async fn list_loops_at(&self, now: DateTime<Utc>) -> Vec<LoopRecord> {
        let layout = self.layout();
        let state_entries = self.list_kind(ArtifactKind::LoopState).await;
        let spec_entries = self.list_kind(ArtifactKind::Spec).await;
        let steering = self.list_kind(ArtifactKind::Steering).await;

        let state_tasks: HashSet<&str> = state_entries.iter().map(|(id, _)| id.as_str()).collect();

        let persistent = join_all(state_entries.iter().map(|(task_id, entry)| async move {
            match self.persistent_from_entry(task_id, entry).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "skipping loop state");
                    None
                }
            }
        }))
        .await;

        // A state artifact claims the task even when it failed to parse.
        let fresh = join_all(
            spec_entries
                .iter()
                .filter(|(task_id, _)| !state_tasks.contains(task_id.as_str()))
                .map(|(task_id, entry)| async move {
                    match self.fresh_from_spec_entry(task_id, entry, now).await {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "skipping fresh loop");
                            None
                        }
                    }
                }),
        )
        .await;

        let steering_paths: HashMap<&str, &ArtifactEntry> =
            steering.iter().map(|(id, entry)| (id.as_str(), entry)).collect();

        let mut by_task: HashMap<String, LoopRecord> = HashMap::new();
        for record in persistent.into_iter().chain(fresh).flatten() {
            match by_task.get(&record.task_id) {
                Some(existing) if existing.loop_type == LoopType::Persistent => {
                    debug!(task_id = %record.task_id, "duplicate loop record dropped");
                }
                _ => {
                    by_task.insert(record.task_id.clone(), record);
                }
            }
        }

        let mut loops: Vec<LoopRecord> = join_all(by_task.into_values().map(|mut record| {
            let steering_entry = steering_paths.get(record.task_id.as_str()).copied();
            async move {
                record.steering_status = match steering_entry {
                    Some(entry) => self.steering_status_from(&record.task_id, &entry.path).await,
                    None => SteeringStatus::None,
                };
                record
            }
        }))
        .await;

        loops.sort_by(compare_records);
        debug!(root = %layout.root().display(), count = loops.len(), "reconciled loops");
        loops
    }

    /// One loop by task id, with the same precedence as [`LoopReconciler::list_loops`].
    pub async fn get_loop(&self, task_id: &str) -> Option<LoopRecord> {
        self.get_loop_at(task_id, Utc::now()).await
    }

    pub async fn get_loop_at(&self, task_id: &str, now: DateTime<Utc>) -> Option<LoopRecord> {
        if self.has_state(task_id).await {
            return self.resolve_persistent(task_id).await;
        }
        self.resolve_fresh_at(task_id, now).await
    }

    /// Whether a persistent state artifact exists for `task_id`.
    pub async fn has_state(&self, task_id: &str) -> bool {
        let path = self.layout().state_path(task_id);
        match self.store.stat(&path).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to stat loop state");
                false
            }
        }
    }

    /// Persistent record for `task_id`, or `None` if absent or unreadable.
    pub async fn resolve_persistent(&self, task_id: &str) -> Option<LoopRecord> {
        let path = self.layout().state_path(task_id);
        let entry = match self.store.stat(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to stat loop state");
                return None;
            }
        };
        match self.persistent_from_entry(task_id, &entry).await {
            Ok(mut record) => {
                record.steering_status = self.steering_status(task_id).await;
                Some(record)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "skipping loop state");
                None
            }
        }
    }

    /// Fresh-mode record for `task_id`, or `None` if not materialized.
    pub async fn resolve_fresh(&self, task_id: &str) -> Option<LoopRecord> {
        self.resolve_fresh_at(task_id, Utc::now()).await
    }

    pub async fn resolve_fresh_at(&self, task_id: &str, now: DateTime<Utc>) -> Option<LoopRecord> {
        let path = self.layout().spec_path(task_id);
        let entry = match self.store.stat(&path).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to stat spec");
                return None;
            }
        };
        match self.fresh_from_spec_entry(task_id, &entry, now).await {
            Ok(Some(mut record)) => {
                record.steering_status = self.steering_status(task_id).await;
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "skipping fresh loop");
                None
            }
        }
    }

    /// Whether the task already has iteration logs.
    pub async fn has_iteration_logs(&self, task_id: &str) -> bool {
        match self
            .store
            .list(&self.layout().iteration_log_pattern(task_id))
            .await
        {
            Ok(entries) => !entries.is_empty(),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to list iteration logs");
                false
            }
        }
    }

    /// Steering state for `task_id`. Missing or malformed steering is `None`.
    pub async fn steering_status(&self, task_id: &str) -> SteeringStatus {
        let path = self.layout().steering_path(task_id);
        self.steering_status_from(task_id, &path).await
    }

    async fn steering_status_from(&self, task_id: &str, path: &std::path::Path) -> SteeringStatus {
        match self.read_steering(task_id, path).await {
            Ok(Some(question)) => question.status.into(),
            Ok(None) => SteeringStatus::None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "ignoring steering artifact");
                SteeringStatus::None
            }
        }
    }

    pub async fn get_spec(&self, task_id: &str) -> Option<SpecRecord> {
        let path = self.layout().spec_path(task_id);
        self.logged(task_id, "spec", self.read_spec(task_id, &path).await)
    }

    pub async fn get_steering(&self, task_id: &str) -> Option<SteeringQuestion> {
        let path = self.layout().steering_path(task_id);
        self.logged(task_id, "steering", self.read_steering(task_id, &path).await)
    }

    pub async fn get_progress(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let path = self.layout().progress_path(task_id);
        let result = match self.read_with_mtime(&path).await {
            Ok(Some((content, modified))) => parse::parse_progress(task_id, &content, modified)
                .map(Some)
                .map_err(parse_err(&path)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.logged(task_id, "progress", result)
    }

    pub async fn get_summary(&self, task_id: &str) -> Option<SummaryRecord> {
        let path = self.layout().summary_path(task_id);
        let result = match self.read_with_mtime(&path).await {
            Ok(Some((content, modified))) => parse::parse_summary(task_id, &content, modified)
                .map(Some)
                .map_err(parse_err(&path)),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.logged(task_id, "summary", result)
    }

    /// Task ids that have at least one artifact of `kind`.
    pub async fn task_ids(&self, kind: ArtifactKind) -> std::result::Result<HashSet<String>, StoreError> {
        let entries = self.store.list(&self.layout().pattern(kind)).await?;
        Ok(entries
            .iter()
            .filter_map(|e| self.layout().classify(&e.path))
            .filter(|c| c.kind == kind)
            .map(|c| c.task_id)
            .collect())
    }

    // --- internals ---

    async fn list_kind(&self, kind: ArtifactKind) -> Vec<(String, ArtifactEntry)> {
        let layout = self.layout();
        match self.store.list(&layout.pattern(kind)).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|entry| {
                    let classified = layout.classify(&entry.path)?;
                    (classified.kind == kind).then_some((classified.task_id, entry))
                })
                .collect(),
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "failed to list artifacts");
                Vec::new()
            }
        }
    }

    fn logged<T>(&self, task_id: &str, what: &str, result: Result<Option<T>>) -> Option<T> {
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(task_id = %task_id, artifact = what, error = %e, "failed to load artifact");
                None
            }
        }
    }

    /// Content plus modification time; `None` when the artifact is missing.
    async fn read_with_mtime(
        &self,
        path: &std::path::Path,
    ) -> Result<Option<(String, Option<DateTime<Utc>>)>> {
        let Some(entry) = self.store.stat(path).await? else {
            return Ok(None);
        };
        match self.store.read(path).await {
            Ok(content) => Ok(Some((content, Some(entry.modified)))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_optional(&self, path: &std::path::Path) -> Result<Option<String>> {
        match self.store.read(path).await {
            Ok(content) => Ok(Some(content)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_spec(&self, task_id: &str, path: &std::path::Path) -> Result<Option<SpecRecord>> {
        let Some(content) = self.read_optional(path).await? else {
            return Ok(None);
        };
        parse::parse_spec(task_id, &content, path.to_path_buf())
            .map(Some)
            .map_err(parse_err(path))
    }

    async fn read_steering(
        &self,
        task_id: &str,
        path: &std::path::Path,
    ) -> Result<Option<SteeringQuestion>> {
        let Some(content) = self.read_optional(path).await? else {
            return Ok(None);
        };
        parse::parse_steering(task_id, &content)
            .map(Some)
            .map_err(parse_err(path))
    }

    async fn persistent_from_entry(&self, task_id: &str, entry: &ArtifactEntry) -> Result<LoopRecord> {
        let content = self.store.read(&entry.path).await?;
        let state = parse::parse_loop_state(&content).map_err(parse_err(&entry.path))?;
        let spec = self.get_spec(task_id).await;
        let layout = self.layout();

        Ok(LoopRecord {
            task_id: task_id.to_string(),
            loop_type: LoopType::Persistent,
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            status: state.status(),
            completion_promise: state
                .completion_promise
                .clone()
                .or_else(|| spec.as_ref().and_then(|s| s.completion_promise.clone())),
            mode: state.mode,
            started_at: state.started_at.unwrap_or(entry.modified),
            state_path: Some(entry.path.clone()),
            progress_path: layout.progress_path(task_id),
            steering_path: layout.steering_path(task_id),
            steering_status: SteeringStatus::None,
            logs_dir: None,
            spec,
        })
    }

    /// Fresh record from a spec entry; `None` while no iteration log exists.
    async fn fresh_from_spec_entry(
        &self,
        task_id: &str,
        spec_entry: &ArtifactEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<LoopRecord>> {
        let layout = self.layout();
        let logs = self
            .store
            .list(&layout.iteration_log_pattern(task_id))
            .await?;

        let latest = logs
            .iter()
            .filter_map(|entry| {
                let name = entry.path.file_name()?.to_str()?;
                ralph_core::layout::parse_iteration_file_name(name).map(|n| (n, entry))
            })
            .max_by_key(|(n, _)| *n);
        let Some((iteration, latest_log)) = latest else {
            debug!(task_id = %task_id, "spec without iteration logs; not started");
            return Ok(None);
        };

        let content = self.store.read(&spec_entry.path).await?;
        let spec = parse::parse_spec(task_id, &content, spec_entry.path.clone())
            .map_err(parse_err(&spec_entry.path))?;

        let status = parse::classify_fresh_status(
            iteration,
            spec.max_iterations,
            latest_log.modified,
            now,
            self.stale_after,
        );

        Ok(Some(LoopRecord {
            task_id: task_id.to_string(),
            loop_type: LoopType::Fresh,
            iteration,
            max_iterations: spec.max_iterations,
            completion_promise: spec.completion_promise.clone(),
            mode: spec.mode,
            started_at: spec.created_at.unwrap_or(spec_entry.modified),
            status,
            state_path: None,
            progress_path: layout.progress_path(task_id),
            steering_path: layout.steering_path(task_id),
            steering_status: SteeringStatus::None,
            logs_dir: Some(layout.logs_dir(task_id)),
            spec: Some(spec),
        }))
    }
}

/// Newest first, then task id.
fn compare_records(a: &LoopRecord, b: &LoopRecord) -> Ordering {
    b.started_at
        .cmp(&a.started_at)
        .then_with(|| a.task_id.cmp(&b.task_id))
}
