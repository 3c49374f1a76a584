//! Incremental change propagation.
//!
//! [`IncrementalReconciler`] turns one path-level change into typed
//! [`LoopEvent`]s. Two drivers feed it: [`fs`] for a local artifact root
//! (native file notifications) and [`poll`] for a remote root (listing diffs).
//! Both go through [`IncrementalReconciler::handle_change`], so the same
//! change is classified the same way regardless of mode.

pub mod fs;
pub mod poll;

use std::collections::HashSet;
use std::path::Path;

use ralph_core::{ArtifactKind, LoopEvent, LoopRecord};
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::reconciler::LoopReconciler;
use crate::store::StoreError;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        }
    }
}

/// Per-artifact incremental reconciliation.
///
/// Holds the only mutable tracking state: specs already announced and
/// persistent loops already reported as removed. Owned by a single driver task.
#[derive(Debug)]
pub struct IncrementalReconciler {
    reconciler: LoopReconciler,
    bus: EventBus,
    /// Task ids whose spec has been seen. Never evicted.
    seen_specs: HashSet<String>,
    /// Persistent tasks whose state artifact was deleted.
    removed: HashSet<String>,
}

impl IncrementalReconciler {
    pub fn new(reconciler: LoopReconciler, bus: EventBus) -> Self {
        Self {
            reconciler,
            bus,
            seen_specs: HashSet::new(),
            removed: HashSet::new(),
        }
    }

    pub fn reconciler(&self) -> &LoopReconciler {
        &self.reconciler
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Mark every task with a spec or state artifact as already seen, so only
    /// specs created from here on announce themselves.
    pub async fn prime(&mut self) -> Result<(), StoreError> {
        let specs = self.reconciler.task_ids(ArtifactKind::Spec).await?;
        let states = self.reconciler.task_ids(ArtifactKind::LoopState).await?;
        self.seen_specs.extend(specs);
        self.seen_specs.extend(states);
        info!(known_tasks = self.seen_specs.len(), "primed change tracker");
        Ok(())
    }

    pub fn has_seen_spec(&self, task_id: &str) -> bool {
        self.seen_specs.contains(task_id)
    }

    /// Re-parse the artifact at `path` and publish what changed.
    ///
    /// Returns the published events.
    pub async fn handle_change(&mut self, path: &Path, change: ChangeKind) -> Vec<LoopEvent> {
        let Some(classified) = self.reconciler.layout().classify(path) else {
            return Vec::new();
        };
        let task_id = classified.task_id;
        debug!(
            task_id = %task_id,
            kind = classified.kind.as_str(),
            change = change.as_str(),
            "artifact changed"
        );

        let mut events = Vec::new();
        match classified.kind {
            ArtifactKind::LoopState => self.on_state(&task_id, change, &mut events).await,
            ArtifactKind::Spec => self.on_spec(&task_id, change, &mut events).await,
            ArtifactKind::IterationLog => {
                if change != ChangeKind::Removed && !self.reconciler.has_state(&task_id).await {
                    if let Some(record) = self.reconciler.resolve_fresh(&task_id).await {
                        self.push_loop(record, &mut events);
                    }
                }
            }
            ArtifactKind::Progress => {
                if change != ChangeKind::Removed {
                    if let Some(progress) = self.reconciler.get_progress(&task_id).await {
                        events.push(LoopEvent::ProgressUpdated(progress));
                    }
                }
            }
            ArtifactKind::Steering => {
                if change != ChangeKind::Removed {
                    if let Some(question) = self.reconciler.get_steering(&task_id).await {
                        events.push(LoopEvent::SteeringUpdated(question));
                    }
                }
                // Steering status is part of the loop record.
                if let Some(record) = self.reconciler.get_loop(&task_id).await {
                    self.push_loop(record, &mut events);
                }
            }
            ArtifactKind::Summary => {
                if change != ChangeKind::Removed {
                    if let Some(summary) = self.reconciler.get_summary(&task_id).await {
                        events.push(LoopEvent::SummaryUpdated(summary));
                    }
                }
            }
        }

        for event in &events {
            self.bus.publish(event.clone());
        }
        events
    }

    async fn on_state(&mut self, task_id: &str, change: ChangeKind, events: &mut Vec<LoopEvent>) {
        // Remove-then-recreate can arrive as a removal of a path that exists again.
        let exists = self.reconciler.has_state(task_id).await;
        if change == ChangeKind::Removed && !exists {
            if self.removed.insert(task_id.to_string()) {
                info!(task_id = %task_id, "loop state removed");
                events.push(LoopEvent::removed(task_id));
            }
            return;
        }
        if !exists {
            return;
        }

        self.removed.remove(task_id);
        self.seen_specs.insert(task_id.to_string());
        if let Some(record) = self.reconciler.resolve_persistent(task_id).await {
            self.push_loop(record, events);
        }
    }

    async fn on_spec(&mut self, task_id: &str, change: ChangeKind, events: &mut Vec<LoopEvent>) {
        if change == ChangeKind::Removed {
            // Fresh loops have no deletion signal; they go stale instead.
            return;
        }
        let has_state = self.reconciler.has_state(task_id).await;

        if !self.seen_specs.contains(task_id) {
            if has_state || self.reconciler.has_iteration_logs(task_id).await {
                self.seen_specs.insert(task_id.to_string());
            } else if let Some(spec) = self.reconciler.get_spec(task_id).await {
                self.seen_specs.insert(task_id.to_string());
                info!(task_id = %task_id, "new spec");
                events.push(LoopEvent::SpecCreated(spec));
            }
        }

        if !has_state {
            if let Some(record) = self.reconciler.resolve_fresh(task_id).await {
                self.push_loop(record, events);
            }
        }
    }

    fn push_loop(&self, record: LoopRecord, events: &mut Vec<LoopEvent>) {
        if self.removed.contains(&record.task_id) {
            debug!(task_id = %record.task_id, "suppressing update for removed loop");
            return;
        }
        events.push(LoopEvent::LoopUpdated(record));
    }
}
