//! Remote poll driver.
//!
//! A remote artifact root has no change feed. Each tick lists every artifact
//! kind with modification times, diffs against the previous listing and feeds
//! the synthesized changes through the shared [`IncrementalReconciler`].
//! Ticks are skipped while nobody is listening.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ralph_core::{ArtifactKind, LoopEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeKind, IncrementalReconciler};
use crate::store::StoreError;

const POLLED_KINDS: [ArtifactKind; 6] = [
    ArtifactKind::LoopState,
    ArtifactKind::Spec,
    ArtifactKind::IterationLog,
    ArtifactKind::Progress,
    ArtifactKind::Steering,
    ArtifactKind::Summary,
];

type Listing = HashMap<PathBuf, DateTime<Utc>>;

/// Floor for the poll period; a zero period would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Diff two listings. Additions and changes come first, oldest first;
/// removals follow in path order.
pub fn diff_listings(previous: &Listing, current: &Listing) -> Vec<(PathBuf, ChangeKind)> {
    let mut upserts: Vec<(&PathBuf, DateTime<Utc>, ChangeKind)> = current
        .iter()
        .filter_map(|(path, modified)| match previous.get(path) {
            None => Some((path, *modified, ChangeKind::Added)),
            Some(before) if before != modified => Some((path, *modified, ChangeKind::Changed)),
            Some(_) => None,
        })
        .collect();
    upserts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let mut removals: Vec<&PathBuf> = previous
        .keys()
        .filter(|path| !current.contains_key(*path))
        .collect();
    removals.sort();

    upserts
        .into_iter()
        .map(|(path, _, kind)| (path.clone(), kind))
        .chain(removals.into_iter().map(|p| (p.clone(), ChangeKind::Removed)))
        .collect()
}

#[derive(Debug)]
pub struct PollDriver {
    tracker: IncrementalReconciler,
    previous: Option<Listing>,
    poll_when_idle: bool,
}

impl PollDriver {
    pub fn new(tracker: IncrementalReconciler) -> Self {
        Self {
            tracker,
            previous: None,
            poll_when_idle: false,
        }
    }

    /// Keep polling with no observers connected.
    pub fn poll_when_idle(mut self, enabled: bool) -> Self {
        self.poll_when_idle = enabled;
        self
    }

    pub fn tracker(&self) -> &IncrementalReconciler {
        &self.tracker
    }

    async fn list_all(&self) -> Result<Listing, StoreError> {
        let reconciler = self.tracker.reconciler();
        let layout = reconciler.layout();
        let mut listing = Listing::new();
        for kind in POLLED_KINDS {
            for entry in reconciler.store().list(&layout.pattern(kind)).await? {
                listing.insert(entry.path, entry.modified);
            }
        }
        Ok(listing)
    }

    /// Record the listing later polls diff against.
    pub async fn record_baseline(&mut self) -> Result<(), StoreError> {
        let current = self.list_all().await?;
        debug!(artifacts = current.len(), "poll baseline recorded");
        self.previous = Some(current);
        Ok(())
    }

    /// One poll. Without a baseline, the first call only records one.
    ///
    /// A failed listing leaves the baseline untouched, so a transient remote
    /// error never reads as mass deletion.
    pub async fn poll_once(&mut self) -> Result<Vec<LoopEvent>, StoreError> {
        let current = self.list_all().await?;
        let changes = match &self.previous {
            Some(previous) => diff_listings(previous, &current),
            None => {
                debug!(artifacts = current.len(), "poll baseline recorded");
                Vec::new()
            }
        };
        self.previous = Some(current);

        let mut events = Vec::new();
        for (path, kind) in changes {
            events.extend(self.tracker.handle_change(&path, kind).await);
        }
        Ok(events)
    }

    /// Poll every `interval` until `cancel` fires.
    ///
    /// The baseline is taken together with priming, so artifacts that appear
    /// while no observer is connected are reported on the first observed tick.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        if let Err(e) = self.tracker.prime().await {
            warn!(error = %e, "failed to prime change tracker");
        }
        if let Err(e) = self.record_baseline().await {
            warn!(error = %e, "failed to record poll baseline");
        }

        let interval = interval.max(MIN_POLL_INTERVAL);
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "remote poller started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("remote poller stopping");
                    break;
                }
                _ = tick.tick() => {
                    if !self.poll_when_idle && self.tracker.bus().observer_count() == 0 {
                        continue;
                    }
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "remote poll failed");
                    }
                }
            }
        }
    }
}
