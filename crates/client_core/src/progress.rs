//! Blends per-branch pipeline progress into one monotonic value.

use std::collections::HashSet;

use tokio::sync::{mpsc, watch};

/// Combined completion in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Progress(f64);

impl Progress {
    pub const ZERO: Progress = Progress(0.0);
    pub const COMPLETE: Progress = Progress(1.0);

    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn percent(self) -> u8 {
        (self.0 * 100.0).round() as u8
    }

    pub fn is_complete(self) -> bool {
        self.0 >= 1.0
    }
}

/// Progress message sent by a pipeline branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchUpdate {
    /// One image URL finished its fetch/encode attempt, successfully or not.
    AssetSettled { index: usize },
    /// The bundle was uploaded and its root address resolved.
    BundleUploaded,
}

/// Weighs the fetch branch (fraction of settled URLs) and the upload branch
/// (0 or 1) equally and republishes the result on a watch channel.
pub struct ProgressAggregator {
    total_assets: usize,
    settled: HashSet<usize>,
    uploaded: bool,
    published: Progress,
    tx: watch::Sender<Progress>,
}

impl ProgressAggregator {
    pub fn new(total_assets: usize, tx: watch::Sender<Progress>) -> Self {
        Self {
            total_assets,
            settled: HashSet::new(),
            uploaded: false,
            published: Progress::ZERO,
            tx,
        }
    }

    fn combined(&self) -> Progress {
        let fetched = if self.total_assets == 0 {
            1.0
        } else {
            self.settled.len().min(self.total_assets) as f64 / self.total_assets as f64
        };
        let uploaded = if self.uploaded { 1.0 } else { 0.0 };
        Progress::new((fetched + uploaded) / 2.0)
    }

    /// Applies one update and returns the value visible to subscribers.
    pub fn apply(&mut self, update: BranchUpdate) -> Progress {
        match update {
            BranchUpdate::AssetSettled { index } => {
                self.settled.insert(index);
            }
            BranchUpdate::BundleUploaded => self.uploaded = true,
        }

        let combined = self.combined();
        if combined > self.published {
            self.published = combined;
            self.tx.send_if_modified(|current| {
                if combined > *current {
                    *current = combined;
                    true
                } else {
                    false
                }
            });
        }
        self.published
    }

    /// Drains `rx` until every branch has dropped its sender.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BranchUpdate>) -> Progress {
        while let Some(update) = rx.recv().await {
            self.apply(update);
        }
        self.published
    }
}
