use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{fetch_all, ListQuery, Remote, Resource, RetryPolicy};
use crate::cache::CacheStorage;

use super::snapshot::LastKnown;

const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Idle,
  Syncing,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Resources the server returned
  pub fetched: usize,
  /// Cache entries pruned because the server no longer has them
  pub removed: usize,
  pub inconsistencies: Vec<String>,
}

/// Reconciles the cache against the server, at most one pass at a time.
///
/// Triggers that arrive while a pass is running are dropped, not queued.
/// Failures are logged and swallowed: a failed pass leaves the cache as it
/// was and the next trigger tries again.
pub struct SyncCoordinator<R: Remote, S: CacheStorage> {
  remote: Arc<R>,
  storage: Arc<S>,
  retry: RetryPolicy,
  syncing: AtomicBool,
  /// Replaced by every successful pass
  last_known: Arc<LastKnown>,
}

impl<R: Remote, S: CacheStorage> SyncCoordinator<R, S> {
  pub fn new(remote: Arc<R>, storage: Arc<S>, retry: RetryPolicy) -> Self {
    Self {
      remote,
      storage,
      retry,
      syncing: AtomicBool::new(false),
      last_known: Arc::default(),
    }
  }

  /// Share the in-memory view a client falls back on when offline.
  pub(crate) fn with_last_known(mut self, last_known: Arc<LastKnown>) -> Self {
    self.last_known = last_known;
    self
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::Acquire)
  }

  pub fn state(&self) -> SyncState {
    if self.is_syncing() {
      SyncState::Syncing
    } else {
      SyncState::Idle
    }
  }

  /// Start a background pass unless one is already running.
  ///
  /// Returns whether a pass was scheduled. The latch is taken before this
  /// returns, so `is_syncing` is immediately true.
  pub fn trigger(self: &Arc<Self>) -> bool {
    if !take(&self.syncing) {
      debug!("Sync already in flight, dropping trigger");
      return false;
    }
    let this = Arc::clone(self);
    tokio::spawn(async move {
      let _latch = Latch(&this.syncing);
      this.pass().await;
    });
    true
  }

  /// Run one pass now. `None` if another pass holds the latch or the fetch
  /// failed.
  pub async fn reconcile(&self) -> Option<SyncReport> {
    if !take(&self.syncing) {
      debug!("Sync already in flight, skipping");
      return None;
    }
    let _latch = Latch(&self.syncing);
    self.pass().await
  }

  /// Wait for a running pass to finish.
  pub async fn wait_until_idle(&self) {
    while self.is_syncing() {
      tokio::time::sleep(IDLE_POLL).await;
    }
  }

  async fn pass(&self) -> Option<SyncReport> {
    let items = match fetch_all(self.remote.as_ref(), &self.retry, &ListQuery::default()).await {
      Ok(items) => items,
      Err(e) => {
        warn!(error = %e, "Background sync could not fetch resources");
        return None;
      }
    };

    self.last_known.replace(&items);

    let mut report = SyncReport {
      fetched: items.len(),
      ..Default::default()
    };

    if let Err(e) = self.storage.set_all(&items) {
      warn!(error = %e, "Background sync could not write the cache");
    }

    let authoritative: HashSet<String> = items.iter().map(|r| r.id.clone()).collect();
    match self
      .storage
      .validate_consistency::<Resource>(&authoritative)
    {
      Ok(consistency) => {
        report.removed = consistency.removed;
        report.inconsistencies = consistency.inconsistencies;
      }
      Err(e) => warn!(error = %e, "Background sync could not validate the cache"),
    }

    info!(
      fetched = report.fetched,
      removed = report.removed,
      "Cache reconciled with server"
    );
    Some(report)
  }
}

fn take(flag: &AtomicBool) -> bool {
  flag
    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
    .is_ok()
}

/// Releases the in-flight flag on drop, including on early return and
/// panic.
struct Latch<'a>(&'a AtomicBool);

impl Drop for Latch<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
