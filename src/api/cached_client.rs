//! Resource client that wraps a [`Remote`] with retry and transparent caching.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::remote::{fetch_all, Remote};
use super::retry::RetryPolicy;
use super::types::{ListQuery, NewResource, Resource, ResourceUpdate, StatusChange};
use crate::cache::{CacheResult, CacheStorage};
use crate::error::{Error, Result};
use crate::sync::{
  FlushReport, LastKnown, OperationType, SyncCoordinator, SyncOperation, MAX_OPERATION_RETRIES,
};

/// Client for the resource collection with read-through/write-through caching.
///
/// Reads prefer the cache and schedule a background reconciliation; writes go
/// to the server first and are written through before returning. Cache
/// failures are logged and never fail a call.
pub struct ResourceClient<R: Remote, S: CacheStorage> {
  remote: Arc<R>,
  storage: Arc<S>,
  retry: RetryPolicy,
  sync: Arc<SyncCoordinator<R, S>>,
  /// Newest server view, for degraded reads
  last_known: Arc<LastKnown>,
  /// Queue writes that could not reach the server
  outbox: bool,
}

impl<R: Remote, S: CacheStorage> ResourceClient<R, S> {
  pub fn new(remote: Arc<R>, storage: Arc<S>, retry: RetryPolicy) -> Self {
    let last_known = Arc::new(LastKnown::default());
    let sync = Arc::new(
      SyncCoordinator::new(Arc::clone(&remote), Arc::clone(&storage), retry)
        .with_last_known(Arc::clone(&last_known)),
    );

    Self {
      remote,
      storage,
      retry,
      sync,
      last_known,
      outbox: false,
    }
  }

  /// Record retryable write failures in the outbox for later delivery.
  pub fn with_outbox(mut self, enabled: bool) -> Self {
    self.outbox = enabled;
    self
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator<R, S>> {
    &self.sync
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// List resources.
  ///
  /// 1. With `use_cache` and a non-empty cache, serve it and reconcile in
  ///    the background
  /// 2. Otherwise fetch from network and persist in the background
  /// 3. On network failure, serve the last data we saw (possibly nothing)
  pub async fn get_all(&self, query: &ListQuery, use_cache: bool) -> CacheResult<Vec<Resource>> {
    if use_cache {
      match self.storage.get_all::<Resource>() {
        Ok(cached) if !cached.is_empty() => {
          let cached_at = cached.iter().map(|e| e.fetched_at).min();
          let items: Vec<Resource> = cached.into_iter().map(|e| e.entity).collect();
          debug!(count = items.len(), "Serving resources from cache");
          self.remember(&items);
          self.sync.trigger();
          return CacheResult::from_cache(query.apply(items), cached_at);
        }
        Ok(_) => debug!("Cache empty, fetching resources from network"),
        Err(e) => warn!(error = %e, "Cache read failed, falling back to network"),
      }
    }

    match fetch_all(self.remote.as_ref(), &self.retry, query).await {
      Ok(items) => {
        if query.is_complete_listing() {
          self.last_known.replace(&items);
        } else {
          self.remember(&items);
        }
        self.persist_in_background(items.clone());
        CacheResult::from_network(items)
      }
      Err(e) => {
        let fallback = query.apply(self.fallback_items());
        warn!(
          error = %e,
          fallback = fallback.len(),
          "Listing failed, serving last known resources"
        );
        CacheResult::offline(fallback)
      }
    }
  }

  /// Fetch one resource. `Ok(None)` means the server does not have it.
  pub async fn get_by_id(
    &self,
    id: &str,
    use_cache: bool,
  ) -> Result<Option<CacheResult<Resource>>> {
    if use_cache {
      match self.storage.get_by_id::<Resource>(id) {
        Ok(Some(entry)) => {
          debug!(id, "Serving resource from cache");
          self.sync.trigger();
          return Ok(Some(CacheResult::from_cache(
            entry.entity,
            Some(entry.fetched_at),
          )));
        }
        Ok(None) => {}
        Err(e) => warn!(id, error = %e, "Cache read failed, falling back to network"),
      }
    }

    match self.retry.run("get", || self.remote.get(id)).await {
      Ok(resource) => {
        self.remember(std::slice::from_ref(&resource));
        self.persist_in_background(vec![resource.clone()]);
        Ok(Some(CacheResult::from_network(resource)))
      }
      Err(e) if e.is_not_found() => {
        self.forget(id);
        self.evict(id);
        Ok(None)
      }
      Err(e) => match self.last_known.by_id(id) {
        Some(resource) => {
          warn!(id, error = %e, "Lookup failed, serving last known resource");
          Ok(Some(CacheResult::offline(resource)))
        }
        None => Err(e),
      },
    }
  }

  pub async fn create(&self, payload: &NewResource) -> Result<Resource> {
    match self.retry.run("create", || self.remote.create(payload)).await {
      Ok(created) => {
        self.write_through(&created);
        Ok(created)
      }
      Err(e) => {
        let placeholder = Uuid::new_v4().to_string();
        self.queue_if_unreachable(OperationType::Create, &placeholder, payload, &e);
        Err(e)
      }
    }
  }

  /// Update content. `payload.version` must be the version last seen.
  pub async fn update(&self, id: &str, payload: &ResourceUpdate) -> Result<Resource> {
    match self.retry.run("update", || self.remote.update(id, payload)).await {
      Ok(updated) => {
        self.write_through(&updated);
        Ok(updated)
      }
      Err(e) => {
        self.queue_if_unreachable(OperationType::Update, id, payload, &e);
        Err(e)
      }
    }
  }

  pub async fn update_status(&self, id: &str, change: &StatusChange) -> Result<Resource> {
    match self
      .retry
      .run("update_status", || self.remote.update_status(id, change))
      .await
    {
      Ok(updated) => {
        self.write_through(&updated);
        Ok(updated)
      }
      Err(e) => {
        self.queue_if_unreachable(OperationType::UpdateStatus, id, change, &e);
        Err(e)
      }
    }
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    if let Err(e) = self.retry.run("delete", || self.remote.delete(id)).await {
      self.queue_if_unreachable(OperationType::Delete, id, &serde_json::Value::Null, &e);
      return Err(e);
    }

    self.forget(id);
    match self.storage.delete::<Resource>(id) {
      Ok(true) => {}
      Ok(false) => {
        debug!(id, "Deleted resource was not cached, scheduling reconciliation");
        self.sync.trigger();
      }
      Err(e) => {
        warn!(id, error = %e, "Cache delete failed, scheduling reconciliation");
        self.sync.trigger();
      }
    }
    Ok(())
  }

  /// Replay queued writes, oldest first.
  pub async fn flush_outbox(&self) -> FlushReport {
    let pending = match self.storage.pending_operations() {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "Could not read outbox");
        return FlushReport::default();
      }
    };

    let mut report = FlushReport::default();
    for operation in pending {
      match self.deliver(&operation).await {
        Ok(()) => {
          report.delivered += 1;
          self.discard(&operation);
        }
        Err(e) if e.is_retryable() => {
          let retries = self
            .storage
            .record_operation_failure(operation.op_type, &operation.resource_id, &e.to_string())
            .unwrap_or_else(|store_error| {
              warn!(error = %store_error, "Could not record outbox failure");
              operation.retry_count + 1
            });
          if retries >= MAX_OPERATION_RETRIES {
            warn!(
              op = %operation.op_type,
              id = %operation.resource_id,
              retries,
              "Giving up on queued operation"
            );
            self.discard(&operation);
            report.dropped += 1;
          } else {
            report.remaining += 1;
          }
        }
        Err(e) => {
          warn!(
            op = %operation.op_type,
            id = %operation.resource_id,
            error = %e,
            "Server rejected queued operation, dropping it"
          );
          self.discard(&operation);
          report.dropped += 1;
        }
      }
    }

    report
  }

  async fn deliver(&self, operation: &SyncOperation) -> Result<()> {
    let id = operation.resource_id.as_str();
    match operation.op_type {
      OperationType::Create => {
        let payload: NewResource = decode_payload(operation)?;
        let created = self
          .retry
          .run("create", || self.remote.create(&payload))
          .await?;
        self.write_through(&created);
      }
      OperationType::Update => {
        let payload: ResourceUpdate = decode_payload(operation)?;
        let updated = self
          .retry
          .run("update", || self.remote.update(id, &payload))
          .await?;
        self.write_through(&updated);
      }
      OperationType::UpdateStatus => {
        let change: StatusChange = decode_payload(operation)?;
        let updated = self
          .retry
          .run("update_status", || self.remote.update_status(id, &change))
          .await?;
        self.write_through(&updated);
      }
      OperationType::Delete => {
        match self.retry.run("delete", || self.remote.delete(id)).await {
          Ok(()) => {}
          // Someone else already deleted it; the intent is satisfied.
          Err(e) if e.is_not_found() => {}
          Err(e) => return Err(e),
        }
        self.forget(id);
        self.evict(id);
      }
    }
    Ok(())
  }

  fn discard(&self, operation: &SyncOperation) {
    if let Err(e) = self
      .storage
      .remove_operation(operation.op_type, &operation.resource_id)
    {
      warn!(id = %operation.resource_id, error = %e, "Could not remove queued operation");
    }
  }

  fn queue_if_unreachable<P: Serialize>(
    &self,
    op_type: OperationType,
    resource_id: &str,
    payload: &P,
    error: &Error,
  ) {
    if !self.outbox || !error.is_retryable() {
      return;
    }
    let payload = match serde_json::to_value(payload) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(error = %e, "Could not serialize operation for the outbox");
        return;
      }
    };
    let mut operation = SyncOperation::new(op_type, resource_id, payload);
    operation.last_error = Some(error.to_string());
    match self.storage.enqueue_operation(&operation) {
      Ok(()) => debug!(op = %op_type, id = resource_id, "Queued write for later delivery"),
      Err(e) => warn!(error = %e, "Could not queue write for later delivery"),
    }
  }

  /// Write to the cache before returning so the caller reads its own write.
  fn write_through(&self, resource: &Resource) {
    if let Err(e) = self.storage.set(resource) {
      warn!(id = %resource.id, error = %e, "Cache write failed, reconciliation will repair it");
    }
    self.remember(std::slice::from_ref(resource));
  }

  fn evict(&self, id: &str) {
    if let Err(e) = self.storage.delete::<Resource>(id) {
      warn!(id, error = %e, "Cache delete failed");
    }
  }

  fn persist_in_background(&self, items: Vec<Resource>) {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.set_all(&items) {
        warn!(error = %e, "Failed to persist fetched resources");
      }
    });
  }

  fn remember(&self, resources: &[Resource]) {
    self.last_known.remember(resources);
  }

  fn forget(&self, id: &str) {
    self.last_known.forget(id);
  }

  /// What to show when the network is gone: memory first, then the cache.
  fn fallback_items(&self) -> Vec<Resource> {
    let known = self.last_known.snapshot();
    if !known.is_empty() {
      return known;
    }
    self
      .storage
      .get_all::<Resource>()
      .map(|cached| cached.into_iter().map(|e| e.entity).collect())
      .unwrap_or_default()
  }
}

fn decode_payload<T: DeserializeOwned>(operation: &SyncOperation) -> Result<T> {
  serde_json::from_value(operation.payload.clone()).map_err(|e| {
    Error::business(
      "INVALID_OPERATION",
      format!("queued {} payload is unreadable: {}", operation.op_type, e),
    )
  })
}
