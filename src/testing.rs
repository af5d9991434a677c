//! Shared fakes for unit tests: an in-memory compare-and-swap server, a
//! cache backend that always fails and a local websocket server.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use color_eyre::eyre::eyre;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::{
  ListQuery, NewResource, Remote, Resource, ResourcePage, ResourceStatus, ResourceUpdate,
  StatusChange, DEFAULT_PAGE_SIZE,
};
use crate::cache::{CacheStorage, Cacheable, CachedEntity, ConsistencyReport};
use crate::error::{Error, Result};
use crate::realtime::Frame;
use crate::sync::{OperationType, SyncOperation};

pub const AUTHOR: &str = "author-1";

pub fn resource(id: &str, version: u64) -> Resource {
  Resource {
    id: id.to_string(),
    version,
    status: ResourceStatus::Draft,
    author_id: AUTHOR.to_string(),
    title: format!("Resource {}", id),
    description: Some(format!("Description of {}", id)),
    content: serde_json::json!({ "nodes": [] }),
    tags: Vec::new(),
    created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    updated_at: None,
    reviewed_at: None,
    published_at: None,
  }
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
  for _ in 0..100 {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  check()
}

/// In-memory stand-in for the collection endpoint with real version checks.
#[derive(Default)]
pub struct MemoryRemote {
  resources: Mutex<BTreeMap<String, Resource>>,
  next_id: AtomicU64,
  offline: AtomicBool,
  failures: AtomicU32,
  latency_ms: AtomicU64,
  ack_delay_ms: AtomicU64,
  list_calls: AtomicUsize,
  lists_in_flight: AtomicUsize,
  max_lists_in_flight: AtomicUsize,
  write_calls: AtomicUsize,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
    let remote = Self::new();
    for r in resources {
      remote.put(r);
    }
    remote
  }

  /// Write directly, as another client would.
  pub fn put(&self, resource: Resource) {
    self
      .resources
      .lock()
      .unwrap()
      .insert(resource.id.clone(), resource);
  }

  /// Delete directly, as another client would.
  pub fn remove(&self, id: &str) {
    self.resources.lock().unwrap().remove(id);
  }

  pub fn get_stored(&self, id: &str) -> Option<Resource> {
    self.resources.lock().unwrap().get(id).cloned()
  }

  pub fn ids(&self) -> HashSet<String> {
    self.resources.lock().unwrap().keys().cloned().collect()
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Fail the next `n` calls with a transport error.
  pub fn fail_next(&self, n: u32) {
    self.failures.store(n, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    self
      .latency_ms
      .store(latency.as_millis() as u64, Ordering::SeqCst);
  }

  /// Delay create responses after the write has been applied.
  pub fn set_ack_delay(&self, delay: Duration) {
    self
      .ack_delay_ms
      .store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  pub fn list_calls(&self) -> usize {
    self.list_calls.load(Ordering::SeqCst)
  }

  pub fn max_lists_in_flight(&self) -> usize {
    self.max_lists_in_flight.load(Ordering::SeqCst)
  }

  pub fn write_calls(&self) -> usize {
    self.write_calls.load(Ordering::SeqCst)
  }

  async fn call(&self) -> Result<()> {
    let latency = self.latency_ms.load(Ordering::SeqCst);
    if latency > 0 {
      tokio::time::sleep(Duration::from_millis(latency)).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(Error::Transport("connection refused".into()));
    }
    let failed = self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failed {
      return Err(Error::Transport("connection reset".into()));
    }
    Ok(())
  }

  fn check_version(current: &Resource, submitted: u64) -> Result<()> {
    if current.version != submitted {
      return Err(Error::Conflict(format!(
        "resource {} is at version {}, got {}",
        current.id, current.version, submitted
      )));
    }
    Ok(())
  }
}

#[async_trait]
impl Remote for MemoryRemote {
  async fn list(&self, query: &ListQuery) -> Result<ResourcePage> {
    self.list_calls.fetch_add(1, Ordering::SeqCst);
    let now = self.lists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_lists_in_flight.fetch_max(now, Ordering::SeqCst);
    let result = self.call().await;
    self.lists_in_flight.fetch_sub(1, Ordering::SeqCst);
    result?;

    let matching: Vec<Resource> = self
      .resources
      .lock()
      .unwrap()
      .values()
      .filter(|r| query.matches(r))
      .cloned()
      .collect();
    let total = matching.len() as u64;
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let items = matching
      .into_iter()
      .skip(((page - 1) * page_size) as usize)
      .take(page_size as usize)
      .collect();

    Ok(ResourcePage {
      items,
      total: Some(total),
      page,
      page_size,
    })
  }

  async fn get(&self, id: &str) -> Result<Resource> {
    self.call().await?;
    self
      .get_stored(id)
      .ok_or_else(|| Error::not_found(format!("resource {} not found", id)))
  }

  async fn create(&self, payload: &NewResource) -> Result<Resource> {
    self.write_calls.fetch_add(1, Ordering::SeqCst);
    self.call().await?;
    if payload.title.trim().is_empty() {
      return Err(Error::business("VALIDATION_ERROR", "title is required"));
    }
    let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let mut created = payload.provisional(format!("res-{}", n), AUTHOR);
    created.version = 1;
    self.put(created.clone());
    let ack_delay = self.ack_delay_ms.load(Ordering::SeqCst);
    if ack_delay > 0 {
      tokio::time::sleep(Duration::from_millis(ack_delay)).await;
    }
    Ok(created)
  }

  async fn update(&self, id: &str, payload: &ResourceUpdate) -> Result<Resource> {
    self.write_calls.fetch_add(1, Ordering::SeqCst);
    self.call().await?;
    let mut resources = self.resources.lock().unwrap();
    let current = resources
      .get_mut(id)
      .ok_or_else(|| Error::not_found(format!("resource {} not found", id)))?;
    Self::check_version(current, payload.version)?;
    let mut next = current.with_update(payload);
    next.version = current.version + 1;
    *current = next.clone();
    Ok(next)
  }

  async fn update_status(&self, id: &str, change: &StatusChange) -> Result<Resource> {
    self.write_calls.fetch_add(1, Ordering::SeqCst);
    self.call().await?;
    let mut resources = self.resources.lock().unwrap();
    let current = resources
      .get_mut(id)
      .ok_or_else(|| Error::not_found(format!("resource {} not found", id)))?;
    Self::check_version(current, change.version)?;
    let mut next = current.with_status(change);
    next.version = current.version + 1;
    if change.status == ResourceStatus::Published {
      next.published_at = next.updated_at;
    }
    *current = next.clone();
    Ok(next)
  }

  async fn delete(&self, id: &str) -> Result<()> {
    self.write_calls.fetch_add(1, Ordering::SeqCst);
    self.call().await?;
    self
      .resources
      .lock()
      .unwrap()
      .remove(id)
      .map(|_| ())
      .ok_or_else(|| Error::not_found(format!("resource {} not found", id)))
  }
}

/// Cache backend whose every operation fails, like a full or locked store.
pub struct FailingStorage;

fn unavailable<T>() -> color_eyre::Result<T> {
  Err(eyre!("storage unavailable"))
}

impl CacheStorage for FailingStorage {
  fn get_all<T: Cacheable>(&self) -> color_eyre::Result<Vec<CachedEntity<T>>> {
    unavailable()
  }

  fn get_by_id<T: Cacheable>(&self, _id: &str) -> color_eyre::Result<Option<CachedEntity<T>>> {
    unavailable()
  }

  fn set_all<T: Cacheable>(&self, _entities: &[T]) -> color_eyre::Result<()> {
    unavailable()
  }

  fn set<T: Cacheable>(&self, _entity: &T) -> color_eyre::Result<()> {
    unavailable()
  }

  fn delete<T: Cacheable>(&self, _id: &str) -> color_eyre::Result<bool> {
    unavailable()
  }

  fn clear<T: Cacheable>(&self) -> color_eyre::Result<()> {
    unavailable()
  }

  fn clean_expired(&self) -> color_eyre::Result<usize> {
    unavailable()
  }

  fn validate_consistency<T: Cacheable>(
    &self,
    _authoritative: &HashSet<String>,
  ) -> color_eyre::Result<ConsistencyReport> {
    unavailable()
  }

  fn enqueue_operation(&self, _operation: &SyncOperation) -> color_eyre::Result<()> {
    unavailable()
  }

  fn pending_operations(&self) -> color_eyre::Result<Vec<SyncOperation>> {
    unavailable()
  }

  fn record_operation_failure(
    &self,
    _op_type: OperationType,
    _resource_id: &str,
    _error: &str,
  ) -> color_eyre::Result<u32> {
    unavailable()
  }

  fn remove_operation(
    &self,
    _op_type: OperationType,
    _resource_id: &str,
  ) -> color_eyre::Result<bool> {
    unavailable()
  }
}

/// Accept websocket connections on a local port, handing each to `handler`
/// with its zero-based index. Returns the URL and the accept counter.
pub async fn serve<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
  F: Fn(usize, WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let url = format!("ws://{}", listener.local_addr().unwrap());
  let accepted = Arc::new(AtomicUsize::new(0));

  let counter = Arc::clone(&accepted);
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
        tokio::spawn(handler(n, ws));
      }
    }
  });

  (url, accepted)
}

/// Answer pings with pongs and acknowledge every config push. Configs with
/// `"reject": true` are refused.
pub async fn respond_to_frames(_n: usize, mut ws: WebSocketStream<TcpStream>) {
  while let Some(Ok(message)) = ws.next().await {
    let Message::Text(text) = message else {
      continue;
    };
    let reply = match Frame::decode(&text) {
      Ok(Some(Frame::Ping { timestamp })) => Frame::Pong { timestamp },
      Ok(Some(Frame::ConfigPush { id, config })) => {
        let rejected = config.get("reject").and_then(serde_json::Value::as_bool) == Some(true);
        Frame::ConfigAck {
          id,
          ok: !rejected,
          message: rejected.then(|| "invalid configuration".to_string()),
        }
      }
      _ => continue,
    };
    if ws.send(Message::Text(reply.encode().unwrap())).await.is_err() {
      break;
    }
  }
}
