use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::permissions::{Actor, Permissions, RolePermissions};
use crate::api::{
  ListQuery, NewResource, Remote, Resource, ResourceClient, ResourceUpdate, StatusChange,
};
use crate::cache::{CacheSource, CacheStorage};
use crate::error::{Error, Result};

/// Prefix of ids given to resources the server has not confirmed yet.
pub const PROVISIONAL_PREFIX: &str = "optimistic-";

/// What the store is doing, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
  Idle,
  Saving,
  /// A write hit a version conflict; fresh data is being loaded
  StaleRefreshing,
  Failed(String),
}

/// The entry a mutation touched, as it was before.
struct Snapshot {
  id: String,
  position: Option<usize>,
  entry: Option<Resource>,
}

/// In-memory list of resources with optimistic mutations.
///
/// Every change shows up locally before the server confirms it. Confirmed
/// changes are replaced by the server's copy; rejected ones are rolled back
/// to exactly what was there before.
pub struct ResourceStore<R: Remote, S: CacheStorage, P: Permissions = RolePermissions> {
  client: Arc<ResourceClient<R, S>>,
  permissions: P,
  actor: Actor,
  query: ListQuery,
  items: RwLock<Vec<Resource>>,
  status: watch::Sender<StoreStatus>,
  /// One async lock per resource id being mutated
  locks: IdLocks,
}

type IdLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds the lock for one id. The table entry goes away with the last holder.
struct IdGuard<'a> {
  locks: &'a IdLocks,
  id: String,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
  fn drop(&mut self) {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    self.guard.take();
    // Waiters hold a clone, and new callers need the table lock we hold.
    if locks
      .get(&self.id)
      .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
      locks.remove(&self.id);
    }
  }
}

impl<R: Remote, S: CacheStorage, P: Permissions> ResourceStore<R, S, P> {
  pub fn new(client: Arc<ResourceClient<R, S>>, permissions: P, actor: Actor) -> Self {
    let (status, _) = watch::channel(StoreStatus::Idle);
    Self {
      client,
      permissions,
      actor,
      query: ListQuery::default(),
      items: RwLock::new(Vec::new()),
      status,
      locks: Mutex::new(HashMap::new()),
    }
  }

  /// Restrict the list this store holds.
  pub fn with_query(mut self, query: ListQuery) -> Self {
    self.query = query;
    self
  }

  pub fn actor(&self) -> &Actor {
    &self.actor
  }

  pub fn items(&self) -> Vec<Resource> {
    self.read_items().clone()
  }

  pub fn get(&self, id: &str) -> Option<Resource> {
    self.read_items().iter().find(|r| r.id == id).cloned()
  }

  pub fn status(&self) -> StoreStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<StoreStatus> {
    self.status.subscribe()
  }

  /// Fill the list, from cache when allowed.
  pub async fn load(&self, use_cache: bool) -> CacheSource {
    let result = self.client.get_all(&self.query, use_cache).await;
    debug!(count = result.data.len(), source = ?result.source, "Loaded resources");
    self.adopt(result.data);
    result.source
  }

  /// Reload from the server, bypassing the cache. Degraded results never
  /// replace the list; returns whether it was replaced.
  pub async fn refresh(&self) -> bool {
    let result = self.client.get_all(&self.query, false).await;
    if result.source != CacheSource::Network {
      debug!(source = ?result.source, "Refresh did not reach the server, keeping current list");
      return false;
    }
    self.adopt(result.data);
    true
  }

  pub async fn create(&self, payload: NewResource) -> Result<Resource> {
    self.permissions.can_create(&self.actor).into_result()?;

    let placeholder = payload.provisional(
      format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4()),
      &self.actor.id,
    );
    let snapshot = self.snapshot(&placeholder.id);
    self.write_items().push(placeholder.clone());

    self
      .commit(snapshot, self.client.create(&payload), |created| {
        self.confirm_created(&placeholder.id, created.clone())
      })
      .await
  }

  pub async fn update(&self, id: &str, update: ResourceUpdate) -> Result<Resource> {
    let _guard = self.lock_id(id).await;

    let current = self.find(id)?;
    self
      .permissions
      .can_edit(&self.actor, &current)
      .into_result()?;

    let snapshot = self.snapshot(id);
    self.replace(id, current.with_update(&update));

    self
      .commit(snapshot, self.client.update(id, &update), |updated| {
        self.replace(id, updated.clone())
      })
      .await
  }

  pub async fn update_status(&self, id: &str, change: StatusChange) -> Result<Resource> {
    let _guard = self.lock_id(id).await;

    let current = self.find(id)?;
    self
      .permissions
      .can_change_status(&self.actor, &current, change.status)
      .into_result()?;

    let snapshot = self.snapshot(id);
    self.replace(id, current.with_status(&change));

    self
      .commit(snapshot, self.client.update_status(id, &change), |updated| {
        self.replace(id, updated.clone())
      })
      .await
  }

  pub async fn delete(&self, id: &str) -> Result<()> {
    let _guard = self.lock_id(id).await;

    let current = self.find(id)?;
    self
      .permissions
      .can_delete(&self.actor, &current)
      .into_result()?;

    let snapshot = self.snapshot(id);
    self.write_items().retain(|r| r.id != id);

    self
      .commit(snapshot, self.client.delete(id), |_| {})
      .await
  }

  /// Await the server and settle the optimistic change either way.
  async fn commit<T>(
    &self,
    snapshot: Snapshot,
    call: impl Future<Output = Result<T>>,
    confirm: impl FnOnce(&T),
  ) -> Result<T> {
    self.status.send_replace(StoreStatus::Saving);

    match call.await {
      Ok(value) => {
        confirm(&value);
        self.status.send_replace(StoreStatus::Idle);
        Ok(value)
      }
      Err(e) if e.is_conflict() => {
        warn!(id = %snapshot.id, "Resource changed on the server, refreshing");
        self.status.send_replace(StoreStatus::StaleRefreshing);
        if !self.refresh().await {
          self.restore(snapshot);
        }
        self.status.send_replace(StoreStatus::Failed(e.to_string()));
        Err(e)
      }
      Err(e) => {
        warn!(id = %snapshot.id, error = %e, "Change rejected, rolling back");
        self.restore(snapshot);
        // Server may have partially applied it
        self.refresh().await;
        self.status.send_replace(StoreStatus::Failed(e.to_string()));
        Err(e)
      }
    }
  }

  fn snapshot(&self, id: &str) -> Snapshot {
    let items = self.read_items();
    let position = items.iter().position(|r| r.id == id);
    Snapshot {
      id: id.to_string(),
      position,
      entry: position.map(|i| items[i].clone()),
    }
  }

  fn restore(&self, snapshot: Snapshot) {
    let mut items = self.write_items();
    let current = items.iter().position(|r| r.id == snapshot.id);
    match (current, snapshot.entry) {
      (Some(i), Some(entry)) => items[i] = entry,
      (Some(i), None) => {
        items.remove(i);
      }
      (None, Some(entry)) => {
        let at = snapshot.position.unwrap_or(items.len()).min(items.len());
        items.insert(at, entry);
      }
      (None, None) => {}
    }
  }

  /// Take a fresh list, keeping creates the server has not confirmed yet.
  fn adopt(&self, mut fresh: Vec<Resource>) {
    let mut items = self.write_items();
    fresh.extend(
      items
        .iter()
        .filter(|r| r.id.starts_with(PROVISIONAL_PREFIX))
        .cloned(),
    );
    *items = fresh;
  }

  /// Swap a placeholder for the server's entity. A refresh may already have
  /// listed the entity, so it is matched by its real id first.
  fn confirm_created(&self, placeholder: &str, created: Resource) {
    let mut items = self.write_items();
    let provisional = items.iter().position(|r| r.id == placeholder);
    match items.iter().position(|r| r.id == created.id) {
      Some(i) => {
        items[i] = created;
        if let Some(p) = provisional {
          items.remove(p);
        }
      }
      None => match provisional {
        Some(p) => items[p] = created,
        None => items.push(created),
      },
    }
  }

  fn replace(&self, id: &str, resource: Resource) {
    let mut items = self.write_items();
    match items.iter_mut().find(|r| r.id == id) {
      Some(existing) => *existing = resource,
      None => items.push(resource),
    }
  }

  fn find(&self, id: &str) -> Result<Resource> {
    self
      .get(id)
      .ok_or_else(|| Error::not_found(format!("resource {} is not loaded", id)))
  }

  async fn lock_id(&self, id: &str) -> IdGuard<'_> {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
      Arc::clone(locks.entry(id.to_string()).or_default())
    };
    IdGuard {
      locks: &self.locks,
      id: id.to_string(),
      guard: Some(lock.lock_owned().await),
    }
  }

  fn read_items(&self) -> RwLockReadGuard<'_, Vec<Resource>> {
    self.items.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write_items(&self) -> RwLockWriteGuard<'_, Vec<Resource>> {
    self.items.write().unwrap_or_else(PoisonError::into_inner)
  }
}
