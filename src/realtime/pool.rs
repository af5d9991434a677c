//! Keyed pool of long-lived connections with LRU eviction and idle sweeps.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A connection the pool can hold.
pub trait PooledConnection: Send + Sync + 'static {
  /// Whether the connection can still carry traffic.
  fn is_alive(&self) -> bool;

  fn close(&self);
}

/// Opens connections for pool keys.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
  type Conn: PooledConnection;

  async fn connect(&self, key: &str) -> Result<Self::Conn>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
  /// Soft limit; exceeded only when every connection is borrowed
  pub max_connections: usize,
  pub idle_timeout: Duration,
  pub sweep_interval: Duration,
}

impl Default for PoolSettings {
  fn default() -> Self {
    Self {
      max_connections: 10,
      idle_timeout: Duration::from_secs(300),
      sweep_interval: Duration::from_secs(60),
    }
  }
}

struct Entry<T> {
  conn: Arc<T>,
  /// Callers between `mark_in_use` and `release`
  borrowers: usize,
  last_used: Instant,
}

impl<T> Entry<T> {
  fn new(conn: Arc<T>, borrowers: usize) -> Self {
    Self {
      conn,
      borrowers,
      last_used: Instant::now(),
    }
  }

  fn touch(&mut self) {
    self.last_used = Instant::now();
  }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Pool of connections keyed by endpoint.
///
/// The entry table is only locked for bookkeeping, never across a connect.
/// Connects to the same key are serialized by a per-key gate so a key is
/// never opened twice; different keys connect concurrently.
pub struct ConnectionPool<C: Connector> {
  connector: C,
  settings: PoolSettings,
  entries: Mutex<HashMap<String, Entry<C::Conn>>>,
  gates: Mutex<HashMap<String, Gate>>,
}

impl<C: Connector> ConnectionPool<C> {
  pub fn new(connector: C, settings: PoolSettings) -> Self {
    Self {
      connector,
      settings,
      entries: Mutex::new(HashMap::new()),
      gates: Mutex::new(HashMap::new()),
    }
  }

  /// Get the live connection for `key`, opening one if needed.
  ///
  /// A full pool first closes its least recently used idle connection.
  /// Only opening the connection can fail.
  pub async fn acquire(&self, key: &str) -> Result<Arc<C::Conn>> {
    self.get_or_connect(key, false).await
  }

  /// Acquire `key` and hold it in use until the returned handle is dropped.
  ///
  /// The borrow is taken atomically with the lookup, and released on drop
  /// even when the caller's future is cancelled.
  pub async fn checkout(self: &Arc<Self>, key: &str) -> Result<Checkout<C>> {
    let conn = self.get_or_connect(key, true).await?;
    Ok(Checkout {
      pool: Arc::clone(self),
      key: key.to_string(),
      conn,
    })
  }

  async fn get_or_connect(&self, key: &str, borrow: bool) -> Result<Arc<C::Conn>> {
    if let Some(conn) = self.live(key, borrow) {
      return Ok(conn);
    }

    let gate = self.gate_for(key);
    let connecting = Arc::clone(&gate).lock_owned().await;
    let outcome = self.connect_locked(key, borrow).await;
    drop(connecting);
    self.prune_gate(key, gate);
    outcome
  }

  /// Runs with the key's gate held.
  async fn connect_locked(&self, key: &str, borrow: bool) -> Result<Arc<C::Conn>> {
    // Someone else may have opened it while we waited for the gate.
    if let Some(conn) = self.live(key, borrow) {
      return Ok(conn);
    }

    {
      let mut entries = self.lock_entries();
      if let Some(dead) = entries.remove(key) {
        debug!(key, "Replacing dead pooled connection");
        dead.conn.close();
      }
      if entries.len() >= self.settings.max_connections {
        evict_least_recently_used(&mut entries, self.settings.max_connections);
      }
    }

    let conn = Arc::new(self.connector.connect(key).await?);

    let mut entries = self.lock_entries();
    entries.insert(
      key.to_string(),
      Entry::new(Arc::clone(&conn), usize::from(borrow)),
    );
    debug!(key, size = entries.len(), "Opened pooled connection");
    Ok(conn)
  }

  /// The pooled connection for `key` if it is alive, touched and optionally
  /// borrowed.
  fn live(&self, key: &str, borrow: bool) -> Option<Arc<C::Conn>> {
    let mut entries = self.lock_entries();
    let entry = entries.get_mut(key)?;
    if !entry.conn.is_alive() {
      return None;
    }
    entry.touch();
    if borrow {
      entry.borrowers += 1;
    }
    Some(Arc::clone(&entry.conn))
  }

  /// Protect `key` from eviction until the matching [`Self::release`].
  pub fn mark_in_use(&self, key: &str) -> bool {
    match self.lock_entries().get_mut(key) {
      Some(entry) => {
        entry.borrowers += 1;
        entry.touch();
        true
      }
      None => false,
    }
  }

  pub fn release(&self, key: &str) {
    if let Some(entry) = self.lock_entries().get_mut(key) {
      entry.borrowers = entry.borrowers.saturating_sub(1);
      entry.touch();
    }
  }

  /// Close idle connections past the timeout, and dead ones. Returns how
  /// many were removed.
  pub fn sweep_idle(&self) -> usize {
    let mut entries = self.lock_entries();
    let idle_timeout = self.settings.idle_timeout;

    let expired: Vec<String> = entries
      .iter()
      .filter(|(_, e)| {
        e.borrowers == 0 && (e.last_used.elapsed() > idle_timeout || !e.conn.is_alive())
      })
      .map(|(key, _)| key.clone())
      .collect();

    for key in &expired {
      if let Some(entry) = entries.remove(key) {
        entry.conn.close();
      }
    }

    if !expired.is_empty() {
      debug!(removed = expired.len(), remaining = entries.len(), "Swept idle connections");
    }
    expired.len()
  }

  /// Sweep on an interval for as long as the pool is alive.
  pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
    let pool: Weak<Self> = Arc::downgrade(self);
    let period = self.settings.sweep_interval;

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
          break;
        };
        pool.sweep_idle();
      }
    })
  }

  pub fn close_all(&self) {
    let mut entries = self.lock_entries();
    let count = entries.len();
    for (_, entry) in entries.drain() {
      entry.conn.close();
    }
    info!(count, "Closed all pooled connections");
  }

  pub fn len(&self) -> usize {
    self.lock_entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_entries().is_empty()
  }

  pub fn borrowers(&self, key: &str) -> Option<usize> {
    self.lock_entries().get(key).map(|e| e.borrowers)
  }

  fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry<C::Conn>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn gate_for(&self, key: &str) -> Gate {
    let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(gates.entry(key.to_string()).or_default())
  }

  /// Forget the gate once nobody else is waiting on it.
  fn prune_gate(&self, key: &str, gate: Gate) {
    let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
    // The table and `gate` itself are the only holders left.
    if Arc::strong_count(&gate) == 2 {
      gates.remove(key);
    }
  }
}

/// A pooled connection held in use; released when dropped.
pub struct Checkout<C: Connector> {
  pool: Arc<ConnectionPool<C>>,
  key: String,
  conn: Arc<C::Conn>,
}

impl<C: Connector> Deref for Checkout<C> {
  type Target = C::Conn;

  fn deref(&self) -> &C::Conn {
    &self.conn
  }
}

impl<C: Connector> Drop for Checkout<C> {
  fn drop(&mut self) {
    self.pool.release(&self.key);
  }
}

fn evict_least_recently_used<T: PooledConnection>(
  entries: &mut HashMap<String, Entry<T>>,
  limit: usize,
) {
  let victim = entries
    .iter()
    .filter(|(_, e)| e.borrowers == 0)
    .min_by_key(|(_, e)| e.last_used)
    .map(|(key, _)| key.clone());

  match victim.and_then(|key| entries.remove_entry(&key)) {
    Some((key, entry)) => {
      debug!(key = %key, "Evicting least recently used connection");
      entry.conn.close();
    }
    None => warn!(
      limit,
      size = entries.len(),
      "Every pooled connection is in use, growing past the limit"
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex as StdMutex;

  type Log = Arc<StdMutex<Vec<String>>>;

  struct FakeConn {
    key: String,
    alive: AtomicBool,
    log: Log,
  }

  impl PooledConnection for FakeConn {
    fn is_alive(&self) -> bool {
      self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
      self.alive.store(false, Ordering::SeqCst);
      self.log.lock().unwrap().push(format!("close {}", self.key));
    }
  }

  #[derive(Default)]
  struct FakeConnector {
    log: Log,
  }

  #[async_trait]
  impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect(&self, key: &str) -> Result<FakeConn> {
      if key == "unreachable" {
        return Err(Error::Connection("refused".into()));
      }
      if key.starts_with("slow") {
        tokio::time::sleep(Duration::from_secs(5)).await;
      }
      self.log.lock().unwrap().push(format!("connect {}", key));
      Ok(FakeConn {
        key: key.to_string(),
        alive: AtomicBool::new(true),
        log: Arc::clone(&self.log),
      })
    }
  }

  fn pool(max_connections: usize) -> (ConnectionPool<FakeConnector>, Log) {
    let connector = FakeConnector::default();
    let log = Arc::clone(&connector.log);
    let settings = PoolSettings {
      max_connections,
      idle_timeout: Duration::from_secs(60),
      sweep_interval: Duration::from_secs(10),
    };
    (ConnectionPool::new(connector, settings), log)
  }

  fn events(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_pool_closes_lru_before_connecting() {
    let (pool, log) = pool(3);
    for key in ["a", "b", "c"] {
      pool.acquire(key).await.unwrap();
      tokio::time::advance(Duration::from_secs(1)).await;
    }

    pool.acquire("d").await.unwrap();

    assert_eq!(
      events(&log),
      vec!["connect a", "connect b", "connect c", "close a", "connect d"]
    );
    assert_eq!(pool.len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reuse_refreshes_recency() {
    let (pool, log) = pool(2);
    let first = pool.acquire("a").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire("b").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    let again = pool.acquire("a").await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    pool.acquire("c").await.unwrap();
    assert_eq!(events(&log).last().map(String::as_str), Some("connect c"));
    assert!(events(&log).contains(&"close b".to_string()));
    assert!(first.is_alive());
  }

  #[tokio::test(start_paused = true)]
  async fn test_borrowed_connections_are_never_evicted() {
    let (pool, log) = pool(2);
    pool.acquire("a").await.unwrap();
    assert!(pool.mark_in_use("a"));
    tokio::time::advance(Duration::from_secs(1)).await;
    pool.acquire("b").await.unwrap();

    pool.acquire("c").await.unwrap();

    assert!(events(&log).contains(&"close b".to_string()));
    assert!(!events(&log).contains(&"close a".to_string()));
  }

  #[tokio::test]
  async fn test_grows_past_limit_when_everything_is_borrowed() {
    let (pool, log) = pool(1);
    pool.acquire("a").await.unwrap();
    pool.mark_in_use("a");

    pool.acquire("b").await.unwrap();

    assert_eq!(pool.len(), 2);
    assert_eq!(events(&log), vec!["connect a", "connect b"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweep_closes_only_idle_connections() {
    let (pool, log) = pool(5);
    pool.acquire("busy").await.unwrap();
    pool.mark_in_use("busy");
    pool.acquire("idle").await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(pool.sweep_idle(), 1);
    assert_eq!(events(&log).last().map(String::as_str), Some("close idle"));

    pool.release("busy");
    assert_eq!(pool.borrowers("busy"), Some(0));
    assert_eq!(pool.sweep_idle(), 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(pool.sweep_idle(), 1);
    assert!(pool.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_runs_periodically() {
    let (pool, log) = pool(5);
    let pool = Arc::new(pool);
    pool.acquire("a").await.unwrap();
    let sweeper = pool.spawn_sweeper();

    tokio::time::sleep(Duration::from_secs(75)).await;

    assert!(pool.is_empty());
    assert!(events(&log).contains(&"close a".to_string()));
    sweeper.abort();
  }

  #[tokio::test]
  async fn test_dead_connections_are_replaced() {
    let (pool, log) = pool(3);
    let first = pool.acquire("a").await.unwrap();
    first.alive.store(false, Ordering::SeqCst);

    let second = pool.acquire("a").await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(events(&log), vec!["connect a", "close a", "connect a"]);
  }

  #[tokio::test]
  async fn test_connect_failure_leaves_pool_untouched() {
    let (pool, _log) = pool(3);
    pool.acquire("a").await.unwrap();

    assert!(pool.acquire("unreachable").await.is_err());
    assert_eq!(pool.len(), 1);
  }

  #[tokio::test]
  async fn test_close_all() {
    let (pool, log) = pool(3);
    let a = pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();

    pool.close_all();

    assert!(pool.is_empty());
    assert!(!a.is_alive());
    assert_eq!(events(&log).len(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_connect_does_not_block_other_keys() {
    let (pool, log) = pool(4);
    let pool = Arc::new(pool);

    let slow = tokio::spawn({
      let pool = Arc::clone(&pool);
      async move { pool.acquire("slow").await.map(|_| ()) }
    });
    tokio::task::yield_now().await;

    let started = Instant::now();
    pool.acquire("a").await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(pool.borrowers("a"), Some(0));

    slow.await.unwrap().unwrap();
    assert_eq!(events(&log), vec!["connect a", "connect slow"]);
    assert_eq!(pool.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_acquires_of_one_key_connect_once() {
    let (pool, log) = pool(4);
    let pool = Arc::new(pool);

    let (first, second) = tokio::join!(pool.acquire("slow-a"), pool.acquire("slow-a"));

    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(events(&log), vec!["connect slow-a"]);
    assert!(pool.gates.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_checkout_borrows_until_dropped() {
    let (pool, _log) = pool(4);
    let pool = Arc::new(pool);

    let held = pool.checkout("a").await.unwrap();
    assert!(held.is_alive());
    assert_eq!(pool.borrowers("a"), Some(1));

    let again = pool.checkout("a").await.unwrap();
    assert_eq!(pool.borrowers("a"), Some(2));

    drop(held);
    drop(again);
    assert_eq!(pool.borrowers("a"), Some(0));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_checkout_holder_releases() {
    let (pool, _log) = pool(4);
    let pool = Arc::new(pool);

    let attempt = {
      let pool = Arc::clone(&pool);
      async move {
        let _conn = pool.checkout("a").await?;
        std::future::pending::<()>().await;
        Ok::<_, Error>(())
      }
    };
    let outcome = tokio::time::timeout(Duration::from_millis(100), attempt).await;

    assert!(outcome.is_err());
    assert_eq!(pool.borrowers("a"), Some(0));
  }
}
