use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{DuplexConnection, WsConnector};
use super::frame::Frame;
use super::pool::{ConnectionPool, Connector};
use crate::api::RetryPolicy;
use crate::error::{Error, Result};

/// Error code for a configuration the peer refused.
pub const CONFIG_REJECTED: &str = "CONFIG_REJECTED";

/// Pushes configuration documents over a pooled realtime connection and
/// waits for the peer to acknowledge them.
pub struct ConfigSyncClient<C = WsConnector>
where
  C: Connector<Conn = DuplexConnection>,
{
  pool: Arc<ConnectionPool<C>>,
  url: String,
  retry: RetryPolicy,
  ack_timeout: Duration,
}

impl<C: Connector<Conn = DuplexConnection>> ConfigSyncClient<C> {
  pub fn new(
    pool: Arc<ConnectionPool<C>>,
    url: impl Into<String>,
    retry: RetryPolicy,
    ack_timeout: Duration,
  ) -> Self {
    Self {
      pool,
      url: url.into(),
      retry,
      ack_timeout,
    }
  }

  /// Push `config` and wait for its acknowledgement. Returns the push id.
  ///
  /// Retries reuse the same id so the peer can recognize duplicates.
  pub async fn push(&self, config: &Value) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    self
      .retry
      .run("config_push", || self.push_once(&id, config))
      .await?;
    info!(id = %id, url = %self.url, "Configuration acknowledged");
    Ok(id)
  }

  async fn push_once(&self, id: &str, config: &Value) -> Result<()> {
    // Released when dropped, including when the attempt times out.
    let conn = self.pool.checkout(&self.url).await?;
    self.exchange(&conn, id, config).await
  }

  async fn exchange(&self, conn: &DuplexConnection, id: &str, config: &Value) -> Result<()> {
    // Subscribe first so the ack cannot slip past us.
    let mut inbound = conn.subscribe();
    conn.send(Frame::ConfigPush {
      id: id.to_string(),
      config: config.clone(),
    })?;
    debug!(id, "Configuration pushed, awaiting ack");

    let wait_for_ack = async {
      loop {
        match inbound.recv().await {
          Ok(Frame::ConfigAck {
            id: acked,
            ok,
            message,
          }) if acked == id => return Ok((ok, message)),
          Ok(_) => continue,
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "Fell behind on inbound frames while awaiting ack");
          }
          Err(RecvError::Closed) => {
            return Err(Error::Connection(
              "connection closed before the ack arrived".to_string(),
            ))
          }
        }
      }
    };

    let (ok, message) = tokio::time::timeout(self.ack_timeout, wait_for_ack)
      .await
      .map_err(|_| Error::Timeout(self.ack_timeout))??;

    if ok {
      Ok(())
    } else {
      Err(Error::business(
        CONFIG_REJECTED,
        message.unwrap_or_else(|| "configuration rejected".to_string()),
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::{ConnectionSettings, PoolSettings};
  use crate::testing::{respond_to_frames, serve};
  use futures::StreamExt;
  use serde_json::json;

  fn client(url: &str, max_attempts: u32) -> ConfigSyncClient {
    client_with_timeouts(url, max_attempts, Duration::from_secs(5), Duration::from_millis(200))
  }

  fn client_with_timeouts(
    url: &str,
    max_attempts: u32,
    attempt_timeout: Duration,
    ack_timeout: Duration,
  ) -> ConfigSyncClient {
    let pool = Arc::new(ConnectionPool::new(
      WsConnector::new(ConnectionSettings::default()),
      PoolSettings::default(),
    ));
    let retry = RetryPolicy {
      max_attempts,
      base_delay: Duration::from_millis(10),
      timeout: attempt_timeout,
    };
    ConfigSyncClient::new(pool, url, retry, ack_timeout)
  }

  #[tokio::test]
  async fn test_push_is_acknowledged_and_released() {
    let (url, accepted) = serve(respond_to_frames).await;
    let client = client(&url, 3);

    client.push(&json!({ "theme": "dark" })).await.unwrap();
    client.push(&json!({ "theme": "light" })).await.unwrap();

    assert_eq!(client.pool.borrowers(&url), Some(0));
    // Both pushes shared one pooled connection.
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_rejection_is_a_business_error_and_not_retried() {
    let (url, _accepted) = serve(respond_to_frames).await;
    let client = client(&url, 3);

    let err = client.push(&json!({ "reject": true })).await.unwrap_err();

    assert!(matches!(&err, Error::Business { code, .. } if code == CONFIG_REJECTED));
    assert_eq!(client.pool.borrowers(&url), Some(0));
  }

  #[tokio::test]
  async fn test_missing_ack_times_out() {
    let (url, _accepted) = serve(|_, mut ws| async move {
      while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    let client = client(&url, 2);

    let err = client.push(&json!({})).await.unwrap_err();

    assert_eq!(err, Error::Timeout(Duration::from_millis(200)));
    assert_eq!(client.pool.borrowers(&url), Some(0));
  }

  #[tokio::test]
  async fn test_attempt_timeout_releases_the_borrow() {
    let (url, _accepted) = serve(|_, mut ws| async move {
      while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    // The attempt is cut off long before the ack wait would give up.
    let client = client_with_timeouts(&url, 2, Duration::from_millis(100), Duration::from_secs(1));

    let err = client.push(&json!({ "theme": "dark" })).await.unwrap_err();

    assert_eq!(err, Error::Timeout(Duration::from_millis(100)));
    assert_eq!(client.pool.borrowers(&url), Some(0));
    assert_eq!(client.pool.len(), 1);
  }
}
