//! A self-healing websocket connection.
//!
//! Each connection is owned by a driver task that multiplexes outbound
//! frames, inbound frames, heartbeats and shutdown. When the socket dies the
//! driver reconnects with exponential backoff; frames sent in the meantime
//! wait in the outbound queue.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::frame::Frame;
use super::pool::{Connector, PooledConnection};
use crate::api::RetryPolicy;
use crate::error::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound frames buffered per subscriber before the slowest one lags.
const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
  pub heartbeat_interval: Duration,
  /// How long to wait for a pong before dropping the socket
  pub heartbeat_timeout: Duration,
  pub max_reconnect_attempts: u32,
  pub reconnect_base_delay: Duration,
  pub connect_timeout: Duration,
}

impl Default for ConnectionSettings {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_secs(30),
      heartbeat_timeout: Duration::from_secs(10),
      max_reconnect_attempts: 5,
      reconnect_base_delay: Duration::from_millis(500),
      connect_timeout: Duration::from_secs(10),
    }
  }
}

impl ConnectionSettings {
  fn backoff(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_reconnect_attempts.max(1),
      base_delay: self.reconnect_base_delay,
      timeout: self.connect_timeout,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
  Open,
  Reconnecting { attempt: u32 },
  /// Reconnection gave up
  Failed(String),
  Closed,
}

/// Handle to a websocket driven by a background task.
///
/// Dropping the handle shuts the connection down.
pub struct DuplexConnection {
  url: String,
  outbound: mpsc::UnboundedSender<Frame>,
  inbound: broadcast::Sender<Frame>,
  state: watch::Receiver<ConnectionState>,
  shutdown: watch::Sender<bool>,
}

impl DuplexConnection {
  /// Connect, retrying with backoff, and start the driver task.
  pub async fn connect(url: &str, settings: ConnectionSettings) -> Result<Self> {
    let backoff = settings.backoff();
    let socket = backoff
      .run("connect", || open_socket(url))
      .await
      .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;
    info!(url, "Realtime connection established");

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
    let (state_tx, state) = watch::channel(ConnectionState::Open);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let driver = Driver {
      url: url.to_string(),
      settings,
      backoff,
      outbound: outbound_rx,
      backlog: VecDeque::new(),
      inbound: inbound.clone(),
      state: state_tx,
      shutdown: shutdown_rx,
    };
    tokio::spawn(driver.run(socket));

    Ok(Self {
      url: url.to_string(),
      outbound,
      inbound,
      state,
      shutdown,
    })
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Queue a frame. It is written as soon as the socket is (re)established.
  pub fn send(&self, frame: Frame) -> Result<()> {
    match self.state() {
      ConnectionState::Failed(reason) => Err(Error::Connection(reason)),
      ConnectionState::Closed => Err(Error::Connection(format!("{} is closed", self.url))),
      _ => self
        .outbound
        .send(frame)
        .map_err(|_| Error::Connection(format!("{} is closed", self.url))),
    }
  }

  /// Receive every inbound frame except heartbeats.
  pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
    self.inbound.subscribe()
  }

  pub fn state(&self) -> ConnectionState {
    self.state.borrow().clone()
  }

  /// Wait until the state satisfies `predicate`.
  pub async fn wait_for(&self, predicate: impl Fn(&ConnectionState) -> bool) -> ConnectionState {
    let mut state = self.state.clone();
    let settled = state.wait_for(|s| predicate(s)).await.map(|s| s.clone());
    // Driver is gone; whatever it last published is final.
    settled.unwrap_or_else(|_| self.state())
  }

  pub fn close(&self) {
    self.shutdown.send_replace(true);
  }
}

impl Drop for DuplexConnection {
  fn drop(&mut self) {
    self.close();
  }
}

impl PooledConnection for DuplexConnection {
  /// Open or recovering. Queued frames on a recovering connection are
  /// delivered once it is back.
  fn is_alive(&self) -> bool {
    matches!(
      self.state(),
      ConnectionState::Open | ConnectionState::Reconnecting { .. }
    )
  }

  fn close(&self) {
    DuplexConnection::close(self);
  }
}

/// Opens [`DuplexConnection`]s; the pool key is the websocket URL.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
  settings: ConnectionSettings,
}

impl WsConnector {
  pub fn new(settings: ConnectionSettings) -> Self {
    Self { settings }
  }
}

#[async_trait]
impl Connector for WsConnector {
  type Conn = DuplexConnection;

  async fn connect(&self, key: &str) -> Result<DuplexConnection> {
    DuplexConnection::connect(key, self.settings).await
  }
}

async fn open_socket(url: &str) -> Result<Socket> {
  let (socket, _) = connect_async(url)
    .await
    .map_err(|e| Error::Transport(format!("websocket connect failed: {}", e)))?;
  Ok(socket)
}

/// Why `Driver::drive` returned.
enum Exit {
  Shutdown,
  Lost(String),
}

struct Driver {
  url: String,
  settings: ConnectionSettings,
  backoff: RetryPolicy,
  outbound: mpsc::UnboundedReceiver<Frame>,
  /// Frames taken off the queue whose write failed
  backlog: VecDeque<Frame>,
  inbound: broadcast::Sender<Frame>,
  state: watch::Sender<ConnectionState>,
  shutdown: watch::Receiver<bool>,
}

impl Driver {
  async fn run(mut self, mut socket: Socket) {
    loop {
      match self.drive(&mut socket).await {
        Exit::Shutdown => {
          if let Err(e) = socket.close(None).await {
            debug!(url = %self.url, error = %e, "Close handshake failed");
          }
          self.state.send_replace(ConnectionState::Closed);
          debug!(url = %self.url, "Realtime connection closed");
          return;
        }
        Exit::Lost(reason) => {
          warn!(url = %self.url, reason = %reason, "Realtime connection lost");
          match self.reconnect().await {
            Some(next) => socket = next,
            None => return,
          }
        }
      }
    }
  }

  async fn drive(&mut self, socket: &mut Socket) -> Exit {
    while let Some(frame) = self.backlog.pop_front() {
      if let Err(e) = write_frame(socket, &frame).await {
        self.backlog.push_front(frame);
        return Exit::Lost(e.to_string());
      }
    }

    let interval = self.settings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
      tokio::select! {
        _ = shutdown_requested(&mut self.shutdown) => return Exit::Shutdown,

        queued = self.outbound.recv() => match queued {
          Some(frame) => {
            if let Err(e) = write_frame(socket, &frame).await {
              self.backlog.push_front(frame);
              return Exit::Lost(e.to_string());
            }
          }
          // Every handle is gone
          None => return Exit::Shutdown,
        },

        incoming = socket.next() => match incoming {
          Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
            Ok(Some(Frame::Ping { timestamp })) => {
              if let Err(e) = write_frame(socket, &Frame::Pong { timestamp }).await {
                return Exit::Lost(e.to_string());
              }
            }
            Ok(Some(Frame::Pong { .. })) => pong_deadline = None,
            Ok(Some(frame)) => {
              // No subscribers is fine
              let _ = self.inbound.send(frame);
            }
            Ok(None) => {}
            Err(e) => warn!(url = %self.url, error = %e, "Dropping malformed frame"),
          },
          Some(Ok(Message::Close(frame))) => {
            return Exit::Lost(format!("closed by peer: {:?}", frame));
          }
          Some(Ok(_)) => {}
          Some(Err(e)) => return Exit::Lost(e.to_string()),
          None => return Exit::Lost("stream ended".to_string()),
        },

        _ = heartbeat.tick() => {
          if pong_deadline.is_none() {
            pong_deadline = Some(Instant::now() + self.settings.heartbeat_timeout);
          }
          if let Err(e) = write_frame(socket, &Frame::ping()).await {
            return Exit::Lost(e.to_string());
          }
        }

        _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)),
          if pong_deadline.is_some() =>
        {
          return Exit::Lost("heartbeat timed out".to_string());
        }
      }
    }
  }

  /// Reconnect with backoff. `None` once shut down or out of attempts.
  async fn reconnect(&mut self) -> Option<Socket> {
    let max_attempts = self.settings.max_reconnect_attempts;

    for attempt in 1..=max_attempts {
      self
        .state
        .send_replace(ConnectionState::Reconnecting { attempt });
      let delay = self.backoff.delay_for(attempt);

      tokio::select! {
        _ = shutdown_requested(&mut self.shutdown) => {
          self.state.send_replace(ConnectionState::Closed);
          return None;
        }
        _ = tokio::time::sleep(delay) => {}
      }

      match tokio::time::timeout(self.settings.connect_timeout, open_socket(&self.url)).await {
        Ok(Ok(socket)) => {
          info!(url = %self.url, attempt, "Realtime connection re-established");
          self.state.send_replace(ConnectionState::Open);
          return Some(socket);
        }
        Ok(Err(e)) => warn!(url = %self.url, attempt, max_attempts, error = %e, "Reconnect failed"),
        Err(_) => warn!(url = %self.url, attempt, max_attempts, "Reconnect timed out"),
      }
    }

    let reason = format!(
      "{} unreachable after {} reconnect attempts",
      self.url, max_attempts
    );
    error!(url = %self.url, "Giving up on realtime connection");
    self.state.send_replace(ConnectionState::Failed(reason));
    None
  }
}

async fn write_frame(socket: &mut Socket, frame: &Frame) -> Result<()> {
  let text = frame.encode()?;
  socket
    .send(Message::Text(text))
    .await
    .map_err(|e| Error::Connection(e.to_string()))
}

/// Resolves once shutdown is requested or the handle is dropped.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
  loop {
    if *shutdown.borrow_and_update() {
      return;
    }
    if shutdown.changed().await.is_err() {
      return;
    }
  }
}
