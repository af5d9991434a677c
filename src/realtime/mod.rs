//! Realtime side-channel: duplex websocket connections, a connection pool
//! and the configuration push client built on them.

mod config_sync;
mod connection;
mod frame;
mod pool;

pub use config_sync::{ConfigSyncClient, CONFIG_REJECTED};
pub use connection::{ConnectionSettings, ConnectionState, DuplexConnection, WsConnector};
pub use frame::Frame;
pub use pool::{ConnectionPool, Connector, PoolSettings, PooledConnection};
