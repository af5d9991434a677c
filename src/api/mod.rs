//! The collection endpoint: wire types, HTTP transport, retry, and the
//! caching resource client built on top of them.

mod api_types;
mod cache;
mod cached_client;
mod client;
mod remote;
mod retry;
mod types;

pub use cached_client::ResourceClient;
pub use client::HttpRemote;
pub use remote::{fetch_all, Remote};
pub use retry::RetryPolicy;
pub use types::{
  ListQuery, NewResource, Resource, ResourcePage, ResourceStatus, ResourceUpdate, StatusChange,
  DEFAULT_PAGE_SIZE, SYSTEM_AUTHOR,
};
