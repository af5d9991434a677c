//! The seam between the sync engine and the collection endpoint.

use async_trait::async_trait;

use super::retry::RetryPolicy;
use super::types::{
  ListQuery, NewResource, Resource, ResourcePage, ResourceUpdate, StatusChange, DEFAULT_PAGE_SIZE,
};
use crate::error::Result;

/// A remote collection of versioned resources.
///
/// Implementations tag every failure at this boundary: transport problems
/// as `Transport`/`Timeout`, server rejections as `Business`/`Conflict`.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
  async fn list(&self, query: &ListQuery) -> Result<ResourcePage>;

  async fn get(&self, id: &str) -> Result<Resource>;

  async fn create(&self, payload: &NewResource) -> Result<Resource>;

  async fn update(&self, id: &str, payload: &ResourceUpdate) -> Result<Resource>;

  async fn update_status(&self, id: &str, change: &StatusChange) -> Result<Resource>;

  async fn delete(&self, id: &str) -> Result<()>;
}

/// Fetch a listing, walking every page unless the query pins one.
///
/// Without a total from the server, a short or empty page ends the walk.
/// A page that repeats the previous one also ends it, for servers that
/// ignore the paging parameters. Each page request is retried independently
/// under `retry`.
pub async fn fetch_all<R: Remote + ?Sized>(
  remote: &R,
  retry: &RetryPolicy,
  query: &ListQuery,
) -> Result<Vec<Resource>> {
  if query.page.is_some() {
    let page = retry.run("list", || remote.list(query)).await?;
    return Ok(page.items);
  }

  let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
  let mut all_items = Vec::new();
  let mut page_number = 1u32;
  let mut previous_first: Option<String> = None;

  loop {
    let page_query = ListQuery {
      page: Some(page_number),
      page_size: Some(page_size),
      ..query.clone()
    };

    let page = retry.run("list", || remote.list(&page_query)).await?;
    let fetched = page.items.len();
    let first = page.items.first().map(|r| r.id.clone());
    if fetched == 0 || (first.is_some() && first == previous_first) {
      break;
    }
    all_items.extend(page.items);

    let complete = match page.total {
      Some(total) => all_items.len() as u64 >= total,
      None => fetched < page_size as usize,
    };
    if complete {
      break;
    }
    previous_first = first;
    page_number += 1;
  }

  Ok(all_items)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{resource, MemoryRemote};

  #[tokio::test]
  async fn test_fetch_all_walks_pages() {
    let remote = MemoryRemote::with_resources((1..=7).map(|i| resource(&format!("r{}", i), 1)));
    let query = ListQuery {
      page_size: Some(3),
      ..Default::default()
    };

    let items = fetch_all(&remote, &RetryPolicy::default(), &query)
      .await
      .unwrap();

    assert_eq!(items.len(), 7);
    assert_eq!(remote.list_calls(), 3);
  }

  #[tokio::test]
  async fn test_fetch_all_respects_pinned_page() {
    let remote = MemoryRemote::with_resources((1..=7).map(|i| resource(&format!("r{}", i), 1)));
    let query = ListQuery {
      page: Some(3),
      page_size: Some(3),
      ..Default::default()
    };

    let items = fetch_all(&remote, &RetryPolicy::default(), &query)
      .await
      .unwrap();

    assert_eq!(items.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r7"]);
    assert_eq!(remote.list_calls(), 1);
  }
}
