use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::Resource;

/// The newest server view of the collection held in memory, served when
/// the network is unreachable.
///
/// A complete listing replaces it wholesale so deletions on the server
/// drop out. Partial reads and writes merge into it.
#[derive(Debug, Default)]
pub(crate) struct LastKnown {
  resources: Mutex<Vec<Resource>>,
}

impl LastKnown {
  pub(crate) fn replace(&self, resources: &[Resource]) {
    *self.lock() = resources.to_vec();
  }

  pub(crate) fn remember(&self, resources: &[Resource]) {
    let mut known = self.lock();
    for resource in resources {
      match known.iter_mut().find(|r| r.id == resource.id) {
        Some(existing) => *existing = resource.clone(),
        None => known.push(resource.clone()),
      }
    }
  }

  pub(crate) fn forget(&self, id: &str) {
    self.lock().retain(|r| r.id != id);
  }

  pub(crate) fn by_id(&self, id: &str) -> Option<Resource> {
    self.lock().iter().find(|r| r.id == id).cloned()
  }

  pub(crate) fn snapshot(&self) -> Vec<Resource> {
    self.lock().clone()
  }

  fn lock(&self) -> MutexGuard<'_, Vec<Resource>> {
    self.resources.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::resource;

  fn ids(known: &LastKnown) -> Vec<String> {
    known.snapshot().into_iter().map(|r| r.id).collect()
  }

  #[test]
  fn test_remember_merges_and_replace_prunes() {
    let known = LastKnown::default();
    known.remember(&[resource("a", 1), resource("b", 1)]);
    known.remember(&[resource("b", 2)]);
    assert_eq!(ids(&known), vec!["a", "b"]);
    assert_eq!(known.by_id("b").map(|r| r.version), Some(2));

    known.replace(&[resource("a", 3)]);
    assert_eq!(ids(&known), vec!["a"]);
    assert_eq!(known.by_id("b"), None);
  }
}
