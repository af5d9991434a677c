//! Caching implementations for marketplace types.

use crate::cache::Cacheable;

use super::types::Resource;

impl Cacheable for Resource {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "resource"
  }
}
