use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author id the server uses for resources it owns itself.
pub const SYSTEM_AUTHOR: &str = "system";

/// Lifecycle tag of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
  #[default]
  Draft,
  Pending,
  Published,
  Rejected,
}

impl ResourceStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Draft => "draft",
      Self::Pending => "pending",
      Self::Published => "published",
      Self::Rejected => "rejected",
    }
  }
}

impl fmt::Display for ResourceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "draft" => Ok(Self::Draft),
      "pending" => Ok(Self::Pending),
      "published" => Ok(Self::Published),
      "rejected" => Ok(Self::Rejected),
      other => Err(format!("unknown status '{}'", other)),
    }
  }
}

/// A versioned, server-owned marketplace entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  pub id: String,
  pub version: u64,
  pub status: ResourceStatus,
  pub author_id: String,
  pub title: String,
  pub description: Option<String>,
  pub content: serde_json::Value,
  pub tags: Vec<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: Option<DateTime<Utc>>,
  pub reviewed_at: Option<DateTime<Utc>>,
  pub published_at: Option<DateTime<Utc>>,
}

impl Resource {
  pub fn is_system_owned(&self) -> bool {
    self.author_id == SYSTEM_AUTHOR
  }

  /// Local projection of an update, used for optimistic display.
  pub fn with_update(&self, update: &ResourceUpdate) -> Self {
    let mut next = self.clone();
    if let Some(title) = &update.title {
      next.title = title.clone();
    }
    if let Some(description) = &update.description {
      next.description = Some(description.clone());
    }
    if let Some(content) = &update.content {
      next.content = content.clone();
    }
    if let Some(tags) = &update.tags {
      next.tags = tags.clone();
    }
    next.updated_at = Some(Utc::now());
    next
  }

  /// Local projection of a status change, used for optimistic display.
  pub fn with_status(&self, change: &StatusChange) -> Self {
    let mut next = self.clone();
    next.status = change.status;
    next.updated_at = Some(Utc::now());
    next
  }
}

/// Body of a create call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewResource {
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub content: serde_json::Value,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl NewResource {
  /// Placeholder shown while the server assigns the real id.
  pub fn provisional(&self, id: String, author_id: &str) -> Resource {
    Resource {
      id,
      version: 0,
      status: ResourceStatus::Draft,
      author_id: author_id.to_string(),
      title: self.title.clone(),
      description: self.description.clone(),
      content: self.content.clone(),
      tags: self.tags.clone(),
      created_at: Utc::now(),
      updated_at: None,
      reviewed_at: None,
      published_at: None,
    }
  }
}

/// Body of an update call. `version` is the version the caller last saw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content: Option<serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
  pub version: u64,
}

/// Body of a status change call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
  pub status: ResourceStatus,
  pub version: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

/// Filters for a list call. `page: None` means every page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
  pub page: Option<u32>,
  pub page_size: Option<u32>,
  pub status: Option<ResourceStatus>,
  pub author: Option<String>,
  pub search: Option<String>,
}

impl ListQuery {
  /// Whether this asks for the whole collection: no filters, every page.
  pub fn is_complete_listing(&self) -> bool {
    self.page.is_none() && self.status.is_none() && self.author.is_none() && self.search.is_none()
  }

  /// Whether a resource passes the status/author/search filters.
  pub fn matches(&self, resource: &Resource) -> bool {
    if self.status.is_some_and(|status| status != resource.status) {
      return false;
    }
    if self
      .author
      .as_deref()
      .is_some_and(|author| author != resource.author_id)
    {
      return false;
    }
    match self.search.as_deref().map(str::trim) {
      Some(needle) if !needle.is_empty() => {
        let needle = needle.to_lowercase();
        resource.title.to_lowercase().contains(&needle)
          || resource
            .description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains(&needle))
          || resource.tags.iter().any(|t| t.to_lowercase() == needle)
      }
      _ => true,
    }
  }

  /// Apply filters and paging to locally held data.
  pub fn apply(&self, resources: Vec<Resource>) -> Vec<Resource> {
    let filtered = resources.into_iter().filter(|r| self.matches(r));
    match self.page {
      Some(page) => {
        let size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1) as usize;
        let skip = (page.max(1) as usize - 1) * size;
        filtered.skip(skip).take(size).collect()
      }
      None => filtered.collect(),
    }
  }
}

/// Page size used when a query does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// One page of a list response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourcePage {
  pub items: Vec<Resource>,
  /// `None` when the server answered without a count
  pub total: Option<u64>,
  pub page: u32,
  pub page_size: u32,
}
