//! Serde-deserializable types matching the collection endpoint's responses.
//!
//! These types are separate from domain types to allow lenient
//! deserialization (loose timestamps, optional fields) while keeping the
//! domain types strict.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::types::{Resource, ResourcePage, ResourceStatus};
use crate::error::{Error, Result};

/// Error code used when a response cannot be understood.
pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";

// ============================================================================
// Envelope
// ============================================================================

/// Every response is wrapped in `{success, data?, error?}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
  pub success: bool,
  pub data: Option<T>,
  pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  pub code: String,
  #[serde(default)]
  pub message: String,
}

impl<T> ApiEnvelope<T> {
  /// Unwrap the payload, turning a failed envelope into a tagged error.
  pub fn into_result(self) -> Result<Option<T>> {
    if self.success {
      return Ok(self.data);
    }
    match self.error {
      Some(body) => Err(Error::from_code(&body.code, body.message)),
      None => Err(Error::business(
        INVALID_RESPONSE,
        "request failed without an error body",
      )),
    }
  }
}

// ============================================================================
// Resource
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
  pub id: String,
  #[serde(default = "first_version")]
  pub version: u64,
  #[serde(default)]
  pub status: ResourceStatus,
  #[serde(alias = "author", alias = "ownerId", default)]
  pub author_id: String,
  #[serde(default)]
  pub title: String,
  pub description: Option<String>,
  #[serde(default)]
  pub content: Value,
  #[serde(default)]
  pub tags: Vec<String>,
  // Timestamps arrive in several shapes, normalized in `into_resource`
  pub created_at: Option<Value>,
  pub updated_at: Option<Value>,
  pub reviewed_at: Option<Value>,
  pub published_at: Option<Value>,
}

fn first_version() -> u64 {
  1
}

impl ApiResource {
  pub fn into_resource(self) -> Result<Resource> {
    let created_at = self
      .created_at
      .as_ref()
      .and_then(normalize_timestamp)
      .ok_or_else(|| {
        Error::business(
          INVALID_RESPONSE,
          format!("resource {} has no usable createdAt", self.id),
        )
      })?;

    Ok(Resource {
      id: self.id,
      version: self.version,
      status: self.status,
      author_id: self.author_id,
      title: self.title,
      description: self.description,
      content: self.content,
      tags: self.tags,
      created_at,
      updated_at: self.updated_at.as_ref().and_then(normalize_timestamp),
      reviewed_at: self.reviewed_at.as_ref().and_then(normalize_timestamp),
      published_at: self.published_at.as_ref().and_then(normalize_timestamp),
    })
  }
}

// ============================================================================
// List responses
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPage {
  #[serde(default)]
  pub items: Vec<ApiResource>,
  #[serde(default)]
  pub total: Option<u64>,
  #[serde(default)]
  pub page: u32,
  #[serde(default)]
  pub page_size: u32,
}

/// List payloads come either paged or as a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiListData {
  Page(ApiPage),
  Items(Vec<ApiResource>),
}

impl ApiListData {
  pub fn into_page(self, requested_page: u32, requested_size: u32) -> Result<ResourcePage> {
    match self {
      Self::Page(page) => {
        let items = page
          .items
          .into_iter()
          .map(ApiResource::into_resource)
          .collect::<Result<Vec<_>>>()?;
        Ok(ResourcePage {
          total: page.total.map(|total| total.max(items.len() as u64)),
          page: if page.page == 0 { requested_page } else { page.page },
          page_size: if page.page_size == 0 {
            requested_size
          } else {
            page.page_size
          },
          items,
        })
      }
      Self::Items(items) => {
        let items = items
          .into_iter()
          .map(ApiResource::into_resource)
          .collect::<Result<Vec<_>>>()?;
        // A bare array says nothing about further pages.
        Ok(ResourcePage {
          total: None,
          page: requested_page,
          page_size: requested_size,
          items,
        })
      }
    }
  }
}

// ============================================================================
// Timestamp normalization
// ============================================================================

/// Epoch values above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Normalize the timestamp shapes the server emits to UTC.
///
/// Accepts RFC 3339 strings, `YYYY-MM-DD HH:MM:SS[.fff]` (assumed UTC) and
/// epoch numbers in seconds or milliseconds. Anything else is `None`.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
  match value {
    Value::String(s) => parse_timestamp_str(s.trim()),
    Value::Number(n) => {
      let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
      if raw.abs() >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
      } else {
        Utc.timestamp_opt(raw, 0).single()
      }
    }
    _ => None,
  }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
  if s.is_empty() {
    return None;
  }
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
      return Some(naive.and_utc());
    }
  }
  s.parse::<i64>()
    .ok()
    .and_then(|n| normalize_timestamp(&Value::from(n)))
}
