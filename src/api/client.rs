use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::api::api_types::{ApiEnvelope, ApiListData, ApiResource, INVALID_RESPONSE};
use crate::api::remote::Remote;
use crate::api::types::{
  ListQuery, NewResource, Resource, ResourcePage, ResourceUpdate, StatusChange, DEFAULT_PAGE_SIZE,
};
use crate::error::{Error, Result, NOT_FOUND};

/// HTTP client for the collection endpoint
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  collection: String,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, collection: &str) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| Error::Transport(format!("invalid base url {}: {}", base_url, e)))?;
    if base_url.cannot_be_a_base() {
      return Err(Error::Transport(format!(
        "base url {} cannot carry a path",
        base_url
      )));
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("marketsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      collection: collection.trim_matches('/').to_string(),
      token: None,
    })
  }

  /// Attach a bearer token to every request.
  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token.filter(|t| !t.trim().is_empty());
    self
  }

  /// `{base}/{collection}/{segments...}` with each segment escaped.
  fn url(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().push(&self.collection);
      for segment in segments {
        path.push(segment);
      }
    }
    url
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self
      .client
      .request(method, url)
      .header("Accept", "application/json");
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// Send a request and unwrap the response envelope.
  async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>> {
    let response = builder.send().await.map_err(classify_reqwest_error)?;
    let status = response.status();
    let body = response.bytes().await.map_err(classify_reqwest_error)?;

    // No content, as a 204 for a delete
    if status.is_success() && body.iter().all(u8::is_ascii_whitespace) {
      return Ok(None);
    }

    match serde_json::from_slice::<ApiEnvelope<T>>(&body) {
      Ok(envelope) => envelope.into_result(),
      // Not an envelope: fall back to the status line
      Err(parse_error) => Err(status_error(status, &body, parse_error)),
    }
  }

  async fn send_resource(&self, builder: RequestBuilder) -> Result<Resource> {
    self
      .send::<ApiResource>(builder)
      .await?
      .ok_or_else(|| Error::business(INVALID_RESPONSE, "response carried no resource"))?
      .into_resource()
  }
}

#[async_trait]
impl Remote for HttpRemote {
  async fn list(&self, query: &ListQuery) -> Result<ResourcePage> {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    let mut params: Vec<(&str, String)> = vec![
      ("page", page.to_string()),
      ("pageSize", page_size.to_string()),
    ];
    if let Some(status) = query.status {
      params.push(("status", status.to_string()));
    }
    if let Some(author) = &query.author {
      params.push(("author", author.clone()));
    }
    if let Some(search) = &query.search {
      params.push(("search", search.clone()));
    }

    let builder = self.request(Method::GET, self.url(&[])).query(&params);
    match self.send::<ApiListData>(builder).await? {
      Some(data) => data.into_page(page, page_size),
      None => Ok(ResourcePage {
        items: Vec::new(),
        total: Some(0),
        page,
        page_size,
      }),
    }
  }

  async fn get(&self, id: &str) -> Result<Resource> {
    self
      .send_resource(self.request(Method::GET, self.url(&[id])))
      .await
  }

  async fn create(&self, payload: &NewResource) -> Result<Resource> {
    self
      .send_resource(self.request(Method::POST, self.url(&[])).json(payload))
      .await
  }

  async fn update(&self, id: &str, payload: &ResourceUpdate) -> Result<Resource> {
    self
      .send_resource(self.request(Method::PUT, self.url(&[id])).json(payload))
      .await
  }

  async fn update_status(&self, id: &str, change: &StatusChange) -> Result<Resource> {
    self
      .send_resource(
        self
          .request(Method::PATCH, self.url(&[id, "status"]))
          .json(change),
      )
      .await
  }

  async fn delete(&self, id: &str) -> Result<()> {
    self
      .send::<Value>(self.request(Method::DELETE, self.url(&[id])))
      .await?;
    Ok(())
  }
}

/// Tag a reqwest failure. Anything that kept the request from completing is
/// a transport problem; the rest never got a usable response either.
fn classify_reqwest_error(e: reqwest::Error) -> Error {
  if e.is_timeout() {
    Error::Transport(format!("request timed out: {}", e))
  } else if e.is_connect() || e.is_request() || e.is_body() {
    Error::Transport(e.to_string())
  } else if e.is_decode() {
    Error::business(INVALID_RESPONSE, e.to_string())
  } else {
    Error::Transport(e.to_string())
  }
}

fn status_error(status: StatusCode, body: &[u8], parse_error: serde_json::Error) -> Error {
  let snippet: String = String::from_utf8_lossy(body).chars().take(200).collect();
  match status {
    StatusCode::NOT_FOUND => Error::business(NOT_FOUND, snippet),
    StatusCode::CONFLICT => Error::Conflict(snippet),
    s if s.is_success() => Error::business(
      INVALID_RESPONSE,
      format!("unreadable response body: {}", parse_error),
    ),
    s => Error::business(format!("HTTP_{}", s.as_u16()), snippet),
  }
}
