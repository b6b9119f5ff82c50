//! Network access used by the install step and the fetch strategies.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;
use url::{Origin, Url};

use crate::http::{Request, RequestMode, Response, ResponseKind};

#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Request timed out after {0:?}")]
  Timeout(Duration),

  #[error("Network unreachable: {0}")]
  Unreachable(String),

  #[error("Request failed: {0}")]
  Request(#[from] reqwest::Error),
}

/// Something that can put a request on the wire.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// `reqwest`-backed network.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
  client: Client,
  origin: Origin,
  timeout: Duration,
}

impl HttpNetwork {
  /// `scope` decides which responses are same-origin ("basic").
  pub fn new(scope: &Url, timeout: Duration) -> Result<Self, FetchError> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      origin: scope.origin(),
      timeout,
    })
  }

  fn kind_for(&self, request: &Request) -> ResponseKind {
    if request.url.origin() == self.origin || request.is_navigation() {
      return ResponseKind::Basic;
    }
    match request.mode {
      RequestMode::Cors => ResponseKind::Cors,
      _ => ResponseKind::Opaque,
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder.send().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout(self.timeout)
      } else if e.is_connect() {
        FetchError::Unreachable(e.to_string())
      } else {
        FetchError::Request(e)
      }
    })?;

    let kind = self.kind_for(request);
    debug!(url = %request.url, status = response.status().as_u16(), kind = kind.as_str(), "Fetched");

    if kind == ResponseKind::Opaque {
      return Ok(Response::opaque());
    }

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
      kind,
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn network() -> HttpNetwork {
    let scope = Url::parse("https://app.example.test/PortfolioBuilder/").unwrap();
    HttpNetwork::new(&scope, Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn test_same_origin_is_basic() {
    let request = Request::get(Url::parse("https://app.example.test/api/x").unwrap());
    assert_eq!(network().kind_for(&request), ResponseKind::Basic);
  }

  #[test]
  fn test_cross_origin_no_cors_is_opaque() {
    let request = Request::get(Url::parse("https://cdn.example.test/lib.js").unwrap());
    assert_eq!(network().kind_for(&request), ResponseKind::Opaque);

    let cors = request.with_mode(RequestMode::Cors);
    assert_eq!(network().kind_for(&cors), ResponseKind::Cors);
  }

  #[tokio::test]
  async fn test_mock_offline_fails() {
    let mock = mock::MockNetwork::new();
    mock.respond_text("https://example.test/a", "a");
    let request = Request::get(Url::parse("https://example.test/a").unwrap());

    assert_eq!(mock.fetch(&request).await.unwrap().body, b"a");
    mock.set_offline(true);
    assert!(matches!(
      mock.fetch(&request).await,
      Err(FetchError::Unreachable(_))
    ));
    assert_eq!(mock.call_count("https://example.test/a"), 2);
  }
}
