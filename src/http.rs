//! Request and response values exchanged at the fetch-intercept boundary.

use std::borrow::Cow;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the caller issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Full page load
  Navigate,
  /// Sub-resource restricted to the scope's origin
  SameOrigin,
  /// Cross-origin request that asked for CORS
  Cors,
  /// Cross-origin request without CORS; the response is opaque
  #[default]
  NoCors,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
    }
  }

  /// A sub-resource GET.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A full-page navigation.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_mode(RequestMode::Navigate)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Response type as seen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response exposed through CORS
  Cors,
  /// Cross-origin response whose status and body are hidden
  Opaque,
  /// Produced locally, never from the network
  Synthetic,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Synthetic => "synthetic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "synthetic" => Some(Self::Synthetic),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, kind: ResponseKind, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind,
    }
  }

  /// Opaque responses report status 0 and carry no readable body.
  pub fn opaque() -> Self {
    Self::new(0, ResponseKind::Opaque, Vec::new())
  }

  /// Stand-in returned when neither network nor cache can answer.
  pub fn service_unavailable() -> Self {
    Self::new(503, ResponseKind::Synthetic, "Offline - content not available")
      .with_header("content-type", "text/plain; charset=utf-8")
  }

  pub fn json(status: u16, body: Vec<u8>) -> Self {
    Self::new(status, ResponseKind::Synthetic, body)
      .with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_opaque(&self) -> bool {
    self.kind == ResponseKind::Opaque
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}
