//! Request interception and the caching strategies.
//!
//! Every intercepted GET falls into exactly one bucket, checked in order:
//! 1. Navigation: network first, offline page from the static generation on failure
//! 2. API path: network first, last good copy from the dynamic generation on failure
//! 3. Anything else: cache first, refreshed in the background

use std::sync::Arc;

use reqwest::Method;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, RequestKey};
use crate::http::{Request, Response, ResponseKind};
use crate::network::Network;
use crate::tasks::BackgroundTasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Network, then the stored offline page
  NavigationFallback,
  /// Network, then the last cached copy
  NetworkFirst,
  /// Cache, then network; cache hits are refreshed in the background
  CacheFirst,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
  Network,
  Cache,
  OfflinePage,
  /// Nothing could answer; a 503 was produced locally
  Synthetic,
}

#[derive(Debug, Clone)]
pub struct Interception {
  pub response: Response,
  pub source: ResponseSource,
  pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the caller goes to the network itself
  Passthrough,
  Respond(Interception),
}

impl FetchOutcome {
  pub fn interception(&self) -> Option<&Interception> {
    match self {
      Self::Passthrough => None,
      Self::Respond(interception) => Some(interception),
    }
  }
}

pub struct Interceptor {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  static_generation: String,
  dynamic_generation: String,
  offline_page: RequestKey,
  api_prefix: String,
  background: BackgroundTasks,
}

impl Interceptor {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    static_generation: &str,
    dynamic_generation: &str,
    offline_page: &Url,
    api_prefix: &str,
    background: BackgroundTasks,
  ) -> Self {
    Self {
      storage,
      network,
      static_generation: static_generation.to_string(),
      dynamic_generation: dynamic_generation.to_string(),
      offline_page: RequestKey::get(offline_page),
      api_prefix: api_prefix.to_string(),
      background,
    }
  }

  /// Pick the strategy for a request, or `None` if it must not be intercepted.
  pub fn classify(&self, request: &Request) -> Option<Strategy> {
    if request.method != Method::GET || !request.is_http() {
      return None;
    }
    if request.is_navigation() {
      return Some(Strategy::NavigationFallback);
    }
    if request.url.path().starts_with(&self.api_prefix) {
      return Some(Strategy::NetworkFirst);
    }
    Some(Strategy::CacheFirst)
  }

  pub async fn handle(&self, request: &Request) -> FetchOutcome {
    let Some(strategy) = self.classify(request) else {
      debug!(method = %request.method, url = %request.url, "Passing through");
      return FetchOutcome::Passthrough;
    };

    let (response, source) = match strategy {
      Strategy::NavigationFallback => self.navigation(request).await,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
    };
    debug!(url = %request.url, ?strategy, ?source, status = response.status, "Responding");

    FetchOutcome::Respond(Interception {
      response,
      source,
      strategy,
    })
  }

  async fn navigation(&self, request: &Request) -> (Response, ResponseSource) {
    match self.network.fetch(request).await {
      Ok(response) => (response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Navigation failed, serving offline page");
        match self.lookup(&self.static_generation, &self.offline_page) {
          Some(cached) => (cached.response, ResponseSource::OfflinePage),
          None => (Response::service_unavailable(), ResponseSource::Synthetic),
        }
      }
    }
  }

  async fn network_first(&self, request: &Request) -> (Response, ResponseSource) {
    let key = RequestKey::get(&request.url);
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() && !response.is_opaque() {
          self.store(&self.dynamic_generation, &key, &response);
        }
        (response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");
        match self.lookup(&self.dynamic_generation, &key) {
          Some(cached) => (cached.response, ResponseSource::Cache),
          None => (Response::service_unavailable(), ResponseSource::Synthetic),
        }
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> (Response, ResponseSource) {
    let key = RequestKey::get(&request.url);
    let cached = self
      .lookup(&self.static_generation, &key)
      .or_else(|| self.lookup(&self.dynamic_generation, &key));

    if let Some(cached) = cached {
      self.refresh_in_background(request.clone(), key);
      return (cached.response, ResponseSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        // Opaque responses can't be checked, so only same-origin 200s are kept.
        if response.status == 200 && response.kind == ResponseKind::Basic {
          self.store(&self.dynamic_generation, &key, &response);
        }
        (response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Cache miss and network failed");
        (Response::service_unavailable(), ResponseSource::Synthetic)
      }
    }
  }

  fn refresh_in_background(&self, request: Request, key: RequestKey) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let generation = self.dynamic_generation.clone();

    self.background.spawn(async move {
      match network.fetch(&request).await {
        Ok(response) if response.status == 200 => {
          if let Err(e) = storage.put(&generation, &key, &response) {
            warn!(url = %request.url, error = %e, "Background refresh not stored");
          } else {
            debug!(url = %request.url, "Background refresh stored");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Background refresh skipped")
        }
        Err(e) => debug!(url = %request.url, error = %e, "Background refresh failed"),
      }
    });
  }

  /// Store failures count as misses.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.get(generation, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(generation, url = %key.url(), error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Store failures are logged and otherwise ignored.
  fn store(&self, generation: &str, key: &RequestKey, response: &Response) {
    if let Err(e) = self.storage.put(generation, key, response) {
      warn!(generation, url = %key.url(), error = %e, "Cache write failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::RequestMode;
  use crate::network::mock::MockNetwork;

  const SCOPE: &str = "https://example.test/app/";
  const STATIC: &str = "app-static-v1";
  const DYNAMIC: &str = "app-dynamic-v1";

  struct Fixture {
    storage: Arc<SqliteStorage>,
    network: Arc<MockNetwork>,
    background: BackgroundTasks,
    interceptor: Interceptor,
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(MockNetwork::new());
    let background = BackgroundTasks::new();
    let interceptor = Interceptor::new(
      storage.clone(),
      network.clone(),
      STATIC,
      DYNAMIC,
      &url("offline.html"),
      "/api/",
      background.clone(),
    );
    Fixture {
      storage,
      network,
      background,
      interceptor,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
  }

  fn ok(body: &str) -> Response {
    Response::new(200, ResponseKind::Basic, body)
  }

  async fn respond(f: &Fixture, request: Request) -> Interception {
    match f.interceptor.handle(&request).await {
      FetchOutcome::Respond(interception) => interception,
      FetchOutcome::Passthrough => panic!("request was not intercepted"),
    }
  }

  #[test]
  fn test_classification_order() {
    let f = fixture();
    let i = &f.interceptor;
    assert_eq!(
      i.classify(&Request::navigate(url("/api/page"))),
      Some(Strategy::NavigationFallback)
    );
    assert_eq!(i.classify(&Request::get(url("/api/items"))), Some(Strategy::NetworkFirst));
    assert_eq!(i.classify(&Request::get(url("style.css"))), Some(Strategy::CacheFirst));

    // The API prefix is matched on the path alone, whatever the origin.
    let foreign_api = Request::get(Url::parse("https://other.test/api/items").unwrap());
    assert_eq!(i.classify(&foreign_api), Some(Strategy::NetworkFirst));
  }

  #[tokio::test]
  async fn test_non_get_and_non_http_pass_through() {
    let f = fixture();
    let post = Request::new(Method::POST, url("/api/items"));
    let data = Request::get(Url::parse("data:text/plain,hi").unwrap());

    assert!(matches!(f.interceptor.handle(&post).await, FetchOutcome::Passthrough));
    assert!(matches!(f.interceptor.handle(&data).await, FetchOutcome::Passthrough));
    assert_eq!(f.network.call_count(url("/api/items").as_str()), 0);
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_offline_page() {
    let f = fixture();
    f.storage
      .put(STATIC, &RequestKey::get(&url("offline.html")), &ok("<h1>Offline</h1>"))
      .unwrap();
    // A cached copy of the page itself must not be used for navigations.
    f.storage
      .put(DYNAMIC, &RequestKey::get(&url("index.html")), &ok("stale index"))
      .unwrap();
    f.network.set_offline(true);

    let result = respond(&f, Request::navigate(url("index.html"))).await;
    assert_eq!(result.source, ResponseSource::OfflinePage);
    assert_eq!(result.response.body, b"<h1>Offline</h1>");
  }

  #[tokio::test]
  async fn test_navigation_online_uses_network() {
    let f = fixture();
    f.network.respond_text(url("index.html").as_str(), "fresh index");

    let result = respond(&f, Request::navigate(url("index.html"))).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.text(), "fresh index");
    assert!(f.storage.get(DYNAMIC, &RequestKey::get(&url("index.html"))).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_navigation_without_offline_page_is_503() {
    let f = fixture();
    f.network.set_offline(true);
    let result = respond(&f, Request::navigate(url("index.html"))).await;
    assert_eq!(result.source, ResponseSource::Synthetic);
    assert_eq!(result.response.status, 503);
  }

  #[tokio::test]
  async fn test_api_network_first_stores_and_falls_back() {
    let f = fixture();
    let items = url("/api/items");
    f.network.respond_text(items.as_str(), "[1,2,3]");

    let online = respond(&f, Request::get(items.clone())).await;
    assert_eq!(online.source, ResponseSource::Network);

    f.network.set_offline(true);
    let offline = respond(&f, Request::get(items.clone())).await;
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.text(), "[1,2,3]");
  }

  #[tokio::test]
  async fn test_api_error_status_not_cached() {
    let f = fixture();
    let items = url("/api/items");
    f.network
      .respond(items.as_str(), Response::new(500, ResponseKind::Basic, "boom"));

    let result = respond(&f, Request::get(items.clone())).await;
    assert_eq!(result.response.status, 500);
    assert!(f.storage.get(DYNAMIC, &RequestKey::get(&items)).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_api_offline_without_copy_is_503() {
    let f = fixture();
    f.network.set_offline(true);
    let result = respond(&f, Request::get(url("/api/items"))).await;
    assert_eq!(result.source, ResponseSource::Synthetic);
    assert_eq!(result.response.status, 503);
  }

  #[tokio::test]
  async fn test_cache_first_hit_returns_cached_and_refreshes() {
    let f = fixture();
    let css = url("style.css");
    f.storage
      .put(STATIC, &RequestKey::get(&css), &ok("old"))
      .unwrap();
    f.network.respond_text(css.as_str(), "new");

    let result = respond(&f, Request::get(css.clone())).await;
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.text(), "old");

    f.background.wait_idle().await;
    let refreshed = f.storage.get(DYNAMIC, &RequestKey::get(&css)).unwrap().unwrap();
    assert_eq!(refreshed.response.text(), "new");
  }

  #[tokio::test]
  async fn test_cache_first_refresh_ignores_non_200() {
    let f = fixture();
    let js = url("app.js");
    f.storage.put(DYNAMIC, &RequestKey::get(&js), &ok("v1")).unwrap();
    f.network
      .respond(js.as_str(), Response::new(404, ResponseKind::Basic, "gone"));

    respond(&f, Request::get(js.clone())).await;
    f.background.wait_idle().await;
    let kept = f.storage.get(DYNAMIC, &RequestKey::get(&js)).unwrap().unwrap();
    assert_eq!(kept.response.text(), "v1");
  }

  #[tokio::test]
  async fn test_cache_first_miss_caches_basic_200() {
    let f = fixture();
    let img = url("logo.png");
    f.network.respond_text(img.as_str(), "png");

    let result = respond(&f, Request::get(img.clone())).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert!(f.storage.get(DYNAMIC, &RequestKey::get(&img)).unwrap().is_some());

    f.network.set_offline(true);
    let again = respond(&f, Request::get(img)).await;
    assert_eq!(again.source, ResponseSource::Cache);
  }

  #[tokio::test]
  async fn test_opaque_response_never_cached() {
    let f = fixture();
    let font = Url::parse("https://fonts.example.test/font.woff2").unwrap();
    f.network.respond(font.as_str(), Response::opaque());

    let request = Request::get(font.clone()).with_mode(RequestMode::NoCors);
    let result = respond(&f, request).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert!(result.response.is_opaque());
    assert!(f.storage.get(DYNAMIC, &RequestKey::get(&font)).unwrap().is_none());
    assert_eq!(f.storage.len(DYNAMIC).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_503() {
    let f = fixture();
    f.network.set_offline(true);
    let result = respond(&f, Request::get(url("missing.js"))).await;
    assert_eq!(result.source, ResponseSource::Synthetic);
    assert_eq!(result.response.status, 503);
  }
}
