//! Core traits and types for the cache store.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::Response;

/// Normalized request identity: method + absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { method, url }
  }

  /// Key for a GET of `url`, the only cacheable method.
  pub fn get(url: &Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 of "METHOD url" for stable, fixed-length keys
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
  /// Insertion order within the generation; higher is newer
  pub seq: i64,
}

/// Trait for cache storage backends.
///
/// Generations are created implicitly by the first write into them. Every write replaces the
/// whole snapshot under its key; no write leaves a partially stored entry behind.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, name: &str) -> Result<()>;

  /// Names of every generation, oldest first.
  fn generations(&self) -> Result<Vec<String>>;

  fn has_generation(&self, name: &str) -> Result<bool>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete_generation(&self, name: &str) -> Result<bool>;

  /// Store a snapshot, replacing any previous one under the same key.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several snapshots in one transaction: either all are written or none.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  fn delete(&self, generation: &str, key: &RequestKey) -> Result<bool>;

  /// Keys of a generation in insertion order.
  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>>;

  fn len(&self, generation: &str) -> Result<usize>;

  /// Evict oldest-inserted http(s) entries until at most `keep` of them remain. Entries under
  /// internal keys (any other scheme) are neither counted nor evicted. Returns the number
  /// evicted.
  fn evict_oldest(&self, generation: &str, keep: usize) -> Result<usize>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::get(&Url::parse("https://example.test/app.js#top").unwrap());
    let b = RequestKey::get(&Url::parse("https://example.test/app.js").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
  }

  #[test]
  fn test_key_depends_on_method_and_query() {
    let url = Url::parse("https://example.test/api/items?page=1").unwrap();
    let get = RequestKey::get(&url);
    let head = RequestKey::new(Method::HEAD, &url);
    let other = RequestKey::get(&Url::parse("https://example.test/api/items?page=2").unwrap());
    assert_ne!(get.digest(), head.digest());
    assert_ne!(get.digest(), other.digest());
    assert_eq!(get.digest().len(), 64);
  }
}
