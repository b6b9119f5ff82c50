//! The single "current project" document kept in the dynamic generation.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::http::Response;

/// The user's in-progress work. Stored as given: fields the core does not know about are
/// carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDocument {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub author_title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub website: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub intro: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tools: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reflection: Option<String>,
  /// ISO 8601, set by the caller on every save
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<String>,
  #[serde(default)]
  pub steps: Vec<Step>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
  /// Inline data URL, e.g. "data:image/png;base64,..."
  #[serde(default)]
  pub image: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

pub struct DocumentCache {
  storage: Arc<dyn CacheStorage>,
  generation: String,
  key: RequestKey,
}

impl DocumentCache {
  /// `url` is the fixed key the document lives under inside `generation`; it must not be an
  /// http(s) URL or requests for it would be served from, and refresh, the document.
  pub fn new(storage: Arc<dyn CacheStorage>, generation: &str, url: &Url) -> Self {
    Self {
      storage,
      generation: generation.to_string(),
      key: RequestKey::get(url),
    }
  }

  /// Replace the stored document wholesale. Last write wins.
  pub fn put(&self, document: &ProjectDocument) -> Result<()> {
    let body =
      serde_json::to_vec(document).map_err(|e| eyre!("Failed to serialize project: {}", e))?;
    let response = Response::json(200, body);
    self.storage.put(&self.generation, &self.key, &response)?;
    debug!(generation = %self.generation, title = ?document.title, "Stored project document");
    Ok(())
  }

  /// The stored document, or `None` when nothing was stored (or its generation is gone).
  pub fn get(&self) -> Result<Option<ProjectDocument>> {
    let Some(cached) = self.storage.get(&self.generation, &self.key)? else {
      return Ok(None);
    };

    let document = serde_json::from_slice(&cached.response.body)
      .map_err(|e| eyre!("Stored project document is unreadable: {}", e))?;
    Ok(Some(document))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::json;

  fn cache(storage: Arc<SqliteStorage>) -> DocumentCache {
    let url = Url::parse("offcache:cached-project").unwrap();
    DocumentCache::new(storage, "app-dynamic-v1", &url)
  }

  fn sample() -> ProjectDocument {
    serde_json::from_value(json!({
      "title": "Birdhouse",
      "author": "Sam",
      "authorTitle": "Maker",
      "website": "example.test",
      "lastModified": "2026-10-19T12:00:00.000Z",
      "steps": [
        { "title": "Cut", "description": "Cut the boards", "image": "data:image/png;base64,iVBORw0KGgo=" },
        { "title": "Glue", "description": "Glue them", "image": null }
      ],
      "theme": { "accent": "#336699" }
    }))
    .unwrap()
  }

  #[test]
  fn test_get_empty_is_none() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    assert_eq!(cache(storage).get().unwrap(), None);
  }

  #[test]
  fn test_put_then_get_round_trips() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let documents = cache(storage);
    let doc = sample();

    documents.put(&doc).unwrap();
    let stored = documents.get().unwrap().unwrap();
    assert_eq!(stored, doc);
    assert_eq!(stored.steps[0].image.as_deref(), Some("data:image/png;base64,iVBORw0KGgo="));
    assert_eq!(stored.extra["theme"]["accent"], "#336699");
  }

  #[test]
  fn test_put_is_full_overwrite() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let documents = cache(storage.clone());

    documents.put(&sample()).unwrap();
    documents.put(&sample()).unwrap();
    let replacement = ProjectDocument {
      title: Some("Kite".into()),
      ..Default::default()
    };
    documents.put(&replacement).unwrap();

    assert_eq!(documents.get().unwrap(), Some(replacement));
    assert_eq!(storage.len("app-dynamic-v1").unwrap(), 1);
  }

  #[test]
  fn test_generation_deleted_means_not_found() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let documents = cache(storage.clone());
    documents.put(&sample()).unwrap();

    storage.delete_generation("app-dynamic-v1").unwrap();
    assert_eq!(documents.get().unwrap(), None);
  }
}
