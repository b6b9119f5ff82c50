use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::generation::{Generation, Role};

/// Scheme of internal cache keys that never come from the network.
pub const DOCUMENT_SCHEME: &str = "offcache";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix shared by every generation name (e.g. "portfolio-builder")
  pub app_name: String,
  /// Build version tag; a new tag means new generations on the next install
  pub version: String,
  /// Scope URL the worker controls. Always ends with '/'.
  #[serde(deserialize_with = "deserialize_scope")]
  pub scope: Url,
  /// Assets fetched into the static generation at install, relative to scope
  #[serde(default)]
  pub static_assets: Vec<String>,
  /// Page served to navigation requests when the network is unreachable
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Requests whose path starts with this prefix use the network-first strategy
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Fixed key the project document is stored under (as `offcache:{key}`)
  #[serde(default = "default_document_key")]
  pub document_key: String,
  /// Cap applied to the dynamic generation by the trimming sweep
  #[serde(default = "default_max_dynamic_entries")]
  pub max_dynamic_entries: usize,
  #[serde(default = "default_trim_interval_secs")]
  pub trim_interval_secs: u64,
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
  /// Cache database location (default: $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
}

fn default_offline_page() -> String {
  "offline.html".to_string()
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_document_key() -> String {
  "cached-project".to_string()
}

fn default_max_dynamic_entries() -> usize {
  50
}

fn default_trim_interval_secs() -> u64 {
  24 * 60 * 60
}

fn default_fetch_timeout_secs() -> u64 {
  30
}

fn deserialize_scope<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  let with_slash = if raw.ends_with('/') {
    raw
  } else {
    format!("{}/", raw)
  };
  Url::parse(&with_slash).map_err(serde::de::Error::custom)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offcache/config.yaml\n\
                 See offcache.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  /// Parse and validate a YAML configuration document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid configuration: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.app_name.trim().is_empty() {
      return Err(eyre!("app_name must not be empty"));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if !matches!(self.scope.scheme(), "http" | "https") {
      return Err(eyre!("scope must be an http(s) URL, got {}", self.scope));
    }
    // Resolve everything once so bad entries fail at startup, not at install.
    self.precache_urls()?;
    self.document_url()?;
    Ok(())
  }

  /// Resolve a path relative to the scope.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .scope
      .join(path)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", path, self.scope, e))
  }

  /// Every URL the install step must fetch: the static assets plus the offline page.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    let mut urls = Vec::with_capacity(self.static_assets.len() + 1);
    for asset in self.static_assets.iter().chain(std::iter::once(&self.offline_page)) {
      let url = self.resolve(asset)?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }
    Ok(urls)
  }

  pub fn offline_page_url(&self) -> Result<Url> {
    self.resolve(&self.offline_page)
  }

  /// Key the project document lives under. It uses its own scheme so no intercepted
  /// request (always http/https) can ever read or overwrite it.
  pub fn document_url(&self) -> Result<Url> {
    let key = self.document_key.trim();
    if key.is_empty() {
      return Err(eyre!("document_key must not be empty"));
    }
    Url::parse(&format!("{}:{}", DOCUMENT_SCHEME, key))
      .map_err(|e| eyre!("Invalid document_key '{}': {}", self.document_key, e))
  }

  /// Absolute path prefix that marks API requests.
  pub fn api_path_prefix(&self) -> String {
    match self.resolve(&self.api_prefix) {
      Ok(url) => url.path().to_string(),
      Err(_) => self.api_prefix.clone(),
    }
  }

  /// The app root, opened by notification clicks.
  pub fn root_url(&self) -> &Url {
    &self.scope
  }

  pub fn static_generation(&self) -> Generation {
    Generation::new(&self.app_name, Role::Static, &self.version)
  }

  pub fn dynamic_generation(&self) -> Generation {
    Generation::new(&self.app_name, Role::Dynamic, &self.version)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn trim_interval(&self) -> Duration {
    Duration::from_secs(self.trim_interval_secs)
  }

  /// Database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"
app_name: portfolio-builder
version: v2
scope: https://example.test/PortfolioBuilder
static_assets:
  - ./
  - index.html
  - manifest.json
  - offline.html
"#;

  #[test]
  fn test_defaults_applied() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.scope.as_str(), "https://example.test/PortfolioBuilder/");
    assert_eq!(config.offline_page, "offline.html");
    assert_eq!(config.max_dynamic_entries, 50);
    assert_eq!(config.fetch_timeout(), Duration::from_secs(30));
    assert_eq!(config.trim_interval(), Duration::from_secs(86_400));
  }

  #[test]
  fn test_precache_urls_resolved_and_deduplicated() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    let urls: Vec<String> = config
      .precache_urls()
      .unwrap()
      .into_iter()
      .map(String::from)
      .collect();
    assert_eq!(
      urls,
      vec![
        "https://example.test/PortfolioBuilder/",
        "https://example.test/PortfolioBuilder/index.html",
        "https://example.test/PortfolioBuilder/manifest.json",
        "https://example.test/PortfolioBuilder/offline.html",
      ]
    );
  }

  #[test]
  fn test_api_prefix_absolute_and_relative() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.api_path_prefix(), "/api/");

    let relative = Config::from_yaml(&format!("{}api_prefix: data/\n", SAMPLE)).unwrap();
    assert_eq!(relative.api_path_prefix(), "/PortfolioBuilder/data/");
  }

  #[test]
  fn test_generation_names() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.static_generation().name(), "portfolio-builder-static-v2");
    assert_eq!(config.dynamic_generation().name(), "portfolio-builder-dynamic-v2");
  }

  #[test]
  fn test_document_url_outside_http_keyspace() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    let url = config.document_url().unwrap();
    assert_eq!(url.as_str(), "offcache:cached-project");
    assert_ne!(url, config.resolve("cached-project").unwrap());
  }

  #[test]
  fn test_rejects_non_http_scope() {
    let yaml = "app_name: a\nversion: v1\nscope: file:///tmp/app\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_rejects_empty_version() {
    let yaml = "app_name: a\nversion: ' '\nscope: https://example.test/\n";
    assert!(Config::from_yaml(yaml).is_err());
  }
}
