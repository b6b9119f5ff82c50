//! Cache generations and the install / activate lifecycle.
//!
//! A build version owns exactly two generations: a static one filled at install time and a
//! dynamic one filled at runtime. Promoting a version deletes every other generation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::clients::ClientRegistry;
use crate::http::Request;
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Build-time assets
  Static,
  /// Runtime-fetched responses and the project document
  Dynamic,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
    }
  }
}

/// A named, versioned cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  name: String,
  role: Role,
  version: String,
}

impl Generation {
  pub fn new(app: &str, role: Role, version: &str) -> Self {
    Self {
      name: format!("{}-{}-{}", app, role.as_str(), version),
      role,
      version: version.to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn version(&self) -> &str {
    &self.version
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Parsed,
  Installing,
  /// Installed and waiting for older versions to let go
  Installed,
  Activating,
  Activated,
  /// Install failed; this version never becomes current
  Redundant,
}

pub struct GenerationManager {
  static_generation: Generation,
  dynamic_generation: Generation,
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  clients: Arc<ClientRegistry>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl GenerationManager {
  pub fn new(
    static_generation: Generation,
    dynamic_generation: Generation,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<ClientRegistry>,
  ) -> Self {
    Self {
      static_generation,
      dynamic_generation,
      storage,
      network,
      clients,
      state: Mutex::new(LifecycleState::Parsed),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn static_generation(&self) -> &Generation {
    &self.static_generation
  }

  pub fn dynamic_generation(&self) -> &Generation {
    &self.dynamic_generation
  }

  pub fn version(&self) -> &str {
    self.static_generation.version()
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<()> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !from.contains(&state) {
      return Err(eyre!("Cannot move from {:?} to {:?}", *state, to));
    }
    debug!(version = self.version(), from = ?*state, ?to, "Lifecycle transition");
    *state = to;
    Ok(())
  }

  fn set_state(&self, to: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
  }

  /// Populate the static generation with every asset, all or nothing.
  ///
  /// Any unreachable asset or non-2xx status fails the install and nothing is written, so a
  /// previously promoted version stays authoritative.
  pub async fn install(&self, assets: &[Url]) -> Result<()> {
    self.transition(
      &[LifecycleState::Parsed, LifecycleState::Redundant],
      LifecycleState::Installing,
    )?;
    info!(generation = %self.static_generation, assets = assets.len(), "Installing");

    let fetches = assets.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let outcome = self.network.fetch(&request).await;
      (url, outcome)
    });

    let mut entries = Vec::with_capacity(assets.len());
    let mut failures = Vec::new();
    for (url, outcome) in join_all(fetches).await {
      match outcome {
        Ok(response) if response.is_success() => {
          entries.push((RequestKey::get(url), response));
        }
        Ok(response) => failures.push(format!("{} (status {})", url, response.status)),
        Err(e) => failures.push(format!("{} ({})", url, e)),
      }
    }

    if !failures.is_empty() {
      self.set_state(LifecycleState::Redundant);
      warn!(generation = %self.static_generation, ?failures, "Install failed");
      return Err(eyre!(
        "Failed to precache {} asset(s): {}",
        failures.len(),
        failures.join(", ")
      ));
    }

    if let Err(e) = self
      .storage
      .put_all(self.static_generation.name(), &entries)
    {
      self.set_state(LifecycleState::Redundant);
      return Err(e.wrap_err("Failed to write static generation"));
    }

    self.set_state(LifecycleState::Installed);
    info!(generation = %self.static_generation, "Installed");
    Ok(())
  }

  /// Bypass waiting for clients of older versions to close.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn is_skipping_wait(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Installed and allowed to take over: skip requested, or nobody runs an older version.
  pub fn can_promote(&self) -> bool {
    self.state() == LifecycleState::Installed
      && (self.is_skipping_wait() || self.clients.controlled_by_other(self.version()) == 0)
  }

  /// Make this version authoritative: drop stale generations and claim every client.
  /// Returns the names of the deleted generations.
  pub fn promote(&self) -> Result<Vec<String>> {
    self.transition(&[LifecycleState::Installed], LifecycleState::Activating)?;
    info!(version = self.version(), "Activating");

    let deleted = self.delete_generations_except(&[
      self.static_generation.name(),
      self.dynamic_generation.name(),
    ]);

    if let Err(e) = self.storage.open_generation(self.dynamic_generation.name()) {
      warn!(generation = %self.dynamic_generation, error = %e, "Failed to open dynamic generation");
    }

    let claimed = self.clients.claim(self.version());
    self.set_state(LifecycleState::Activated);
    info!(version = self.version(), ?deleted, claimed, "Activated");

    Ok(deleted)
  }

  /// Promote if allowed. Returns whether promotion happened.
  pub fn try_promote(&self) -> Result<bool> {
    if !self.can_promote() {
      return Ok(false);
    }
    self.promote().map(|_| true)
  }

  /// Pick up this version if an earlier process already installed it. Returns whether it did.
  ///
  /// The static generation is only ever written whole, so its presence means install
  /// finished. With the dynamic generation also present the version was promoted and is
  /// active again at once; without it (cleared, or never promoted) the version comes back as
  /// `Installed` and goes through the usual waiting rule without refetching anything.
  pub fn resume(&self) -> Result<bool> {
    if !self.storage.has_generation(self.static_generation.name())? {
      return Ok(false);
    }

    if self.storage.has_generation(self.dynamic_generation.name())? {
      self.transition(&[LifecycleState::Parsed], LifecycleState::Activated)?;
      info!(version = self.version(), "Resumed previously activated version");
    } else {
      self.transition(&[LifecycleState::Parsed], LifecycleState::Installed)?;
      info!(version = self.version(), "Resumed installed version");
    }
    Ok(true)
  }

  /// Delete every generation except the current static one.
  pub fn clear(&self) -> Vec<String> {
    let deleted = self.delete_generations_except(&[self.static_generation.name()]);
    info!(?deleted, "Cleared caches");
    deleted
  }

  /// Names of all generations currently in the store.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    self.storage.generations()
  }

  fn delete_generations_except(&self, keep: &[&str]) -> Vec<String> {
    let names = match self.storage.generations() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "Failed to list generations");
        return Vec::new();
      }
    };

    names
      .into_iter()
      .filter(|name| !keep.contains(&name.as_str()))
      .filter(|name| match self.storage.delete_generation(name) {
        Ok(deleted) => deleted,
        Err(e) => {
          warn!(generation = %name, error = %e, "Failed to delete generation");
          false
        }
      })
      .collect()
  }
}
