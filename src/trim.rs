//! Periodic FIFO trimming of the dynamic generation.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::cache::CacheStorage;

/// Caps a generation at a fixed number of entries, evicting oldest-inserted first.
/// Only insertion order is tracked; reads do not keep an entry alive. Internal keys such as
/// the project document are not counted against the cap.
#[derive(Clone)]
pub struct Trimmer {
  storage: Arc<dyn CacheStorage>,
  generation: String,
  cap: usize,
}

impl Trimmer {
  pub fn new(storage: Arc<dyn CacheStorage>, generation: &str, cap: usize) -> Self {
    Self {
      storage,
      generation: generation.to_string(),
      cap,
    }
  }

  /// Trim once. Returns the number of evicted entries.
  pub fn trim(&self) -> Result<usize> {
    self.trim_to(self.cap)
  }

  pub fn trim_to(&self, cap: usize) -> Result<usize> {
    let evicted = self.storage.evict_oldest(&self.generation, cap)?;
    if evicted > 0 {
      info!(generation = %self.generation, evicted, cap, "Trimmed cache");
    }
    Ok(evicted)
  }

  /// Sweep every `period` for as long as the process lives. The first sweep runs one
  /// period after spawning; the last-run time is not persisted.
  pub fn spawn(self, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately.
      ticker.tick().await;

      loop {
        ticker.tick().await;
        if let Err(e) = self.trim() {
          warn!(generation = %self.generation, error = %e, "Trim failed");
        }
      }
    })
  }
}
