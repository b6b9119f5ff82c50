//! Work that outlives the event that started it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Tracks fire-and-forget work (background refreshes) so a host can wait for it before
/// shutting down. Dropping the last handle aborts whatever is still running.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  set: Arc<Mutex<JoinSet<()>>>,
  idle: Arc<Idle>,
}

#[derive(Default)]
struct Idle {
  pending: AtomicUsize,
  notify: Notify,
}

/// Held by a running task; finishing, panicking or being aborted all release it.
struct PendingGuard(Arc<Idle>);

impl PendingGuard {
  fn new(idle: Arc<Idle>) -> Self {
    idle.pending.fetch_add(1, Ordering::SeqCst);
    Self(idle)
  }
}

impl Drop for PendingGuard {
  fn drop(&mut self) {
    if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.0.notify.notify_waiters();
    }
  }
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.set.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Must be called from within a tokio runtime.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let guard = PendingGuard::new(Arc::clone(&self.idle));
    let mut set = self.lock();
    // Reap finished tasks so long-lived hosts don't accumulate them.
    while set.try_join_next().is_some() {}
    set.spawn(async move {
      let _guard = guard;
      task.await;
    });
  }

  /// Tasks still running.
  pub fn len(&self) -> usize {
    self.idle.pending.load(Ordering::SeqCst)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Wait until every tracked task, including ones spawned while waiting, has finished.
  /// Dropping this future early leaves the tasks running.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.idle.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if self.is_empty() {
        break;
      }
      notified.await;
    }
    while self.lock().try_join_next().is_some() {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_wait_idle_waits_for_nested_work() {
    let tasks = BackgroundTasks::new();
    let done = Arc::new(AtomicUsize::new(0));

    let inner_tasks = tasks.clone();
    let inner_done = done.clone();
    tasks.spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      inner_done.fetch_add(1, Ordering::SeqCst);
      let nested_done = inner_done.clone();
      inner_tasks.spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        nested_done.fetch_add(1, Ordering::SeqCst);
      });
    });

    tasks.wait_idle().await;
    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert!(tasks.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_wait_leaves_work_running() {
    let tasks = BackgroundTasks::new();
    let done = Arc::new(AtomicUsize::new(0));

    let task_done = done.clone();
    tasks.spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      task_done.fetch_add(1, Ordering::SeqCst);
    });

    let waited = tokio::time::timeout(Duration::from_millis(5), tasks.wait_idle()).await;
    assert!(waited.is_err());
    assert_eq!(tasks.len(), 1);

    tasks.wait_idle().await;
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(tasks.is_empty());
  }
}
