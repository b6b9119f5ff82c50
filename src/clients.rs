//! Open caller contexts (tabs) and the notices pushed to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use crate::control::ControlReply;

pub type ClientId = u64;

/// Something the worker pushes to a client without being asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientNotice {
  /// A new generation is authoritative; the client should reload.
  ControllerChanged { version: String },
  /// A control message broadcast to every client
  Message { message: ControlReply },
}

struct ClientEntry {
  url: Url,
  /// Version of the worker controlling this client, if any
  controller: Option<String>,
  tx: mpsc::UnboundedSender<ClientNotice>,
}

/// Receiving end held by a connected client.
pub struct ClientHandle {
  pub id: ClientId,
  rx: mpsc::UnboundedReceiver<ClientNotice>,
}

impl ClientHandle {
  /// Wait for the next notice. `None` once the client was disconnected.
  pub async fn next(&mut self) -> Option<ClientNotice> {
    self.rx.recv().await
  }

  /// Next notice if one is already queued.
  pub fn try_next(&mut self) -> Option<ClientNotice> {
    self.rx.try_recv().ok()
  }
}

#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  clients: Mutex<HashMap<ClientId, ClientEntry>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
    // The map stays consistent even if a holder panicked mid-operation.
    self.clients.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a client, optionally already controlled by `controller`.
  pub fn connect(&self, url: Url, controller: Option<String>) -> ClientHandle {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, rx) = mpsc::unbounded_channel();
    self.lock().insert(
      id,
      ClientEntry {
        url,
        controller,
        tx,
      },
    );
    ClientHandle { id, rx }
  }

  pub fn disconnect(&self, id: ClientId) -> bool {
    self.lock().remove(&id).is_some()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn controller_of(&self, id: ClientId) -> Option<String> {
    self.lock().get(&id).and_then(|c| c.controller.clone())
  }

  /// Lowest-id client currently showing `url`.
  pub fn find_by_url(&self, url: &Url) -> Option<ClientId> {
    self
      .lock()
      .iter()
      .filter(|(_, c)| &c.url == url)
      .map(|(id, _)| *id)
      .min()
  }

  /// Clients controlled by a version other than `version`.
  pub fn controlled_by_other(&self, version: &str) -> usize {
    self
      .lock()
      .values()
      .filter(|c| c.controller.as_deref().is_some_and(|v| v != version))
      .count()
  }

  /// Take control of every client. Clients whose controller changed are notified.
  /// Returns the number of clients notified.
  pub fn claim(&self, version: &str) -> usize {
    let mut clients = self.lock();
    let mut changed = 0;
    for client in clients.values_mut() {
      if client.controller.as_deref() == Some(version) {
        continue;
      }
      client.controller = Some(version.to_string());
      let notice = ClientNotice::ControllerChanged {
        version: version.to_string(),
      };
      if client.tx.send(notice).is_ok() {
        changed += 1;
      }
    }
    changed
  }

  /// Send a message to every client. Returns how many received it.
  pub fn broadcast(&self, message: ControlReply) -> usize {
    self
      .lock()
      .values()
      .filter(|c| {
        c.tx
          .send(ClientNotice::Message {
            message: message.clone(),
          })
          .is_ok()
      })
      .count()
  }
}
