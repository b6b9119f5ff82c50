//! Control channel between callers and the worker.
//!
//! Callers post tagged `{type, payload}` messages. Request/response style messages carry a
//! oneshot reply port; the rest are fire-and-forget.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::document::ProjectDocument;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Promote the waiting version now
  SkipWaiting,
  /// Replace the stored project document
  CacheProject { project: ProjectDocument },
  GetCachedProject,
  GetCacheStatus,
  /// Delete every generation except the current static one. Destroys the document.
  ClearCache,
  /// Tell every client a sync started
  SyncData,
}

#[derive(Deserialize)]
struct RawMessage {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default, alias = "data")]
  payload: Option<Value>,
}

#[derive(Deserialize)]
struct CacheProjectPayload {
  project: ProjectDocument,
}

impl ControlMessage {
  /// Decode a message, dispatching on `type` only.
  ///
  /// Unknown types and malformed payloads yield `None`; callers drop those silently.
  pub fn from_json(value: Value) -> Option<Self> {
    let raw: RawMessage = match serde_json::from_value(value) {
      Ok(raw) => raw,
      Err(e) => {
        debug!(error = %e, "Ignoring message without a type");
        return None;
      }
    };

    let message = match raw.kind.as_str() {
      "SKIP_WAITING" => Self::SkipWaiting,
      "CACHE_PROJECT" => {
        let payload: CacheProjectPayload = match raw.payload.map(serde_json::from_value) {
          Some(Ok(payload)) => payload,
          Some(Err(e)) => {
            debug!(error = %e, "Ignoring CACHE_PROJECT with unreadable payload");
            return None;
          }
          None => {
            debug!("Ignoring CACHE_PROJECT without payload");
            return None;
          }
        };
        Self::CacheProject {
          project: payload.project,
        }
      }
      "GET_CACHED_PROJECT" => Self::GetCachedProject,
      "GET_CACHE_STATUS" => Self::GetCacheStatus,
      "CLEAR_CACHE" => Self::ClearCache,
      "SYNC_DATA" => Self::SyncData,
      other => {
        debug!(kind = other, "Ignoring unknown message type");
        return None;
      }
    };

    Some(message)
  }
}

/// Messages the worker sends back (on a reply port) or broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
  /// Acknowledges CACHE_PROJECT when a reply port was attached
  ProjectCached,
  CachedProject { project: ProjectDocument },
  NoCachedProject,
  CacheStatus { caches: Vec<String>, available: bool },
  SyncProject,
}

/// A message plus its optional reply port.
#[derive(Debug)]
pub struct Envelope {
  pub message: ControlMessage,
  pub reply: Option<oneshot::Sender<ControlReply>>,
}

impl Envelope {
  /// Answer on the reply port, if the sender attached one and is still listening.
  pub fn respond(self, reply: ControlReply) {
    if let Some(port) = self.reply {
      let _ = port.send(reply);
    }
  }
}

/// Cloneable caller-side handle of the control channel.
#[derive(Clone)]
pub struct ControlPort {
  tx: mpsc::Sender<Envelope>,
}

/// Create a control channel with room for `capacity` queued messages.
pub fn channel(capacity: usize) -> (ControlPort, mpsc::Receiver<Envelope>) {
  let (tx, rx) = mpsc::channel(capacity);
  (ControlPort { tx }, rx)
}

impl ControlPort {
  /// Post without a reply port.
  pub async fn post(&self, message: ControlMessage) -> Result<()> {
    self
      .tx
      .send(Envelope {
        message,
        reply: None,
      })
      .await
      .map_err(|_| eyre!("Control channel closed"))
  }

  /// Post with a reply port and wait for the answer.
  /// `None` means the handler finished without replying.
  pub async fn request(&self, message: ControlMessage) -> Result<Option<ControlReply>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        message,
        reply: Some(reply_tx),
      })
      .await
      .map_err(|_| eyre!("Control channel closed"))?;

    Ok(reply_rx.await.ok())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_simple_types() {
    assert_eq!(
      ControlMessage::from_json(json!({ "type": "SKIP_WAITING" })),
      Some(ControlMessage::SkipWaiting)
    );
    assert_eq!(
      ControlMessage::from_json(json!({ "type": "GET_CACHE_STATUS", "payload": null })),
      Some(ControlMessage::GetCacheStatus)
    );
    assert_eq!(
      ControlMessage::from_json(json!({ "type": "SYNC_DATA" })),
      Some(ControlMessage::SyncData)
    );
  }

  #[test]
  fn test_parse_cache_project_accepts_data_alias() {
    let message = ControlMessage::from_json(json!({
      "type": "CACHE_PROJECT",
      "data": { "project": { "title": "Birdhouse", "steps": [] } }
    }));
    match message {
      Some(ControlMessage::CacheProject { project }) => {
        assert_eq!(project.title.as_deref(), Some("Birdhouse"))
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_unknown_and_malformed_are_ignored() {
    assert_eq!(ControlMessage::from_json(json!({ "type": "REBOOT" })), None);
    assert_eq!(ControlMessage::from_json(json!({ "kind": "SKIP_WAITING" })), None);
    assert_eq!(ControlMessage::from_json(json!("SKIP_WAITING")), None);
    assert_eq!(ControlMessage::from_json(json!({ "type": "CACHE_PROJECT" })), None);
  }

  #[test]
  fn test_reply_wire_format() {
    let status = ControlReply::CacheStatus {
      caches: vec!["app-static-v1".into()],
      available: true,
    };
    assert_eq!(
      serde_json::to_value(&status).unwrap(),
      json!({ "type": "CACHE_STATUS", "caches": ["app-static-v1"], "available": true })
    );
    assert_eq!(
      serde_json::to_value(ControlReply::NoCachedProject).unwrap(),
      json!({ "type": "NO_CACHED_PROJECT" })
    );
    assert_eq!(
      serde_json::to_value(ControlMessage::ClearCache).unwrap(),
      json!({ "type": "CLEAR_CACHE" })
    );
  }

  #[tokio::test]
  async fn test_request_without_answer_is_none() {
    let (port, mut rx) = channel(4);
    let handler = tokio::spawn(async move {
      let envelope = rx.recv().await.unwrap();
      assert_eq!(envelope.message, ControlMessage::ClearCache);
      drop(envelope);
    });
    assert_eq!(port.request(ControlMessage::ClearCache).await.unwrap(), None);
    handler.await.unwrap();
  }
}
