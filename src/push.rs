//! Push notification payloads and notification-click routing.

use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BODY: &str = "New update available";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

impl NotificationAction {
  fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: None,
    }
  }
}

/// What a push message asks to display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub badge: Option<String>,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
}

#[derive(Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  actions: Option<Vec<NotificationAction>>,
}

impl Notification {
  /// Build the notification for a push message.
  ///
  /// A JSON payload fills the fields it has; plain text becomes the body; anything missing
  /// falls back to `default_title`, a generic body and open/dismiss actions.
  pub fn from_push(data: Option<&[u8]>, default_title: &str) -> Self {
    let mut notification = Self {
      title: default_title.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: None,
      badge: None,
      actions: vec![
        NotificationAction::new(ClickAction::OPEN, "Open App"),
        NotificationAction::new(ClickAction::DISMISS, "Dismiss"),
      ],
    };

    let Some(data) = data.filter(|d| !d.is_empty()) else {
      return notification;
    };

    match serde_json::from_slice::<PushPayload>(data) {
      Ok(payload) => {
        if let Some(title) = payload.title {
          notification.title = title;
        }
        if let Some(body) = payload.body {
          notification.body = body;
        }
        notification.icon = payload.icon;
        notification.badge = payload.badge;
        if let Some(actions) = payload.actions {
          notification.actions = actions;
        }
      }
      Err(e) => {
        debug!(error = %e, "Push payload is not JSON, using it as body");
        notification.body = String::from_utf8_lossy(data).into_owned();
      }
    }

    notification
  }
}

/// What clicking a notification should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
  /// Bring up the app root
  Open,
  /// Close without doing anything else
  Dismiss,
}

impl ClickAction {
  pub const OPEN: &'static str = "open";
  pub const DISMISS: &'static str = "dismiss";

  /// A click on the notification body (no action) opens the app, like `open`.
  pub fn from_action(action: Option<&str>) -> Self {
    match action {
      Some(Self::DISMISS) => Self::Dismiss,
      _ => Self::Open,
    }
  }
}
