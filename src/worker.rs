//! The worker: one value per scope that owns the caches and answers every event.
//!
//! Hosts deliver events through [`Worker::dispatch`] (or the matching direct methods) and
//! must keep the runtime alive until [`Worker::wait_until_idle`] returns, otherwise
//! background cache refreshes are dropped.

use std::sync::Arc;

use color_eyre::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientHandle, ClientId, ClientRegistry};
use crate::config::Config;
use crate::control::{ControlMessage, ControlReply, Envelope};
use crate::document::{DocumentCache, ProjectDocument};
use crate::generation::{GenerationManager, LifecycleState};
use crate::http::Request;
use crate::intercept::{FetchOutcome, Interceptor};
use crate::network::Network;
use crate::push::{ClickAction, Notification};
use crate::tasks::BackgroundTasks;
use crate::trim::Trimmer;

/// Background-sync tag that announces a project sync to every client.
pub const SYNC_PROJECT_TAG: &str = "sync-project";

/// Everything a host can deliver to the worker.
#[derive(Debug)]
pub enum Event {
  Install,
  Activate,
  Fetch(Request),
  Message(Envelope),
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  NotificationClick { action: Option<String> },
}

#[derive(Debug)]
pub enum EventOutcome {
  Done,
  Installed { activated: bool },
  Activated { deleted: Vec<String> },
  Fetch(FetchOutcome),
  ShowNotification(Notification),
  Click(ClickOutcome),
}

/// What the host should do after a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// A client already shows the app root
  FocusClient(ClientId),
  OpenWindow(Url),
  Close,
}

pub struct Worker {
  config: Config,
  clients: Arc<ClientRegistry>,
  generations: GenerationManager,
  interceptor: Interceptor,
  documents: DocumentCache,
  trimmer: Trimmer,
  background: BackgroundTasks,
}

impl Worker {
  pub fn new(
    config: Config,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let static_generation = config.static_generation();
    let dynamic_generation = config.dynamic_generation();
    let clients = Arc::new(ClientRegistry::new());
    let background = BackgroundTasks::new();

    let interceptor = Interceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      static_generation.name(),
      dynamic_generation.name(),
      &config.offline_page_url()?,
      &config.api_path_prefix(),
      background.clone(),
    );
    let documents = DocumentCache::new(
      Arc::clone(&storage),
      dynamic_generation.name(),
      &config.document_url()?,
    );
    let trimmer = Trimmer::new(
      Arc::clone(&storage),
      dynamic_generation.name(),
      config.max_dynamic_entries,
    );
    let generations = GenerationManager::new(
      static_generation,
      dynamic_generation,
      storage,
      network,
      Arc::clone(&clients),
    );

    Ok(Self {
      config,
      clients,
      generations,
      interceptor,
      documents,
      trimmer,
      background,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn state(&self) -> LifecycleState {
    self.generations.state()
  }

  pub fn generations(&self) -> &GenerationManager {
    &self.generations
  }

  pub fn documents(&self) -> &DocumentCache {
    &self.documents
  }

  /// Dispatch table: one handler per event kind.
  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => {
        let activated = self.install().await?;
        Ok(EventOutcome::Installed { activated })
      }
      Event::Activate => {
        let deleted = self.activate()?;
        Ok(EventOutcome::Activated { deleted })
      }
      Event::Fetch(request) => Ok(EventOutcome::Fetch(self.fetch(&request).await)),
      Event::Message(envelope) => {
        self.handle_message(envelope);
        Ok(EventOutcome::Done)
      }
      Event::Sync { tag } => {
        self.sync(&tag);
        Ok(EventOutcome::Done)
      }
      Event::Push { data } => Ok(EventOutcome::ShowNotification(self.push(data.as_deref()))),
      Event::NotificationClick { action } => Ok(EventOutcome::Click(
        self.notification_click(action.as_deref()),
      )),
    }
  }

  /// Resume a version installed by an earlier run, or install and try to promote this one.
  pub async fn start(&self) -> Result<LifecycleState> {
    if self.generations.resume()? {
      self.generations.try_promote()?;
    } else {
      self.install().await?;
    }
    Ok(self.state())
  }

  /// Precache the static assets, then promote unless older clients must be waited for.
  /// Returns whether this version is now active.
  pub async fn install(&self) -> Result<bool> {
    let assets = self.config.precache_urls()?;
    self.generations.install(&assets).await?;
    self.generations.try_promote()
  }

  pub fn activate(&self) -> Result<Vec<String>> {
    self.generations.promote()
  }

  /// Route a request through the strategies. Only an active worker intercepts.
  pub async fn fetch(&self, request: &Request) -> FetchOutcome {
    if self.state() != LifecycleState::Activated {
      debug!(url = %request.url, state = ?self.state(), "Not active, passing through");
      return FetchOutcome::Passthrough;
    }
    self.interceptor.handle(request).await
  }

  /// Handle one control message, answering on its reply port when there is one.
  pub fn handle_message(&self, envelope: Envelope) {
    debug!(message = ?envelope.message, has_reply = envelope.reply.is_some(), "Control message");

    let reply = match &envelope.message {
      ControlMessage::SkipWaiting => {
        self.generations.skip_waiting();
        if let Err(e) = self.generations.try_promote() {
          warn!(error = %e, "Promotion after skip-waiting failed");
        }
        None
      }
      ControlMessage::CacheProject { project } => match self.documents.put(project) {
        Ok(()) => Some(ControlReply::ProjectCached),
        Err(e) => {
          warn!(error = %e, "Failed to cache project");
          None
        }
      },
      ControlMessage::GetCachedProject => match self.documents.get() {
        Ok(Some(project)) => Some(ControlReply::CachedProject { project }),
        Ok(None) => Some(ControlReply::NoCachedProject),
        Err(e) => {
          warn!(error = %e, "Failed to read cached project");
          Some(ControlReply::NoCachedProject)
        }
      },
      ControlMessage::GetCacheStatus => Some(self.cache_status()),
      ControlMessage::ClearCache => {
        self.generations.clear();
        None
      }
      ControlMessage::SyncData => {
        self.sync(SYNC_PROJECT_TAG);
        None
      }
    };

    if let Some(reply) = reply {
      envelope.respond(reply);
    }
  }

  pub fn cache_status(&self) -> ControlReply {
    match self.generations.cache_names() {
      Ok(caches) => ControlReply::CacheStatus {
        caches,
        available: true,
      },
      Err(e) => {
        warn!(error = %e, "Cache store unavailable");
        ControlReply::CacheStatus {
          caches: Vec::new(),
          available: false,
        }
      }
    }
  }

  /// Drain a control channel until every port is dropped.
  pub async fn serve_control(&self, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
      self.handle_message(envelope);
    }
    debug!("Control channel closed");
  }

  /// Background sync. Returns the number of clients notified.
  pub fn sync(&self, tag: &str) -> usize {
    if tag != SYNC_PROJECT_TAG {
      debug!(tag, "Ignoring unknown sync tag");
      return 0;
    }
    let notified = self.clients.broadcast(ControlReply::SyncProject);
    info!(notified, "Project sync started");
    notified
  }

  pub fn push(&self, data: Option<&[u8]>) -> Notification {
    Notification::from_push(data, &self.config.app_name)
  }

  pub fn notification_click(&self, action: Option<&str>) -> ClickOutcome {
    match ClickAction::from_action(action) {
      ClickAction::Dismiss => ClickOutcome::Close,
      ClickAction::Open => {
        let root = self.config.root_url();
        match self.clients.find_by_url(root) {
          Some(id) => ClickOutcome::FocusClient(id),
          None => ClickOutcome::OpenWindow(root.clone()),
        }
      }
    }
  }

  /// Register a client. An active worker controls it from the start.
  pub fn connect_client(&self, url: Url) -> ClientHandle {
    let controller = (self.state() == LifecycleState::Activated)
      .then(|| self.generations.version().to_string());
    self.clients.connect(url, controller)
  }

  /// Close a client; a waiting version takes over once no older client remains.
  pub fn disconnect_client(&self, id: ClientId) -> Result<bool> {
    let removed = self.clients.disconnect(id);
    if removed && self.generations.try_promote()? {
      info!(version = self.generations.version(), "Took over after last old client closed");
    }
    Ok(removed)
  }

  /// Trim the dynamic generation to `cap` (default: the configured maximum).
  pub fn trim(&self, cap: Option<usize>) -> Result<usize> {
    match cap {
      Some(cap) => self.trimmer.trim_to(cap),
      None => self.trimmer.trim(),
    }
  }

  /// Start the periodic trimming sweep.
  pub fn spawn_trimmer(&self) -> JoinHandle<()> {
    self.trimmer.clone().spawn(self.config.trim_interval())
  }

  /// Replace the stored project document.
  pub fn put_project(&self, project: &ProjectDocument) -> Result<()> {
    self.documents.put(project)
  }

  /// Wait for background work started by earlier events.
  pub async fn wait_until_idle(&self) {
    self.background.wait_idle().await;
  }
}
