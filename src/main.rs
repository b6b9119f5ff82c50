use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use offcache::cache::SqliteStorage;
use offcache::control::{self, ControlMessage, ControlReply};
use offcache::document::ProjectDocument;
use offcache::http::{Request, RequestMode, Response};
use offcache::intercept::FetchOutcome;
use offcache::network::{HttpNetwork, Network};
use offcache::{Config, Worker};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline-first HTTP response cache with versioned cache generations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Build version to run instead of the configured one
  #[arg(long)]
  build_version: Option<String>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache static assets for this version and activate it
  Install,
  /// Fetch a URL through the caching strategies
  Fetch {
    url: Url,
    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Treat a cross-origin request as CORS instead of no-cors
    #[arg(long)]
    cors: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// List cache generations
  Status,
  /// Delete every generation except the current static one (also deletes the project)
  Clear,
  /// Trim the dynamic generation
  Trim {
    /// Entry cap (default: max_dynamic_entries from config)
    #[arg(long)]
    cap: Option<usize>,
  },
  /// Read or replace the stored project document
  #[command(subcommand)]
  Project(ProjectCommand),
  /// Serve the control protocol: JSON messages on stdin, replies and broadcasts on stdout
  Control,
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
  /// Print the stored project as JSON
  Get,
  /// Store a project read from FILE ("-" for stdin)
  Put { file: PathBuf },
}

/// Log to a daily file next to the cache database, plus stderr when verbose.
/// Use RUST_LOG to control the level (e.g. RUST_LOG=debug).
fn init_tracing(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(file_layer)
    .with(stderr_layer)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = if let Some(version) = args.build_version {
    Config { version, ..config }
  } else {
    config
  };

  let database = config.database_path()?;
  let _guard = init_tracing(database.parent().map(|p| p.join("logs")).as_deref(), args.verbose);
  info!(version = %config.version, database = %database.display(), "offcache starting");

  let storage = Arc::new(SqliteStorage::open(&database)?);
  let network = Arc::new(
    HttpNetwork::new(&config.scope, config.fetch_timeout())
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?,
  );
  let worker = Arc::new(Worker::new(config, storage, network.clone())?);

  match args.command {
    Command::Install => {
      let activated = worker.install().await?;
      let generations = worker.generations();
      println!(
        "Installed {} ({})",
        generations.static_generation(),
        if activated { "active" } else { "waiting" }
      );
    }
    Command::Fetch {
      url,
      navigate,
      method,
      cors,
      output,
    } => {
      worker.start().await?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mode = if navigate {
        RequestMode::Navigate
      } else if url.origin() == worker.config().scope.origin() {
        RequestMode::SameOrigin
      } else if cors {
        RequestMode::Cors
      } else {
        RequestMode::NoCors
      };
      let request = Request::new(method, url).with_mode(mode);

      let (response, source) = match worker.fetch(&request).await {
        FetchOutcome::Respond(interception) => (
          interception.response,
          format!("{:?} via {:?}", interception.source, interception.strategy),
        ),
        FetchOutcome::Passthrough => (
          network
            .fetch(&request)
            .await
            .map_err(|e| eyre!("Request failed: {}", e))?,
          "passthrough".to_string(),
        ),
      };
      eprintln!("{} {} ({})", response.status, request.url, source);
      write_body(&response, output.as_deref())?;
    }
    Command::Status => {
      worker.start().await?;
      println!("{}", serde_json::to_string_pretty(&worker.cache_status())?);
    }
    Command::Clear => {
      worker.start().await?;
      let deleted = worker.generations().clear();
      warn!(?deleted, "Caches cleared; the stored project was deleted with them");
      for name in deleted {
        println!("deleted {}", name);
      }
      eprintln!("Note: the stored project document was deleted too.");
    }
    Command::Trim { cap } => {
      worker.start().await?;
      let evicted = worker.trim(cap)?;
      println!("evicted {} entries", evicted);
    }
    Command::Project(ProjectCommand::Get) => {
      worker.start().await?;
      match worker.documents().get()? {
        Some(project) => println!("{}", serde_json::to_string_pretty(&project)?),
        None => return Err(eyre!("No cached project")),
      }
    }
    Command::Project(ProjectCommand::Put { file }) => {
      worker.start().await?;
      let contents = read_input(&file)?;
      let project: ProjectDocument = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse project {}: {}", file.display(), e))?;
      worker.put_project(&project)?;
      println!("project cached");
    }
    Command::Control => {
      worker.start().await?;
      run_control(Arc::clone(&worker)).await?;
    }
  }

  worker.wait_until_idle().await;
  info!("offcache shutting down");
  Ok(())
}

fn write_body(response: &Response, output: Option<&Path>) -> Result<()> {
  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => {
      use std::io::Write;
      io::stdout().write_all(&response.body)?;
      Ok(())
    }
  }
}

fn read_input(path: &Path) -> Result<String> {
  if path == Path::new("-") {
    let mut contents = String::new();
    io::stdin().read_to_string(&mut contents)?;
    return Ok(contents);
  }
  std::fs::read_to_string(path).map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))
}

/// Messages whose sender waits on a reply port.
fn expects_reply(message: &ControlMessage) -> bool {
  matches!(
    message,
    ControlMessage::CacheProject { .. }
      | ControlMessage::GetCachedProject
      | ControlMessage::GetCacheStatus
  )
}

fn print_reply(reply: &ControlReply) -> Result<()> {
  println!("{}", serde_json::to_string(reply)?);
  Ok(())
}

/// Bridge stdin/stdout to the control channel until stdin closes.
async fn run_control(worker: Arc<Worker>) -> Result<()> {
  let (port, rx) = control::channel(64);
  let server = {
    let worker = Arc::clone(&worker);
    tokio::spawn(async move { worker.serve_control(rx).await })
  };
  let trimmer = worker.spawn_trimmer();

  let mut client = worker.connect_client(worker.config().root_url().clone());
  let client_id = client.id;
  let notices = tokio::spawn(async move {
    while let Some(notice) = client.next().await {
      match serde_json::to_string(&notice) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to encode notice"),
      }
    }
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let value: Value = match serde_json::from_str(&line) {
      Ok(value) => value,
      Err(e) => {
        debug!(error = %e, "Ignoring line that is not JSON");
        continue;
      }
    };
    let Some(message) = ControlMessage::from_json(value) else {
      continue;
    };

    if expects_reply(&message) {
      if let Some(reply) = port.request(message).await? {
        print_reply(&reply)?;
      }
    } else {
      port.post(message).await?;
    }
  }

  drop(port);
  server.await?;
  trimmer.abort();
  worker.disconnect_client(client_id)?;
  notices.await?;
  Ok(())
}
