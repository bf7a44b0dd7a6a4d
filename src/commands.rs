//! Command-line subcommands and their handlers.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::event::WorkerHost;
use crate::http::{Fetch, HttpClient, Request, Response};
use crate::updater::{StdinPrompt, UpdateWatcher};
use crate::worker::{self, ControllerStatus, FetchOutcome, OfflineCacheController, RegisterOutcome};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install the configured worker version unless it is already active
  Register,
  /// Show active/waiting versions and cache contents
  Status {
    /// Also list every cached request
    #[arg(long)]
    entries: bool,
  },
  /// Send a request through the controller and print the response body
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Promote the waiting worker now, even with clients attached
  Activate,
  /// Post a JSON message to the worker, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Stay attached as a client and poll for new versions
  Watch,
  /// Delete every cache and forget the registration
  Clear,
}

type Controller = OfflineCacheController<SqliteStorage, HttpClient>;

/// Build the controller from `config` and run one command against it.
pub async fn run(command: Command, config: Config, config_path: Option<PathBuf>) -> Result<()> {
  let origin = config.origin_url()?;
  let storage = Arc::new(SqliteStorage::open(&config.cache_path()?)?);
  let network = Arc::new(HttpClient::new()?);
  let controller = Arc::new(
    OfflineCacheController::new(storage, Arc::clone(&network), origin, &config.scope)?
      .with_respect_no_store(config.cache.respect_no_store),
  );
  let host = WorkerHost::spawn(Arc::clone(&controller));

  let result = match command {
    Command::Register => register(&host, &config).await,
    Command::Status { entries } => status(&controller, entries),
    Command::Fetch {
      url,
      navigate,
      method,
      output,
    } => {
      let target = resolve_target(controller.origin(), &url)?;
      let request = if navigate {
        Request::navigate(target)
      } else {
        Request::get(target)
      };
      let request = request.with_method(&method);
      fetch(&host, network.as_ref(), request, output).await
    }
    Command::Activate => activate(&host, &controller).await,
    Command::Message { json } => {
      let data = parse_message(&json)?;
      host.sender().post_message(data)
    }
    Command::Watch => watch(&host, &controller, &config, config_path).await,
    Command::Clear => {
      controller.unregister()?;
      println!("Caches and registration removed");
      Ok(())
    }
  };

  host.shutdown().await?;
  result
}

async fn register(host: &WorkerHost, config: &Config) -> Result<()> {
  let outcome = host.sender().install(config.worker.clone()).await?;
  let version = &config.worker.version;

  match outcome {
    RegisterOutcome::UpToDate => println!("{} is already active", version),
    RegisterOutcome::AlreadyWaiting => println!("{} is already installed and waiting", version),
    RegisterOutcome::Waiting => println!("{} installed, waiting for clients to close", version),
    RegisterOutcome::Activated => println!("{} installed and activated", version),
  }
  Ok(())
}

async fn activate(host: &WorkerHost, controller: &Controller) -> Result<()> {
  host.sender().activate().await?;
  if let Some(version) = controller.controller_version() {
    println!("{} is now active", version);
  }
  Ok(())
}

fn status(controller: &Controller, entries: bool) -> Result<()> {
  let status = controller.status()?;
  print!("{}", format_status(&status));

  if entries {
    for (name, _) in &status.caches {
      for key in controller.cache_entries(name)? {
        println!("{}\t{}", name, key);
      }
    }
  }
  Ok(())
}

async fn fetch(
  host: &WorkerHost,
  network: &HttpClient,
  request: Request,
  output: Option<PathBuf>,
) -> Result<()> {
  let (response, source) = match host.sender().fetch(request.clone()).await? {
    FetchOutcome::Respond(result) => (result.data, result.source.as_str()),
    // Not intercepted: the default network request applies
    FetchOutcome::Passthrough => (network.fetch(&request).await?, "passthrough"),
  };

  eprintln!(
    "{} {} ({})",
    response.status, response.status_text, source
  );
  write_body(&response, output)
}

fn write_body(response: &Response, output: Option<PathBuf>) -> Result<()> {
  use std::io::Write;

  match output {
    Some(path) => std::fs::write(&path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e)),
    None => std::io::stdout()
      .write_all(&response.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e)),
  }
}

async fn watch(
  host: &WorkerHost,
  controller: &Arc<Controller>,
  config: &Config,
  config_path: Option<PathBuf>,
) -> Result<()> {
  let client_id = format!("cli-{}", std::process::id());
  let watcher = UpdateWatcher::new(Arc::clone(controller), host.sender(), StdinPrompt, &client_id)?;

  info!(interval = ?config.update_interval(), "Watching for updates");
  watcher
    .run(
      move || Config::load(config_path.as_deref()).map(|latest| latest.worker),
      config.update_interval(),
      async {
        let _ = tokio::signal::ctrl_c().await;
      },
    )
    .await
}

/// Resolve a command-line URL against the origin.
pub fn resolve_target(origin: &Url, input: &str) -> Result<Url> {
  worker::resolve(origin, input)
}

/// Parse a message argument. Bare words are shorthand for `{"type": WORD}`.
pub fn parse_message(input: &str) -> Result<Value> {
  let input = input.trim();
  if input.starts_with('{') {
    return serde_json::from_str(input).map_err(|e| eyre!("Invalid message JSON: {}", e));
  }
  if input.is_empty() {
    return Err(eyre!("Message must not be empty"));
  }
  Ok(serde_json::json!({ "type": input.to_uppercase() }))
}

pub fn format_status(status: &ControllerStatus) -> String {
  let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

  let mut out = String::new();
  out.push_str(&format!("scope:      {}\n", status.scope));
  out.push_str(&format!("active:     {}\n", show(&status.active)));
  out.push_str(&format!("waiting:    {}\n", show(&status.waiting)));
  if status.installing.is_some() {
    out.push_str(&format!("installing: {}\n", show(&status.installing)));
  }
  out.push_str(&format!("controller: {}\n", show(&status.controller)));
  out.push_str(&format!("clients:    {}\n", status.clients));

  if status.caches.is_empty() {
    out.push_str("caches:     -\n");
  } else {
    out.push_str("caches:\n");
    for (name, count) in &status.caches {
      out.push_str(&format!("  {} ({} entries)\n", name, count));
    }
  }
  out
}
