use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::http::{Fetch, Request};
use crate::worker::{
  FetchOutcome, OfflineCacheController, RegisterOutcome, RegistrationStore, WorkerDefinition,
};

/// Lifecycle events delivered to the controller
#[derive(Debug)]
pub enum WorkerEvent {
  /// Install (and, if nothing holds it back, activate) a worker version
  Install {
    definition: WorkerDefinition,
    reply: oneshot::Sender<Result<RegisterOutcome>>,
  },
  /// Promote the waiting worker
  Activate { reply: oneshot::Sender<Result<()>> },
  /// A request issued by a controlled client
  Fetch {
    request: Request,
    reply: oneshot::Sender<FetchOutcome>,
  },
  /// A message posted by a client
  Message { data: Value },
}

/// Cloneable handle used to post events to a running host.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
  fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker host has shut down"))
  }

  pub async fn install(&self, definition: WorkerDefinition) -> Result<RegisterOutcome> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Install { definition, reply })?;
    rx.await.map_err(|_| eyre!("Install event was dropped"))?
  }

  pub async fn activate(&self) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Activate { reply })?;
    rx.await.map_err(|_| eyre!("Activate event was dropped"))?
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Fetch { request, reply })?;
    rx.await.map_err(|_| eyre!("Fetch event was dropped"))
  }

  pub fn post_message(&self, data: Value) -> Result<()> {
    self.send(WorkerEvent::Message { data })
  }
}

/// Runs the controller's event loop.
///
/// Install, activate and message events are handled one at a time in
/// arrival order. Fetch events run as independent tasks. `shutdown` waits
/// for every task still in flight.
pub struct WorkerHost {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  task: JoinHandle<()>,
}

impl WorkerHost {
  pub fn spawn<S, F>(controller: Arc<OfflineCacheController<S, F>>) -> Self
  where
    S: CacheStorage + RegistrationStore + 'static,
    F: Fetch + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_loop(controller, rx));
    Self { tx, task }
  }

  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Stop accepting events and wait for pending work to finish.
  ///
  /// Senders handed out earlier keep the loop alive until they are dropped.
  pub async fn shutdown(self) -> Result<()> {
    drop(self.tx);
    self
      .task
      .await
      .map_err(|e| eyre!("Worker host task failed: {}", e))
  }
}

async fn run_loop<S, F>(
  controller: Arc<OfflineCacheController<S, F>>,
  mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
) where
  S: CacheStorage + RegistrationStore + 'static,
  F: Fetch + 'static,
{
  let mut pending = JoinSet::new();

  loop {
    tokio::select! {
      event = rx.recv() => {
        let Some(event) = event else { break };
        dispatch(&controller, event, &mut pending).await;
      }
      Some(joined) = pending.join_next(), if !pending.is_empty() => {
        if let Err(e) = joined {
          warn!("Fetch handler panicked: {}", e);
        }
      }
    }
  }

  // Keep the worker alive until in-flight fetches settle
  while let Some(joined) = pending.join_next().await {
    if let Err(e) = joined {
      warn!("Fetch handler panicked: {}", e);
    }
  }
  debug!("Worker host stopped");
}

async fn dispatch<S, F>(
  controller: &Arc<OfflineCacheController<S, F>>,
  event: WorkerEvent,
  pending: &mut JoinSet<()>,
) where
  S: CacheStorage + RegistrationStore + 'static,
  F: Fetch + 'static,
{
  match event {
    WorkerEvent::Install { definition, reply } => {
      let result = controller.register(definition).await;
      let _ = reply.send(result);
    }
    WorkerEvent::Activate { reply } => {
      let _ = reply.send(controller.activate());
    }
    WorkerEvent::Fetch { request, reply } => {
      let controller = Arc::clone(controller);
      pending.spawn(async move {
        let outcome = controller.handle_fetch(request).await;
        // The client gave up on the request; discard the result
        if reply.send(outcome).is_err() {
          debug!("Fetch result discarded");
        }
      });
    }
    WorkerEvent::Message { data } => {
      if let Err(e) = controller.handle_message(&data) {
        warn!("Failed to handle message: {}", e);
      }
    }
  }
}
