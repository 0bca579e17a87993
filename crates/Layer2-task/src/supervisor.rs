//! Supervisor - a single-writer async front door to the registry
//!
//! The registry moves onto one blocking worker that alternates between
//! serving requests and draining live instances. Callers talk to it through a
//! cloneable [`SupervisorHandle`]; completed lines are published as
//! [`LineEvent`]s on a broadcast channel.
//!
//! Must be spawned from inside a tokio runtime.

use crate::instance::ProcessInstance;
use crate::registry::InstanceRegistry;
use crate::state::InstanceState;
use crate::stream::StreamKind;
use chrono::{DateTime, Utc};
use ioc_foundation::{Error, Result};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending request capacity
const REQUEST_CAPACITY: usize = 64;

/// Broadcast channel capacity
const BROADCAST_CAPACITY: usize = 1000;

/// One completed line from a live instance
#[derive(Debug, Clone, Serialize)]
pub struct LineEvent {
    pub index: usize,
    pub instance: String,
    pub stream: StreamKind,
    pub line: String,
    pub at: DateTime<Utc>,
}

/// Row of the instance table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub index: usize,
    pub instance_name: String,
    pub device_name: String,
    pub prefix: String,
    pub stage_path: PathBuf,
    pub state: InstanceState,
    pub pid: u32,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub started_at: Option<DateTime<Utc>>,
}

impl InstanceSummary {
    pub fn from_instance(index: usize, instance: &ProcessInstance) -> Self {
        let descriptor = instance.descriptor();
        Self {
            index,
            instance_name: descriptor.instance_name().to_string(),
            device_name: descriptor.device_name().to_string(),
            prefix: descriptor.prefix().to_string(),
            stage_path: descriptor.stage_path().to_path_buf(),
            state: instance.state(),
            pid: instance.pid(),
            stdout_lines: instance.stdout().line_count(),
            stderr_lines: instance.stderr().line_count(),
            started_at: instance.started_at(),
        }
    }

    /// Summaries of every instance in registry order
    pub fn collect(registry: &InstanceRegistry) -> Vec<Self> {
        registry
            .iter()
            .enumerate()
            .map(|(index, instance)| Self::from_instance(index, instance))
            .collect()
    }
}

enum Request {
    Start {
        index: usize,
        reply: oneshot::Sender<Result<u32>>,
    },
    Stop {
        index: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        index: usize,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Clear {
        index: usize,
        stream: StreamKind,
        reply: oneshot::Sender<Result<()>>,
    },
    Lines {
        index: usize,
        stream: StreamKind,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Find {
        name: String,
        reply: oneshot::Sender<Option<usize>>,
    },
    Rescan {
        root: Option<PathBuf>,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<InstanceSummary>>,
    },
    Shutdown,
}

/// Cloneable client of a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
    events: broadcast::Sender<LineEvent>,
}

impl SupervisorHandle {
    /// Receive every line completed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LineEvent> {
        self.events.subscribe()
    }

    /// Start instance `index`, returning its PID
    pub async fn start(&self, index: usize) -> Result<u32> {
        self.request(|reply| Request::Start { index, reply }).await?
    }

    pub async fn stop(&self, index: usize) -> Result<()> {
        self.request(|reply| Request::Stop { index, reply }).await?
    }

    pub async fn send_command(&self, index: usize, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Request::Send { index, text, reply }).await?
    }

    /// Clear one stream's history
    pub async fn clear(&self, index: usize, stream: StreamKind) -> Result<()> {
        self.request(|reply| Request::Clear {
            index,
            stream,
            reply,
        })
        .await?
    }

    /// Current line history of one stream
    pub async fn lines(&self, index: usize, stream: StreamKind) -> Result<Vec<String>> {
        self.request(|reply| Request::Lines {
            index,
            stream,
            reply,
        })
        .await?
    }

    pub async fn find(&self, name: impl Into<String>) -> Result<Option<usize>> {
        let name = name.into();
        self.request(|reply| Request::Find { name, reply }).await
    }

    /// Clear and repopulate, optionally from a new root
    pub async fn rescan(&self, root: Option<PathBuf>) -> Result<usize> {
        self.request(|reply| Request::Rescan { root, reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<InstanceSummary>> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }
}

/// Owner of the worker that holds the registry
pub struct Supervisor {
    handle: SupervisorHandle,
    worker: JoinHandle<InstanceRegistry>,
}

impl Supervisor {
    /// Move `registry` onto a blocking worker; `tick` paces idle drains
    pub fn spawn(registry: InstanceRegistry, tick: Duration) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let worker_events = events.clone();

        let worker = tokio::task::spawn_blocking(move || run(registry, rx, worker_events, tick));

        Self {
            handle: SupervisorHandle { tx, events },
            worker,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LineEvent> {
        self.handle.subscribe()
    }

    /// Stop every live instance and hand the registry back
    pub async fn shutdown(self) -> Result<InstanceRegistry> {
        // A closed channel means the worker is already on its way out
        let _ = self.handle.tx.send(Request::Shutdown).await;
        self.worker
            .await
            .map_err(|e| Error::Internal(format!("supervisor worker failed: {}", e)))
    }
}

fn run(
    mut registry: InstanceRegistry,
    mut rx: mpsc::Receiver<Request>,
    events: broadcast::Sender<LineEvent>,
    tick: Duration,
) -> InstanceRegistry {
    info!("supervisor running with {} IOCs", registry.count());

    'outer: loop {
        loop {
            match rx.try_recv() {
                Ok(request) => {
                    if handle(&mut registry, request).is_break() {
                        break 'outer;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        if registry.live_count() == 0 {
            // Nothing to drain: sleep until the next request
            match rx.blocking_recv() {
                Some(request) => {
                    if handle(&mut registry, request).is_break() {
                        break;
                    }
                    continue;
                }
                None => break,
            }
        }

        let report = registry.tick_with(|index, instance, stream, line| {
            // No subscribers is fine
            let _ = events.send(LineEvent {
                index,
                instance: instance.name().to_string(),
                stream,
                line: line.to_string(),
                at: Utc::now(),
            });
        });
        for index in &report.stopped {
            info!("IOC #{} hung up and was stopped", index);
        }
        for (index, e) in &report.errors {
            warn!("IOC #{}: {}", index, e);
        }
        if report.lines == 0 {
            std::thread::sleep(tick);
        }
    }

    for (index, e) in registry.stop_all() {
        warn!("stopping IOC #{} on shutdown failed: {}", index, e);
    }
    info!("supervisor stopped");
    registry
}

fn handle(registry: &mut InstanceRegistry, request: Request) -> ControlFlow<()> {
    match request {
        Request::Start { index, reply } => {
            let result = registry.instance_mut(index).and_then(|i| {
                i.start()?;
                Ok(i.pid())
            });
            let _ = reply.send(result);
        }
        Request::Stop { index, reply } => {
            let _ = reply.send(registry.instance_mut(index).and_then(|i| i.stop()));
        }
        Request::Send { index, text, reply } => {
            let _ = reply.send(registry.instance_mut(index).and_then(|i| i.send_command(&text)));
        }
        Request::Clear {
            index,
            stream,
            reply,
        } => {
            let result = registry.instance_mut(index).map(|i| i.stream_mut(stream).clear());
            let _ = reply.send(result);
        }
        Request::Lines {
            index,
            stream,
            reply,
        } => {
            let result = registry
                .instance_mut(index)
                .map(|i| i.stream(stream).lines().to_vec());
            let _ = reply.send(result);
        }
        Request::Find { name, reply } => {
            let _ = reply.send(registry.find(&name));
        }
        Request::Rescan { root, reply } => {
            if let Some(root) = root {
                registry.set_root(root);
            }
            let _ = reply.send(registry.rescan());
        }
        Request::Snapshot { reply } => {
            let _ = reply.send(InstanceSummary::collect(registry));
        }
        Request::Shutdown => {
            debug!("supervisor shutdown requested");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}
