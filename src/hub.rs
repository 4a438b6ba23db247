// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Authoritative registry server.
//!
//! Runs one task per socket role: a SUB collector ingesting client
//! submissions, a ROUTER answering snapshot requests, and a PUB flushing
//! dirty keys (or a heartbeat when idle) on a fixed tick. All three share
//! the store and a cancellation token; `stop` cancels and joins every task
//! within a bounded budget.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tmq::{publish, router, subscribe, Context};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{bind_uri, PortLayout};
use crate::error::{RegistryError, RegistryResult};
use crate::frame::{parse_snapshot_request, UpdateFrame};
use crate::store::RegistryStore;

/// Default flush tick for the update publisher.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(1);

/// Budget for socket tasks to report readiness during `start`.
const START_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for each socket task to exit during `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const COMPONENT: &str = "registry hub";

type Ready = oneshot::Sender<RegistryResult<()>>;

/// Authoritative CHP server: snapshot responder, update publisher and
/// submission collector over one shared store.
pub struct RegistryHub {
    layout: PortLayout,
    publish_interval: Duration,
    context: Option<Context>,
    store: Arc<RegistryStore>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    running: bool,
}

impl RegistryHub {
    /// Create a hub serving `base_port..base_port+2`.
    pub fn new(base_port: u16) -> RegistryResult<Self> {
        Ok(Self {
            layout: PortLayout::new(base_port)?,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            context: None,
            store: Arc::new(RegistryStore::new()),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            running: false,
        })
    }

    /// Override the publisher flush tick. Default: 1ms.
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    /// Inject the shared transport context. Must precede `start`.
    pub fn init(&mut self, context: &Context) {
        self.context = Some(context.clone());
    }

    /// Insert or update an entry directly on the server.
    pub fn insert(&self, key: &str, value: &str) {
        self.store.put(key, value);
    }

    /// Remove an entry directly on the server.
    pub fn remove(&self, key: &str) {
        self.store.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    pub fn entries(&self) -> std::collections::BTreeMap<String, String> {
        self.store.entries()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Bind all three sockets and start their tasks.
    ///
    /// Blocks until every socket has reported itself bound, so callers can
    /// connect immediately after this returns.
    pub async fn start(&mut self) -> RegistryResult<()> {
        let Some(context) = self.context.clone() else {
            return Err(RegistryError::NotInitialized {
                component: COMPONENT,
            });
        };
        if self.running {
            return Err(RegistryError::AlreadyRunning {
                component: COMPONENT,
            });
        }

        self.cancel = CancellationToken::new();
        let mut readiness = Vec::new();

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "collector",
            tokio::spawn(run_collector(
                Arc::clone(&self.store),
                context.clone(),
                bind_uri(self.layout.collect),
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("collector", rx));

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "snapshot",
            tokio::spawn(run_snapshot_responder(
                Arc::clone(&self.store),
                context.clone(),
                bind_uri(self.layout.snapshot),
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("snapshot", rx));

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "publisher",
            tokio::spawn(run_publisher(
                Arc::clone(&self.store),
                context,
                bind_uri(self.layout.publish),
                self.publish_interval,
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("publisher", rx));

        for (role, rx) in readiness {
            match tokio::time::timeout(START_TIMEOUT, rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    self.abort_tasks();
                    return Err(e);
                }
                Ok(Err(_)) | Err(_) => {
                    self.abort_tasks();
                    return Err(RegistryError::StartTimeout { role });
                }
            }
        }

        self.running = true;
        info!(
            snapshot_port = self.layout.snapshot,
            publish_port = self.layout.publish,
            collect_port = self.layout.collect,
            "registry hub started"
        );
        Ok(())
    }

    /// Cancel every task and wait for each to exit, bounded per task.
    pub async fn stop(&mut self) -> RegistryResult<()> {
        if !self.running {
            return Err(RegistryError::NotRunning {
                component: COMPONENT,
            });
        }

        self.running = false;
        self.cancel.cancel();

        for (role, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(role, error = %e, "task failed during shutdown"),
                Err(_) => return Err(RegistryError::ShutdownTimeout { role }),
            }
        }

        info!("registry hub stopped");
        Ok(())
    }

    fn abort_tasks(&mut self) {
        self.cancel.cancel();
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// Submission ingestion loop (SUB bound on the collect port).
async fn run_collector(
    store: Arc<RegistryStore>,
    context: Context,
    addr: String,
    ready: Ready,
    cancel: CancellationToken,
) {
    let built = subscribe::subscribe(&context)
        .bind(&addr)
        .map_err(|e| RegistryError::Transport {
            context: "collector bind",
            message: format!("{}: {}", addr, e),
        })
        .and_then(|sock| {
            sock.subscribe(b"").map_err(|e| RegistryError::Transport {
                context: "collector subscribe",
                message: e.to_string(),
            })
        });

    let mut socket = match built {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(addr = %addr, "collector started (SUB)");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("collector shutting down");
                break;
            }
            result = socket.next() => {
                match result {
                    Some(Ok(msg)) => {
                        // A wrong frame count means the submission stream is
                        // not speaking CHP; that is fatal to this loop.
                        if msg.len() != 5 {
                            error!(frames = msg.len(), "bad submission frame count, collector exiting");
                            break;
                        }
                        match UpdateFrame::from_multipart(&msg) {
                            Ok(frame) => store.accept_submission(&frame),
                            Err(e) => warn!(error = %e, "submission dropped"),
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "collector receive error");
                    }
                    None => {
                        warn!("collector socket closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Snapshot rendezvous loop (ROUTER bound on the snapshot port).
async fn run_snapshot_responder(
    store: Arc<RegistryStore>,
    context: Context,
    addr: String,
    ready: Ready,
    cancel: CancellationToken,
) {
    let mut socket = match router::router(&context).bind(&addr) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(RegistryError::Transport {
                context: "snapshot bind",
                message: format!("{}: {}", addr, e),
            }));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(addr = %addr, "snapshot responder started (ROUTER)");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("snapshot responder shutting down");
                break;
            }
            result = socket.next() => {
                match result {
                    Some(Ok(msg)) => {
                        let Some((identity, subtree)) = parse_snapshot_request(&msg) else {
                            debug!(frames = msg.len(), "ignoring unknown snapshot request");
                            continue;
                        };

                        let (frames, terminator_seq) = store.snapshot_frames();
                        let count = frames.len();

                        let mut failed = false;
                        for frame in frames {
                            if let Err(e) = socket.send(frame.to_multipart_with_identity(&identity)).await {
                                error!(error = %e, "snapshot entry send failed");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            continue;
                        }

                        let bye = UpdateFrame::terminator(terminator_seq, &subtree);
                        if let Err(e) = socket.send(bye.to_multipart_with_identity(&identity)).await {
                            error!(error = %e, "snapshot terminator send failed");
                            continue;
                        }

                        debug!(
                            entries = count,
                            sequence = terminator_seq,
                            "snapshot served"
                        );
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "snapshot receive error");
                    }
                    None => {
                        warn!("snapshot socket closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Update flush loop (PUB bound on the publish port).
async fn run_publisher(
    store: Arc<RegistryStore>,
    context: Context,
    addr: String,
    interval: Duration,
    ready: Ready,
    cancel: CancellationToken,
) {
    let mut socket = match publish::publish(&context).bind(&addr) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(RegistryError::Transport {
                context: "publisher bind",
                message: format!("{}: {}", addr, e),
            }));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(addr = %addr, interval_ms = interval.as_millis() as u64, "publisher started (PUB)");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("publisher shutting down");
                break;
            }
            _ = ticker.tick() => {
                let frames = store.drain_dirty();
                if frames.is_empty() {
                    if let Err(e) = socket.send(UpdateFrame::heartbeat().to_multipart()).await {
                        error!(error = %e, "heartbeat publish failed");
                    }
                    continue;
                }

                for frame in frames {
                    debug!(
                        key = %frame.key,
                        sequence = frame.sequence,
                        tombstone = frame.is_tombstone(),
                        "publishing update"
                    );
                    if let Err(e) = socket.send(frame.to_multipart()).await {
                        error!(error = %e, "update publish failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_before_init_fails() {
        let mut hub = RegistryHub::new(12345).unwrap();
        assert!(matches!(
            hub.start().await,
            Err(RegistryError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_fails() {
        let mut hub = RegistryHub::new(12345).unwrap();
        assert!(matches!(
            hub.stop().await,
            Err(RegistryError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_bad_base_port_rejected_at_construction() {
        assert!(matches!(
            RegistryHub::new(65535),
            Err(RegistryError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_direct_mutation_marks_entries() {
        let hub = RegistryHub::new(12345).unwrap();
        hub.insert("topic", "payload");
        assert_eq!(hub.get("topic"), Some("payload".to_string()));
        assert_eq!(hub.len(), 1);

        hub.remove("topic");
        // Tombstone until the publisher flushes it.
        assert_eq!(hub.get("topic"), Some(String::new()));
    }
}
