// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registry client.
//!
//! Three tasks against one server: a one-shot DEALER bootstrapping the
//! mirror through the snapshot handshake, a SUB applying the live update
//! stream, and a PUB submitting this client's writes and retransmitting any
//! that have not round-tripped. Submissions are fire-and-forget; reliability
//! comes from the reconciler observing the mirror.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tmq::{dealer, publish, subscribe, Context};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{connect_uri, PortLayout};
use crate::error::{RegistryError, RegistryResult};
use crate::frame::{snapshot_request, UpdateFrame};
use crate::mirror::{unsynced_entries, ApplyOutcome, MirrorStore, SnapshotAccumulator};
use crate::origin::OriginId;

/// Default retransmit tick for unsynced self-map entries.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(100);

const START_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const COMPONENT: &str = "registry client";

type Ready = oneshot::Sender<RegistryResult<()>>;
type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// CHP client: snapshot bootstrap, live mirror and self-reconciling writes.
pub struct RegistryClient {
    layout: PortLayout,
    server_host: String,
    poll_timeout: Duration,
    reconcile_interval: Duration,
    context: Option<Context>,
    origin: Option<OriginId>,
    mirror: Arc<MirrorStore>,
    self_map: Arc<Mutex<BTreeMap<String, String>>>,
    timed_out: Arc<AtomicBool>,
    callback: Option<ChangeCallback>,
    submit_tx: mpsc::UnboundedSender<UpdateFrame>,
    submit_rx: Option<mpsc::UnboundedReceiver<UpdateFrame>>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    running: bool,
}

impl RegistryClient {
    /// Create a client of the registry at `server_host`/`base_port`.
    ///
    /// `poll_timeout` bounds every blocking receive and doubles as the
    /// heartbeat watchdog window.
    pub fn new(
        server_host: impl Into<String>,
        base_port: u16,
        poll_timeout: Duration,
    ) -> RegistryResult<Self> {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Ok(Self {
            layout: PortLayout::new(base_port)?,
            server_host: server_host.into(),
            poll_timeout,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            context: None,
            origin: None,
            mirror: Arc::new(MirrorStore::new()),
            self_map: Arc::new(Mutex::new(BTreeMap::new())),
            timed_out: Arc::new(AtomicBool::new(false)),
            callback: None,
            submit_tx,
            submit_rx: Some(submit_rx),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            running: false,
        })
    }

    /// Override the reconciler tick. Default: 100ms.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Inject the shared transport context and this instance's origin id.
    pub fn init(&mut self, context: &Context, origin: OriginId) {
        self.context = Some(context.clone());
        self.origin = Some(origin);
    }

    /// Register a callback fired whenever the mirror gains a value. Set it
    /// before `start`; changes after that are not picked up.
    pub fn on_change<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    /// Submit an insert/update for `key`. The write is recorded in the self
    /// map and retransmitted until it is observed back on the update stream.
    pub fn insert(&self, key: &str, value: &str) -> RegistryResult<()> {
        self.submit(key, value)
    }

    /// Submit a removal for `key` (an empty value on the wire).
    pub fn remove(&self, key: &str) -> RegistryResult<()> {
        self.submit(key, "")
    }

    fn submit(&self, key: &str, value: &str) -> RegistryResult<()> {
        let Some(origin) = self.origin else {
            return Err(RegistryError::NotInitialized {
                component: COMPONENT,
            });
        };

        self.self_map
            .lock()
            .insert(key.to_string(), value.to_string());

        let frame = UpdateFrame::new(key, 0, Some(origin), value);
        self.submit_tx
            .send(frame)
            .map_err(|_| RegistryError::NotRunning {
                component: COMPONENT,
            })
    }

    /// True when the watchdog window elapsed with no frame from the server.
    /// Cleared by the next received frame, heartbeat or update.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.mirror.get(key)
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.mirror.entries()
    }

    pub fn len(&self) -> usize {
        self.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.is_empty()
    }

    /// Connect all three sockets and start their tasks.
    pub async fn start(&mut self) -> RegistryResult<()> {
        let (Some(context), Some(origin)) = (self.context.clone(), self.origin) else {
            return Err(RegistryError::NotInitialized {
                component: COMPONENT,
            });
        };
        if self.running {
            return Err(RegistryError::AlreadyRunning {
                component: COMPONENT,
            });
        }

        // A restarted client gets a fresh submission channel; the old
        // receiver died with the previous reconciler task.
        let submit_rx = match self.submit_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.submit_tx = tx;
                rx
            }
        };

        self.cancel = CancellationToken::new();
        self.timed_out.store(false, Ordering::SeqCst);
        let mut readiness = Vec::new();

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "snapshot",
            tokio::spawn(run_snapshot_requester(
                Arc::clone(&self.mirror),
                context.clone(),
                connect_uri(&self.server_host, self.layout.snapshot),
                self.poll_timeout,
                self.callback.clone(),
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("snapshot", rx));

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "subscriber",
            tokio::spawn(run_subscriber(
                Arc::clone(&self.mirror),
                context.clone(),
                connect_uri(&self.server_host, self.layout.publish),
                self.poll_timeout,
                Arc::clone(&self.timed_out),
                self.callback.clone(),
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("subscriber", rx));

        let (tx, rx) = oneshot::channel();
        self.tasks.push((
            "reconciler",
            tokio::spawn(run_reconciler(
                Arc::clone(&self.mirror),
                Arc::clone(&self.self_map),
                origin,
                context,
                connect_uri(&self.server_host, self.layout.collect),
                self.reconcile_interval,
                submit_rx,
                tx,
                self.cancel.clone(),
            )),
        ));
        readiness.push(("reconciler", rx));

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
            server = %self.server_host,
            origin = %origin,
            "registry client started"
        );
        Ok(())
    }

    /// Cancel every task and wait for each to exit, bounded per task. The
    /// snapshot task usually finished long ago and joins immediately.
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

        info!("registry client stopped");
        Ok(())
    }

    fn abort_tasks(&mut self) {
        self.cancel.cancel();
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// One-shot snapshot bootstrap (DEALER on the snapshot port).
///
/// Sends `("ICANHAZ?", "")` and accumulates the reply stream. A receive
/// timeout discards the partial attempt and resends the request; a partial
/// snapshot is never merged. Terminates itself after one successful merge.
#[allow(clippy::too_many_arguments)]
async fn run_snapshot_requester(
    mirror: Arc<MirrorStore>,
    context: Context,
    addr: String,
    poll_timeout: Duration,
    callback: Option<ChangeCallback>,
    ready: Ready,
    cancel: CancellationToken,
) {
    let mut socket = match dealer::dealer(&context).connect(&addr) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(RegistryError::Transport {
                context: "snapshot connect",
                message: format!("{}: {}", addr, e),
            }));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(addr = %addr, "snapshot requester started (DEALER)");

    let mut acc = SnapshotAccumulator::new();

    let merged = 'attempt: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("snapshot requester shutting down");
                return;
            }
            result = socket.send(snapshot_request(b"")) => {
                if let Err(e) = result {
                    error!(error = %e, "snapshot request send failed");
                    return;
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("snapshot requester shutting down");
                    return;
                }
                result = tokio::time::timeout(poll_timeout, socket.next()) => {
                    match result {
                        Err(_) => {
                            // Incomplete stream: throw the attempt away and
                            // ask again.
                            debug!(partial = acc.len(), "snapshot attempt timed out, retrying");
                            acc.reset();
                            continue 'attempt;
                        }
                        Ok(Some(Ok(msg))) => {
                            match UpdateFrame::from_multipart(&msg) {
                                Ok(frame) if frame.is_terminator() => {
                                    break 'attempt std::mem::take(&mut acc).merge_into(&mirror);
                                }
                                Ok(frame) => acc.absorb(&frame),
                                Err(e) => warn!(error = %e, "snapshot frame dropped"),
                            }
                        }
                        Ok(Some(Err(e))) => {
                            error!(error = %e, "snapshot receive error");
                        }
                        Ok(None) => {
                            warn!("snapshot socket closed");
                            return;
                        }
                    }
                }
            }
        }
    };

    if merged > 0 {
        if let Some(callback) = &callback {
            callback();
        }
    }
    info!(merged, "snapshot complete, requester finished");
}

/// Live update loop (SUB on the publish port).
#[allow(clippy::too_many_arguments)]
async fn run_subscriber(
    mirror: Arc<MirrorStore>,
    context: Context,
    addr: String,
    poll_timeout: Duration,
    timed_out: Arc<AtomicBool>,
    callback: Option<ChangeCallback>,
    ready: Ready,
    cancel: CancellationToken,
) {
    let built = subscribe::subscribe(&context)
        .connect(&addr)
        .map_err(|e| RegistryError::Transport {
            context: "subscriber connect",
            message: format!("{}: {}", addr, e),
        })
        .and_then(|sock| {
            sock.subscribe(b"").map_err(|e| RegistryError::Transport {
                context: "subscriber subscribe",
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
    info!(addr = %addr, "subscriber started (SUB)");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("subscriber shutting down");
                break;
            }
            result = tokio::time::timeout(poll_timeout, socket.next()) => {
                match result {
                    Err(_) => {
                        // No heartbeat or update for a full window.
                        timed_out.store(true, Ordering::SeqCst);
                    }
                    Ok(Some(Ok(msg))) => {
                        timed_out.store(false, Ordering::SeqCst);
                        match UpdateFrame::from_multipart(&msg) {
                            Ok(frame) => {
                                if let ApplyOutcome::Applied { value_set: true } =
                                    mirror.apply_update(&frame)
                                {
                                    if let Some(callback) = &callback {
                                        callback();
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "update frame dropped"),
                        }
                    }
                    Ok(Some(Err(e))) => {
                        error!(error = %e, "subscriber receive error");
                    }
                    Ok(None) => {
                        warn!("subscriber socket closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Submission and retransmit loop (PUB on the collect port).
///
/// Forwards queued submissions immediately; every tick recomputes the
/// unsynced subset of the self map and retransmits it. Duplicates are
/// harmless under the subscriber's sequence guard.
#[allow(clippy::too_many_arguments)]
async fn run_reconciler(
    mirror: Arc<MirrorStore>,
    self_map: Arc<Mutex<BTreeMap<String, String>>>,
    origin: OriginId,
    context: Context,
    addr: String,
    interval: Duration,
    mut submit_rx: mpsc::UnboundedReceiver<UpdateFrame>,
    ready: Ready,
    cancel: CancellationToken,
) {
    let mut socket = match publish::publish(&context).connect(&addr) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(RegistryError::Transport {
                context: "reconciler connect",
                message: format!("{}: {}", addr, e),
            }));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    info!(addr = %addr, "reconciler started (PUB)");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconciler shutting down");
                break;
            }
            Some(frame) = submit_rx.recv() => {
                debug!(key = %frame.key, tombstone = frame.is_tombstone(), "submitting update");
                if let Err(e) = socket.send(frame.to_multipart()).await {
                    error!(error = %e, "submission send failed");
                }
            }
            _ = ticker.tick() => {
                let unsynced = {
                    let map = self_map.lock();
                    unsynced_entries(&map, &mirror, origin)
                };
                for (key, value) in unsynced {
                    debug!(key = %key, "retransmitting unsynced entry");
                    let frame = UpdateFrame::new(key, 0, Some(origin), value);
                    if let Err(e) = socket.send(frame.to_multipart()).await {
                        error!(error = %e, "retransmit send failed");
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
        let mut client =
            RegistryClient::new("localhost", 12345, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            client.start().await,
            Err(RegistryError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_fails() {
        let mut client =
            RegistryClient::new("localhost", 12345, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            client.stop().await,
            Err(RegistryError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_bad_base_port_rejected_at_construction() {
        assert!(matches!(
            RegistryClient::new("localhost", 65534, Duration::from_millis(100)),
            Err(RegistryError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_submit_before_init_fails() {
        let client =
            RegistryClient::new("localhost", 12345, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            client.insert("k", "v"),
            Err(RegistryError::NotInitialized { .. })
        ));
    }

    #[test]
    fn test_submit_records_self_map_tombstones() {
        let mut client =
            RegistryClient::new("localhost", 12345, Duration::from_millis(100)).unwrap();
        let context = Context::new();
        client.init(&context, OriginId::random());

        client.insert("k", "v").unwrap();
        client.remove("k").unwrap();

        // The tombstone stays in the self map so the reconciler can verify
        // the removal actually happened.
        let map = client.self_map.lock();
        assert_eq!(map.get("k"), Some(&String::new()));
    }
}
