// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Data stream forwarder.
//!
//! A fan-in/fan-out device for the data-logging stream that runs alongside
//! the registry: producers publish into the SUB frontend (base+10), every
//! consumer subscribes to the PUB backend (base+11). Payloads are opaque
//! multiparts relayed unchanged; no CHP framing applies here.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tmq::{publish, subscribe, Context};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::endpoints::{bind_uri, ForwarderPorts};
use crate::error::{RegistryError, RegistryResult};

const START_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const COMPONENT: &str = "forwarder";

/// SUB→PUB relay device for the data stream.
pub struct Forwarder {
    ports: ForwarderPorts,
    context: Option<Context>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    running: bool,
}

impl Forwarder {
    pub fn new(base_port: u16) -> RegistryResult<Self> {
        Ok(Self {
            ports: ForwarderPorts::new(base_port)?,
            context: None,
            cancel: CancellationToken::new(),
            task: None,
            running: false,
        })
    }

    /// Inject the shared transport context. Must precede `start`.
    pub fn init(&mut self, context: &Context) {
        self.context = Some(context.clone());
    }

    /// Bind both sockets and start relaying.
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
        let (ready_tx, ready_rx) = oneshot::channel();

        self.task = Some(tokio::spawn(run_forwarder(
            context,
            bind_uri(self.ports.frontend),
            bind_uri(self.ports.backend),
            ready_tx,
            self.cancel.clone(),
        )));

        match tokio::time::timeout(START_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                self.abort_task();
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                self.abort_task();
                return Err(RegistryError::StartTimeout { role: COMPONENT });
            }
        }

        self.running = true;
        info!(
            frontend_port = self.ports.frontend,
            backend_port = self.ports.backend,
            "forwarder started"
        );
        Ok(())
    }

    /// Cancel the relay and wait for it to exit, bounded.
    pub async fn stop(&mut self) -> RegistryResult<()> {
        if !self.running {
            return Err(RegistryError::NotRunning {
                component: COMPONENT,
            });
        }

        self.running = false;
        self.cancel.cancel();

        if let Some(handle) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "forwarder task failed during shutdown"),
                Err(_) => {
                    return Err(RegistryError::ShutdownTimeout { role: COMPONENT });
                }
            }
        }

        info!("forwarder stopped");
        Ok(())
    }

    fn abort_task(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

async fn run_forwarder(
    context: Context,
    frontend_addr: String,
    backend_addr: String,
    ready: oneshot::Sender<RegistryResult<()>>,
    cancel: CancellationToken,
) {
    let frontend = subscribe::subscribe(&context)
        .bind(&frontend_addr)
        .map_err(|e| RegistryError::Transport {
            context: "forwarder frontend bind",
            message: format!("{}: {}", frontend_addr, e),
        })
        .and_then(|sock| {
            sock.subscribe(b"").map_err(|e| RegistryError::Transport {
                context: "forwarder frontend subscribe",
                message: e.to_string(),
            })
        });
    let mut frontend = match frontend {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut backend = match publish::publish(&context).bind(&backend_addr) {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(RegistryError::Transport {
                context: "forwarder backend bind",
                message: format!("{}: {}", backend_addr, e),
            }));
            return;
        }
    };

    let _ = ready.send(Ok(()));
    info!(frontend = %frontend_addr, backend = %backend_addr, "forwarder relaying");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("forwarder shutting down");
                break;
            }
            result = frontend.next() => {
                match result {
                    Some(Ok(msg)) => {
                        if let Err(e) = backend.send(msg).await {
                            error!(error = %e, "forwarder relay send failed");
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "forwarder receive error");
                    }
                    None => {
                        warn!("forwarder frontend closed");
                        break;
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
        let mut forwarder = Forwarder::new(12345).unwrap();
        assert!(matches!(
            forwarder.start().await,
            Err(RegistryError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_fails() {
        let mut forwarder = Forwarder::new(12345).unwrap();
        assert!(matches!(
            forwarder.stop().await,
            Err(RegistryError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_forwarder_port_overflow_rejected() {
        assert!(matches!(
            Forwarder::new(65530),
            Err(RegistryError::InvalidPort { .. })
        ));
    }
}
