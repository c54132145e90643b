//! Latest-wins delivery of encoded frames to the WebSocket relay.
//!
//! The render loop calls [`UplinkSender::send`] at frame rate and never
//! blocks. A single-slot buffer sits between it and the network task: a new
//! frame replaces any frame not yet picked up, so a slow or absent relay
//! costs dropped frames, never latency.

use crate::shutdown::Shutdown;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity-one buffer. `put` overwrites; `recv` waits for a value.
#[derive(Default)]
pub struct LatestSlot {
    item: Mutex<Option<Vec<u8>>>,
    ready: Notify,
}

impl LatestSlot {
    /// Store `bytes`, returning true if an unsent item was replaced.
    pub fn put(&self, bytes: Vec<u8>) -> bool {
        let replaced = self
            .item
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(bytes)
            .is_some();
        self.ready.notify_one();
        replaced
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.item.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub async fn recv(&self) -> Vec<u8> {
        loop {
            if let Some(bytes) = self.take() {
                return bytes;
            }
            // notify_one stores a permit, so a put racing with the take above
            // still wakes us.
            self.ready.notified().await;
        }
    }
}

#[derive(Default)]
pub struct UplinkStats {
    pub submitted: AtomicU64,
    pub superseded: AtomicU64,
    pub sent: AtomicU64,
    pub connects: AtomicU64,
    connected: AtomicBool,
}

impl UplinkStats {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Cloneable, non-blocking producer handle.
#[derive(Clone)]
pub struct UplinkSender {
    slot: Arc<LatestSlot>,
    stats: Arc<UplinkStats>,
}

impl UplinkSender {
    pub fn send(&self, bytes: Vec<u8>) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        if self.slot.put(bytes) {
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
pub struct UplinkSettings {
    pub url: String,
    pub backoff: Duration,
}

pub struct StreamUplink {
    slot: Arc<LatestSlot>,
    stats: Arc<UplinkStats>,
    task: JoinHandle<()>,
}

impl StreamUplink {
    /// Start the connection task on `runtime`. Connection problems are
    /// logged and retried; they never surface to the caller.
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        settings: UplinkSettings,
        shutdown: Shutdown,
    ) -> Self {
        let slot = Arc::new(LatestSlot::default());
        let stats = Arc::new(UplinkStats::default());
        let task = runtime.spawn(run(settings, slot.clone(), stats.clone(), shutdown));
        Self { slot, stats, task }
    }

    pub fn sender(&self) -> UplinkSender {
        UplinkSender {
            slot: self.slot.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> Arc<UplinkStats> {
        self.stats.clone()
    }

    /// Wait for the connection task to finish after shutdown was triggered.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "uplink task panicked");
        }
    }
}

async fn run(
    settings: UplinkSettings,
    slot: Arc<LatestSlot>,
    stats: Arc<UplinkStats>,
    shutdown: Shutdown,
) {
    tracing::info!(url = %settings.url, "uplink task started");

    while !shutdown.is_triggered() {
        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(settings.url.as_str()),
        );
        let attempt = tokio::select! {
            _ = shutdown.wait() => break,
            attempt = connect => attempt,
        };

        match attempt {
            Ok(Ok((ws, _response))) => {
                stats.connects.fetch_add(1, Ordering::Relaxed);
                stats.connected.store(true, Ordering::Release);
                tracing::info!(url = %settings.url, "connected to relay");

                let (mut sink, mut incoming) = ws.split();
                let stopped = loop {
                    tokio::select! {
                        _ = shutdown.wait() => break true,
                        bytes = slot.recv() => {
                            if let Err(e) = sink.send(Message::Binary(bytes)).await {
                                tracing::warn!(error = %e, "relay send failed");
                                break false;
                            }
                            stats.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        msg = incoming.next() => match msg {
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::warn!("relay closed the connection");
                                break false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "relay connection error");
                                break false;
                            }
                        },
                    }
                };
                stats.connected.store(false, Ordering::Release);

                if stopped {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "close handshake failed");
                    }
                    break;
                }
            }
            Ok(Err(e)) => tracing::warn!(url = %settings.url, error = %e, "relay connect failed"),
            Err(_) => tracing::warn!(url = %settings.url, "relay connect timed out"),
        }

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(settings.backoff) => {}
        }
    }

    tracing::info!(
        sent = stats.sent.load(Ordering::Relaxed),
        superseded = stats.superseded.load(Ordering::Relaxed),
        "uplink task exiting"
    );
}
