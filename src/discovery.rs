//! Background discovery polling
//!
//! Polls the transport on a fixed interval from its own thread, independent
//! of the engine tick, and applies each result to the shared registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::registry::SourceRegistry;
use crate::transport::Transport;

pub struct DiscoveryService {
    thread: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    polls: Arc<AtomicU64>,
    interval: Duration,
}

impl DiscoveryService {
    /// Start polling. The first poll runs immediately.
    pub fn start(
        registry: Arc<SourceRegistry>,
        transport: Arc<dyn Transport>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let polls = Arc::new(AtomicU64::new(0));
        let thread_polls = Arc::clone(&polls);

        let handle = thread::Builder::new()
            .name("bridge-discovery".to_string())
            .spawn(move || {
                tracing::info!("Discovery: Thread started ({:?} interval)", interval);
                let mut not_ready_logged = false;
                loop {
                    match registry.poll(transport.as_ref()) {
                        Ok(summary) => {
                            not_ready_logged = false;
                            if !summary.is_empty() {
                                tracing::debug!(
                                    "Discovery: {} added, {} removed, {} lost, {} known",
                                    summary.added.len(),
                                    summary.removed.len(),
                                    summary.lost.len(),
                                    registry.len()
                                );
                            }
                        }
                        Err(e) => {
                            if !not_ready_logged {
                                tracing::warn!("Discovery: Poll failed: {}", e);
                                not_ready_logged = true;
                            }
                        }
                    }
                    thread_polls.fetch_add(1, Ordering::Relaxed);

                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("Discovery: Thread stopped");
            })?;

        Ok(Self {
            thread: Some(handle),
            shutdown_tx: Some(shutdown_tx),
            polls,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Polls completed so far.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}
