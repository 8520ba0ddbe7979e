//! Per-process bridge context.
//!
//! Owns the transport handle, the source registry and the discovery thread,
//! and hands out sender and receiver pipelines that share them.

use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::discovery::DiscoveryService;
use crate::receiver::{ReceiverConfig, ReceiverPipeline};
use crate::registry::{PollSummary, Source, SourceRegistry};
use crate::sender::{SendTargetConfig, SendTargetNames, SenderPipeline};
use crate::settings::BridgeSettings;
use crate::transport::Transport;

pub struct MediaBridge {
    transport: Arc<dyn Transport>,
    settings: BridgeSettings,
    registry: Arc<SourceRegistry>,
    discovery: Option<DiscoveryService>,
    names: SendTargetNames,
}

impl MediaBridge {
    /// Create the bridge and start discovery if it is enabled.
    pub fn new(transport: Arc<dyn Transport>, mut settings: BridgeSettings) -> Result<Self> {
        settings.clamp();
        let registry = Arc::new(SourceRegistry::new(settings.discovery.eviction_timeout()));

        let discovery = if settings.discovery.enabled {
            let service = DiscoveryService::start(
                Arc::clone(&registry),
                Arc::clone(&transport),
                settings.discovery.poll_interval(),
            )
            .map_err(|e| {
                BridgeError::TransportUnavailable(format!("failed to start discovery: {}", e))
            })?;
            Some(service)
        } else {
            None
        };

        tracing::info!(
            "MediaBridge: Started on {} (discovery {})",
            transport.machine_name(),
            if discovery.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            transport,
            settings,
            registry,
            discovery,
            names: SendTargetNames::new(),
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Sources as of the last discovery poll, ordered by name.
    pub fn list_sources(&self) -> Arc<Vec<Source>> {
        self.registry.list()
    }

    /// Poll discovery now instead of waiting for the next interval.
    pub fn refresh_sources(&self) -> Result<PollSummary> {
        self.registry
            .poll(self.transport.as_ref())
            .map_err(BridgeError::from_transport)
    }

    /// An idle sender sharing this bridge's name reservations.
    pub fn create_sender(&self) -> SenderPipeline {
        SenderPipeline::with_names(
            Arc::clone(&self.transport),
            self.settings.timing.clone(),
            self.settings.pool.clone(),
            self.names.clone(),
        )
    }

    /// Create a sender and start streaming `config`.
    pub fn start_sender(&self, config: SendTargetConfig) -> Result<SenderPipeline> {
        let mut sender = self.create_sender();
        sender.configure(config)?;
        Ok(sender)
    }

    /// A disconnected receiver for `config`.
    pub fn create_receiver(&self, config: ReceiverConfig) -> ReceiverPipeline {
        ReceiverPipeline::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            config,
            self.settings.timing.clone(),
            self.settings.pool.clone(),
        )
    }

    /// Create a receiver and connect it, polling discovery once if the source is not known yet.
    pub fn connect_receiver(&self, config: ReceiverConfig) -> Result<ReceiverPipeline> {
        if self.registry.resolve(&config.source_name).is_none() {
            self.refresh_sources()?;
        }
        let mut receiver = self.create_receiver(config);
        receiver.start()?;
        Ok(receiver)
    }

    /// Start every sender in the settings. Failures are logged and skipped.
    pub fn start_senders_from_settings(&self) -> Vec<SenderPipeline> {
        self.settings
            .senders
            .iter()
            .filter_map(|config| match self.start_sender(config.clone()) {
                Ok(sender) => Some(sender),
                Err(e) => {
                    tracing::warn!("MediaBridge: Sender '{}' not started: {}", config.name, e);
                    None
                }
            })
            .collect()
    }

    /// Connect every receiver in the settings. Failures are logged and skipped.
    pub fn connect_receivers_from_settings(&self) -> Vec<ReceiverPipeline> {
        self.settings
            .receivers
            .iter()
            .filter_map(|config| match self.connect_receiver(config.clone()) {
                Ok(receiver) => Some(receiver),
                Err(e) => {
                    tracing::warn!(
                        "MediaBridge: Receiver for '{}' not connected: {}",
                        config.source_name,
                        e
                    );
                    None
                }
            })
            .collect()
    }

    pub fn discovery_running(&self) -> bool {
        self.discovery.as_ref().is_some_and(|d| d.is_running())
    }

    /// Stop discovery. Pipelines handed out stop when dropped.
    pub fn shutdown(&mut self) {
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop();
            tracing::info!("MediaBridge: Shut down");
        }
    }
}

impl Drop for MediaBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
