//! Sender pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Engine tick thread                    │
//! │  push_frame(): stamp → staleness gate → convert into pool   │
//! │                → try_send (drop when full, never blocks)    │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │ sync_channel(queue depth)
//! ┌────────────────────────────▼────────────────────────────────┐
//! │                  I/O thread (bridge-sender-*)               │
//! │  owns the SendConnection; sends video/audio/metadata,       │
//! │  refreshes connection count + tally, collects upstream      │
//! │  metadata, flushes and closes the connection exactly once   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::convert::{
    audio::ensure_format, validate_dimensions, AlphaRemap, AudioConverter, ColorCorrection,
    ConversionOptions, ConvertError, VideoConverter,
};
use crate::error::{BridgeError, DropReason, Result};
use crate::media::{
    ptz_capabilities, AudioFormat, AudioFrame, MetadataPacket, VideoFrame, WireAudioFrame,
    WireFamily, WireFormat, WireFrame, WireVideoHeader,
};
use crate::pool::{BufferSpec, FramePool, PoolKey};
use crate::registry::format_source_name;
use crate::settings::{PoolSettings, TimingSettings};
use crate::telemetry::metrics::SenderCounters;
use crate::telemetry::{LatencyTracker, SenderStats};
use crate::timing::{ClockDomain, FrameRate, FrameStamp, StalenessGate};
use crate::transport::{SendConnection, SenderOptions, Tally, Transport, VideoAdvert};

/// How often the I/O thread refreshes connection count, tally and upstream metadata.
const STATUS_REFRESH: Duration = Duration::from_millis(20);

/// Log sender statistics every N frames sent.
const STATS_LOG_INTERVAL: u64 = 300;

/// Output configuration of one send target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendTargetConfig {
    /// Stream name, unique per process
    #[serde(rename = "name")]
    pub name: String,

    #[serde(rename = "width", default = "default_width")]
    pub width: u32,

    #[serde(rename = "height", default = "default_height")]
    pub height: u32,

    #[serde(rename = "frameRate", default)]
    pub frame_rate: FrameRate,

    /// Carry alpha on the wire
    #[serde(rename = "alpha", default)]
    pub alpha: bool,

    #[serde(rename = "wireFormat", default)]
    pub wire_format: WireFamily,

    #[serde(rename = "colorCorrection", default)]
    pub color_correction: ColorCorrection,

    #[serde(rename = "alphaMin", default)]
    pub alpha_min: f32,

    #[serde(rename = "alphaMax", default = "default_alpha_max")]
    pub alpha_max: f32,

    /// Skip conversion and sending while no receiver is connected
    #[serde(rename = "sendOnlyWithReceivers", default)]
    pub send_only_with_receivers: bool,

    /// Advertise PTZ control to receivers
    #[serde(rename = "enablePtz", default)]
    pub enable_ptz: bool,

    #[serde(rename = "audio", default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioFormat>,

    /// Wire channel i carries engine channel map[i]; empty for identity
    #[serde(rename = "audioChannelMap", default)]
    pub audio_channel_map: Vec<usize>,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_alpha_max() -> f32 {
    1.0
}

impl SendTargetConfig {
    pub fn new(name: impl Into<String>, width: u32, height: u32, frame_rate: FrameRate) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            frame_rate,
            alpha: false,
            wire_format: WireFamily::default(),
            color_correction: ColorCorrection::default(),
            alpha_min: 0.0,
            alpha_max: default_alpha_max(),
            send_only_with_receivers: false,
            enable_ptz: false,
            audio: None,
            audio_channel_map: Vec::new(),
        }
    }

    /// Concrete wire layout for the configured family and alpha flag.
    pub fn wire_format(&self) -> WireFormat {
        self.wire_format.resolve(self.alpha)
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            color_correction: self.color_correction,
            alpha_remap: AlphaRemap::new(self.alpha_min, self.alpha_max),
            alpha: self.alpha,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::config("send target name is empty"));
        }
        if self.name.contains('(') || self.name.contains(')') {
            return Err(BridgeError::config(format!(
                "send target name '{}' may not contain parentheses",
                self.name
            )));
        }
        validate_dimensions(self.wire_format(), self.width, self.height)
            .map_err(|e| BridgeError::config(e.to_string()))?;
        if !self.frame_rate.is_valid() {
            return Err(BridgeError::config(format!(
                "invalid frame rate {}/{}",
                self.frame_rate.numerator, self.frame_rate.denominator
            )));
        }
        self.conversion_options()
            .validate()
            .map_err(|e| BridgeError::config(e.to_string()))?;
        if let Some(audio) = self.audio {
            if audio.sample_rate == 0 || audio.channels == 0 {
                return Err(BridgeError::config(
                    ConvertError::InvalidAudioFormat {
                        sample_rate: audio.sample_rate,
                        channels: audio.channels,
                    }
                    .to_string(),
                ));
            }
            AudioConverter::new(self.audio_channel_map.clone(), audio.channels)
                .map_err(|e| BridgeError::config(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    #[default]
    Idle,
    Configuring,
    Streaming,
    Stopping,
}

/// Result of one `push_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed to the I/O thread
    Queued,
    Dropped(DropReason),
    /// Nobody is watching and the target only sends with receivers connected
    Skipped,
    NotStreaming,
}

impl PushOutcome {
    /// `Ok(true)` when queued, `Ok(false)` when skipped. Drops become
    /// [`BridgeError::FrameDropped`] for callers that propagate with `?`.
    pub fn into_result(self) -> Result<bool> {
        match self {
            PushOutcome::Queued => Ok(true),
            PushOutcome::Skipped => Ok(false),
            PushOutcome::Dropped(reason) => Err(BridgeError::FrameDropped(reason)),
            PushOutcome::NotStreaming => Err(BridgeError::InvalidState(
                "sender is not streaming".to_string(),
            )),
        }
    }
}

/// Send target names reserved in this process.
#[derive(Debug, Clone, Default)]
pub struct SendTargetNames {
    names: Arc<Mutex<HashSet<String>>>,
}

impl SendTargetNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if !names.insert(name.to_string()) {
            return Err(BridgeError::NameInUse(name.to_string()));
        }
        Ok(())
    }

    pub fn release(&self, name: &str) {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        let names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        names.contains(name)
    }
}

/// One tick's worth of converted media.
struct OutgoingFrame {
    video: WireFrame,
    audio: Option<WireAudioFrame>,
    metadata: Option<MetadataPacket>,
}

/// State shared between the tick thread and the I/O thread.
#[derive(Default)]
struct SenderShared {
    in_flight: AtomicUsize,
    tally: Mutex<Tally>,
    counters: SenderCounters,
}

struct ActiveSender {
    frame_tx: Option<SyncSender<OutgoingFrame>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    upstream_rx: Receiver<MetadataPacket>,
    thread: Option<JoinHandle<()>>,
    converter: VideoConverter,
    audio_converter: Option<AudioConverter>,
    video_pool: FramePool<u8>,
    audio_pool: FramePool<f32>,
    clock: ClockDomain,
    gate: StalenessGate,
    wire_format: WireFormat,
}

impl ActiveSender {
    /// Stop the I/O thread, letting it send what is already queued.
    fn shutdown(&mut self) {
        self.frame_tx.take();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Captures engine frames, converts them and publishes them under a named source.
pub struct SenderPipeline {
    transport: Arc<dyn Transport>,
    names: SendTargetNames,
    timing: TimingSettings,
    pool_settings: PoolSettings,
    state: SenderState,
    config: Option<SendTargetConfig>,
    full_name: Option<String>,
    active: Option<ActiveSender>,
    shared: Arc<SenderShared>,
    latency: LatencyTracker,
}

impl SenderPipeline {
    pub fn new(transport: Arc<dyn Transport>, timing: TimingSettings, pool: PoolSettings) -> Self {
        Self::with_names(transport, timing, pool, SendTargetNames::new())
    }

    /// Share name reservations with other senders in the process.
    pub fn with_names(
        transport: Arc<dyn Transport>,
        timing: TimingSettings,
        pool: PoolSettings,
        names: SendTargetNames,
    ) -> Self {
        Self {
            transport,
            names,
            timing,
            pool_settings: pool,
            state: SenderState::Idle,
            config: None,
            full_name: None,
            active: None,
            shared: Arc::new(SenderShared::default()),
            latency: LatencyTracker::default(),
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn config(&self) -> Option<&SendTargetConfig> {
        self.config.as_ref()
    }

    /// `MACHINE (STREAM)` name while streaming.
    pub fn full_name(&self) -> Option<&str> {
        self.full_name.as_deref()
    }

    /// Validate the target, open the transport connection and start streaming.
    pub fn configure(&mut self, config: SendTargetConfig) -> Result<()> {
        if self.state != SenderState::Idle {
            return Err(BridgeError::InvalidState(format!(
                "configure called while {:?}",
                self.state
            )));
        }
        self.state = SenderState::Configuring;
        match self.open(&config) {
            Ok(active) => {
                self.active = Some(active);
                self.config = Some(config);
                self.state = SenderState::Streaming;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Sender '{}': Configure failed: {}", config.name, e);
                self.config = Some(config);
                self.state = SenderState::Idle;
                Err(e)
            }
        }
    }

    fn open(&mut self, config: &SendTargetConfig) -> Result<ActiveSender> {
        config.validate()?;
        if !self.transport.is_ready() {
            return Err(BridgeError::TransportUnavailable(
                "transport is not initialised".to_string(),
            ));
        }

        self.names.reserve(&config.name)?;
        let result = self.start_io(config);
        if result.is_err() {
            self.names.release(&config.name);
        }
        result
    }

    fn start_io(&mut self, config: &SendTargetConfig) -> Result<ActiveSender> {
        let wire_format = config.wire_format();
        let options = SenderOptions {
            stream_name: config.name.clone(),
            video: VideoAdvert {
                width: config.width,
                height: config.height,
                frame_rate: config.frame_rate,
                format: wire_format,
            },
            audio: config.audio,
            connection_metadata: vec![MetadataPacket::xml(ptz_capabilities(config.enable_ptz))],
        };
        let connection = self
            .transport
            .open_sender(&options)
            .map_err(BridgeError::from_transport)?;

        let video_pool = FramePool::new(
            format!("{} video", config.name),
            self.pool_settings.max_buffers,
        );
        let spec = BufferSpec::new(
            PoolKey::wire(wire_format, config.width, config.height),
            wire_format.frame_size(config.width, config.height),
        );
        video_pool.preallocate(&spec, self.pool_settings.preallocate)?;
        let audio_pool = FramePool::new(
            format!("{} audio", config.name),
            self.pool_settings.max_buffers,
        );

        let audio_converter = match config.audio {
            Some(format) => Some(
                AudioConverter::new(config.audio_channel_map.clone(), format.channels)
                    .map_err(|e| BridgeError::config(e.to_string()))?,
            ),
            None => None,
        };

        self.shared = Arc::new(SenderShared::default());
        self.latency = LatencyTracker::default();
        let (frame_tx, frame_rx) =
            mpsc::sync_channel::<OutgoingFrame>(self.timing.sender_queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (upstream_tx, upstream_rx) = mpsc::channel::<MetadataPacket>();

        let shared = Arc::clone(&self.shared);
        let name = config.name.clone();
        let handle = thread::Builder::new()
            .name(format!("bridge-sender-{}", config.name))
            .spawn(move || {
                io_loop(connection, frame_rx, shutdown_rx, upstream_tx, shared, &name);
            })
            .map_err(|e| {
                BridgeError::TransportUnavailable(format!("failed to spawn sender thread: {}", e))
            })?;

        let full_name = format_source_name(&self.transport.machine_name(), &config.name);
        tracing::info!(
            "Sender '{}': Streaming {}x{} @ {} fps as {} ({})",
            config.name,
            config.width,
            config.height,
            config.frame_rate,
            wire_format,
            full_name
        );
        self.full_name = Some(full_name);

        Ok(ActiveSender {
            frame_tx: Some(frame_tx),
            shutdown_tx: Some(shutdown_tx),
            upstream_rx,
            thread: Some(handle),
            converter: VideoConverter::new(config.conversion_options()),
            audio_converter,
            video_pool,
            audio_pool,
            clock: ClockDomain::new(config.frame_rate, self.timing.audio_resync_threshold()),
            gate: StalenessGate::new(self.timing.max_lag_frames),
            wire_format,
        })
    }

    /// Hand one engine tick to the pipeline. Never blocks.
    pub fn push_frame(
        &mut self,
        video: &VideoFrame,
        audio: Option<&AudioFrame>,
        metadata: Option<MetadataPacket>,
    ) -> PushOutcome {
        let (Some(active), Some(config)) = (self.active.as_mut(), self.config.as_ref()) else {
            return PushOutcome::NotStreaming;
        };
        if self.state != SenderState::Streaming {
            return PushOutcome::NotStreaming;
        }

        let started = Instant::now();
        let counters = &self.shared.counters;
        counters.frames_pushed.fetch_add(1, Ordering::Relaxed);
        let stamp = active.clock.stamp_video();

        if config.send_only_with_receivers && counters.connections.load(Ordering::Relaxed) == 0 {
            counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Skipped;
        }

        let outcome =
            Self::queue_frame(active, config, &self.shared, video, audio, metadata, &stamp);
        if let PushOutcome::Dropped(reason) = outcome {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sender '{}': Frame {} dropped ({})", config.name, stamp.index, reason);
        }
        self.latency.record(started.elapsed());
        outcome
    }

    fn queue_frame(
        active: &mut ActiveSender,
        config: &SendTargetConfig,
        shared: &SenderShared,
        video: &VideoFrame,
        audio: Option<&AudioFrame>,
        metadata: Option<MetadataPacket>,
        stamp: &FrameStamp,
    ) -> PushOutcome {
        if !active.gate.admit(shared.in_flight.load(Ordering::Acquire)) {
            return PushOutcome::Dropped(DropReason::Stale);
        }

        let header = WireVideoHeader {
            width: config.width,
            height: config.height,
            format: active.wire_format,
            frame_rate: config.frame_rate,
            timestamp: stamp.timestamp,
            timecode: Some(stamp.timecode),
            frame_index: stamp.index,
        };
        let wire = match active.converter.to_wire(video, header, &active.video_pool) {
            Ok(wire) => wire,
            Err(ConvertError::Pool(_)) => return PushOutcome::Dropped(DropReason::PoolExhausted),
            Err(e) => {
                tracing::warn!(
                    "Sender '{}': Frame {} conversion failed: {}",
                    config.name,
                    stamp.index,
                    e
                );
                return PushOutcome::Dropped(DropReason::Conversion);
            }
        };

        let audio = audio.and_then(|frame| Self::convert_audio(active, config, shared, frame));
        let metadata = metadata.map(|mut packet| {
            packet.frame_index.get_or_insert(stamp.index);
            packet.timecode.get_or_insert(stamp.timestamp);
            packet
        });

        let Some(tx) = active.frame_tx.as_ref() else {
            return PushOutcome::NotStreaming;
        };
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match tx.try_send(OutgoingFrame {
            video: wire,
            audio,
            metadata,
        }) {
            Ok(()) => PushOutcome::Queued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                PushOutcome::Dropped(DropReason::QueueFull)
            }
        }
    }

    fn convert_audio(
        active: &mut ActiveSender,
        config: &SendTargetConfig,
        shared: &SenderShared,
        frame: &AudioFrame,
    ) -> Option<WireAudioFrame> {
        let counters = &shared.counters;
        let (Some(expected), Some(converter)) = (config.audio, active.audio_converter.as_ref())
        else {
            counters.audio_frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sender '{}': Audio dropped, target has no audio format", config.name);
            return None;
        };
        if let Err(e) = ensure_format(expected, frame.format()) {
            counters.audio_frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Sender '{}': Audio dropped: {}", config.name, e);
            return None;
        }

        let stamp = active.clock.stamp_audio(frame.sample_rate(), frame.samples_per_channel());
        if stamp.resynced {
            counters.audio_resyncs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sender '{}': Audio clock resynced to video", config.name);
        }
        match converter.to_wire(frame, &active.audio_pool) {
            Ok(mut wire) => {
                wire.timestamp = stamp.timestamp;
                Some(wire)
            }
            Err(e) => {
                counters.audio_frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Sender '{}': Audio conversion failed: {}", config.name, e);
                None
            }
        }
    }

    /// Flush queued frames and release the transport connection.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            self.state = SenderState::Idle;
            return;
        };
        self.state = SenderState::Stopping;
        active.shutdown();
        self.shared.counters.connections.store(0, Ordering::Relaxed);

        if let Some(config) = &self.config {
            self.names.release(&config.name);
            let stats = self.stats();
            tracing::info!(
                "Sender '{}': Stopped ({} sent, {} dropped, {} skipped)",
                config.name,
                stats.frames_sent,
                stats.frames_dropped,
                stats.frames_skipped
            );
        }
        self.full_name = None;
        self.state = SenderState::Idle;
    }

    /// Stop and configure again with a new target.
    pub fn reconfigure(&mut self, config: SendTargetConfig) -> Result<()> {
        self.stop();
        self.configure(config)
    }

    /// Rename the published source, recreating the sender if it is streaming.
    pub fn set_source_name(&mut self, name: &str) -> Result<()> {
        let Some(mut config) = self.config.clone() else {
            return Err(BridgeError::InvalidState("sender has no configuration".to_string()));
        };
        if config.name == name {
            return Ok(());
        }
        config.name = name.to_string();
        if self.state == SenderState::Streaming {
            self.reconfigure(config)
        } else {
            config.validate()?;
            self.config = Some(config);
            Ok(())
        }
    }

    pub fn stats(&self) -> SenderStats {
        let name = self.config.as_ref().map(|c| c.name.as_str()).unwrap_or("");
        self.shared.counters.snapshot(name, self.latency.stats())
    }

    /// Receivers connected, as last seen by the I/O thread.
    pub fn connection_count(&self) -> usize {
        self.shared.counters.connections.load(Ordering::Relaxed) as usize
    }

    pub fn tally(&self) -> Tally {
        *self.shared.tally.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Metadata sent upstream by receivers since the last call.
    pub fn take_upstream_metadata(&mut self) -> Vec<MetadataPacket> {
        match &self.active {
            Some(active) => active.upstream_rx.try_iter().collect(),
            None => Vec::new(),
        }
    }
}

impl Drop for SenderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_frame(
    connection: &mut dyn SendConnection,
    frame: OutgoingFrame,
    shared: &SenderShared,
    name: &str,
) {
    let counters = &shared.counters;
    match connection.send_video(&frame.video) {
        Ok(()) => {
            let sent = counters.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
            if sent % STATS_LOG_INTERVAL == 0 {
                tracing::debug!(
                    "Sender '{}': {} frames sent, {} dropped, {} receivers",
                    name,
                    sent,
                    counters.frames_dropped.load(Ordering::Relaxed),
                    counters.connections.load(Ordering::Relaxed)
                );
            }
        }
        Err(e) => {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Sender '{}': Failed to send frame: {}", name, e);
        }
    }
    // The wire buffer goes back to the pool here, before audio is sent
    drop(frame.video);

    if let Some(audio) = frame.audio {
        match connection.send_audio(&audio) {
            Ok(()) => counters.audio_frames_sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.audio_frames_dropped.fetch_add(1, Ordering::Relaxed),
        };
    }
    if let Some(metadata) = frame.metadata {
        if connection.send_metadata(&metadata).is_ok() {
            counters.metadata_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn refresh_status(
    connection: &mut dyn SendConnection,
    upstream_tx: &mpsc::Sender<MetadataPacket>,
    shared: &SenderShared,
    name: &str,
) {
    let connections = connection.connection_count() as u64;
    let previous = shared.counters.connections.swap(connections, Ordering::Relaxed);
    if previous != connections {
        tracing::info!("Sender '{}': {} receiver(s) connected", name, connections);
    }
    *shared.tally.lock().unwrap_or_else(|e| e.into_inner()) = connection.tally();
    while let Some(packet) = connection.poll_upstream() {
        let _ = upstream_tx.send(packet);
    }
}

fn io_loop(
    mut connection: Box<dyn SendConnection>,
    frame_rx: Receiver<OutgoingFrame>,
    shutdown_rx: Receiver<()>,
    upstream_tx: mpsc::Sender<MetadataPacket>,
    shared: Arc<SenderShared>,
    name: &str,
) {
    tracing::info!("Sender '{}': I/O thread started", name);
    let mut last_refresh: Option<Instant> = None;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        if last_refresh.map_or(true, |t| t.elapsed() >= STATUS_REFRESH) {
            refresh_status(connection.as_mut(), &upstream_tx, &shared, name);
            last_refresh = Some(Instant::now());
        }

        match frame_rx.recv_timeout(STATUS_REFRESH) {
            Ok(frame) => {
                send_frame(connection.as_mut(), frame, &shared, name);
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Flush whatever was queued before the stop
    while let Ok(frame) = frame_rx.try_recv() {
        send_frame(connection.as_mut(), frame, &shared, name);
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    if let Err(e) = connection.flush() {
        tracing::debug!("Sender '{}': Flush failed: {}", name, e);
    }
    connection.close();
    tracing::info!("Sender '{}': I/O thread stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;
    use crate::transport::{ConnectOptions, LoopbackConfig, LoopbackTransport, TransportPacket};

    fn loopback(config: LoopbackConfig) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(LoopbackConfig {
            machine_name: Some("STUDIO".to_string()),
            ..config
        }))
    }

    fn solid_frame(width: u32, height: u32, rgba: [u8; 4]) -> VideoFrame {
        let data: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        VideoFrame::from_vec(data, width, height, PixelFormat::Rgba8).unwrap()
    }

    fn sender(transport: Arc<LoopbackTransport>) -> SenderPipeline {
        SenderPipeline::new(transport, TimingSettings::default(), PoolSettings::default())
    }

    #[test]
    fn test_config_validation() {
        assert!(SendTargetConfig::new("Test", 1920, 1080, FrameRate::FPS_60).validate().is_ok());
        assert!(SendTargetConfig::new("", 1920, 1080, FrameRate::FPS_60).validate().is_err());
        assert!(SendTargetConfig::new("Test", 1919, 1080, FrameRate::FPS_60).validate().is_err());
        assert!(SendTargetConfig::new("Test", 1920, 1080, FrameRate::new(0, 1))
            .validate()
            .is_err());

        let mut config = SendTargetConfig::new("Test", 1920, 1080, FrameRate::FPS_60);
        config.alpha_min = 0.8;
        config.alpha_max = 0.2;
        assert!(matches!(config.validate(), Err(BridgeError::Configuration(_))));

        let mut config = SendTargetConfig::new("Test", 64, 64, FrameRate::FPS_60);
        config.audio = Some(AudioFormat::new(48_000, 2));
        config.audio_channel_map = vec![0, 0, 1];
        assert!(config.validate().is_err());

        // BGRA has no 4:2:2 constraint
        let mut config = SendTargetConfig::new("Test", 1919, 1080, FrameRate::FPS_60);
        config.wire_format = WireFamily::Bgra;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wire_format_follows_alpha() {
        let mut config = SendTargetConfig::new("Test", 64, 64, FrameRate::FPS_60);
        assert_eq!(config.wire_format(), WireFormat::Uyvy);
        config.alpha = true;
        assert_eq!(config.wire_format(), WireFormat::Uyva);
    }

    #[test]
    fn test_state_machine() {
        let transport = loopback(LoopbackConfig::default());
        let mut pipeline = sender(transport);
        assert_eq!(pipeline.state(), SenderState::Idle);
        let outcome = pipeline.push_frame(&solid_frame(8, 8, [0; 4]), None, None);
        assert_eq!(outcome, PushOutcome::NotStreaming);
        assert!(matches!(outcome.into_result(), Err(BridgeError::InvalidState(_))));

        pipeline.configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60)).unwrap();
        assert_eq!(pipeline.state(), SenderState::Streaming);
        assert_eq!(pipeline.full_name(), Some("STUDIO (Test)"));
        assert!(matches!(
            pipeline.configure(SendTargetConfig::new("Other", 8, 8, FrameRate::FPS_60)),
            Err(BridgeError::InvalidState(_))
        ));

        pipeline.stop();
        assert_eq!(pipeline.state(), SenderState::Idle);
        pipeline.stop();
    }

    #[test]
    fn test_transport_unavailable_is_fatal() {
        let transport = loopback(LoopbackConfig::default());
        transport.set_ready(false);
        let mut pipeline = sender(transport);
        let err = pipeline
            .configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60))
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)));
        assert_eq!(pipeline.state(), SenderState::Idle);
    }

    #[test]
    fn test_names_unique_per_process() {
        let transport = loopback(LoopbackConfig::default());
        let names = SendTargetNames::new();
        let mut a = SenderPipeline::with_names(
            transport.clone(),
            TimingSettings::default(),
            PoolSettings::default(),
            names.clone(),
        );
        let mut b = SenderPipeline::with_names(
            transport,
            TimingSettings::default(),
            PoolSettings::default(),
            names.clone(),
        );
        a.configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60)).unwrap();
        assert!(matches!(
            b.configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60)),
            Err(BridgeError::NameInUse(_))
        ));
        a.stop();
        assert!(!names.contains("Test"));
        assert!(b.configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60)).is_ok());
    }

    #[test]
    fn test_push_never_blocks_on_slow_transport() {
        let transport = loopback(LoopbackConfig {
            send_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let mut pipeline = sender(transport.clone());
        pipeline.configure(SendTargetConfig::new("Test", 64, 32, FrameRate::FPS_60)).unwrap();
        let _receiver = transport.connect("STUDIO (Test)", &ConnectOptions::default()).unwrap();

        let frame = solid_frame(64, 32, [10, 20, 30, 255]);
        let started = Instant::now();
        let mut dropped = 0;
        for _ in 0..40 {
            let call = Instant::now();
            match pipeline.push_frame(&frame, None, None).into_result() {
                Ok(queued) => assert!(queued),
                Err(BridgeError::FrameDropped(_)) => dropped += 1,
                Err(e) => panic!("unexpected push error: {}", e),
            }
            assert!(call.elapsed() < Duration::from_millis(40));
        }
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(dropped > 0);
        assert_eq!(pipeline.stats().frames_dropped, dropped);
        pipeline.stop();
    }

    #[test]
    fn test_skips_without_receivers_when_gated() {
        let transport = loopback(LoopbackConfig::default());
        let mut pipeline = sender(transport);
        let mut config = SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60);
        config.send_only_with_receivers = true;
        pipeline.configure(config).unwrap();

        let frame = solid_frame(8, 8, [0; 4]);
        assert_eq!(pipeline.push_frame(&frame, None, None), PushOutcome::Skipped);
        assert!(!PushOutcome::Skipped.into_result().unwrap());
        assert_eq!(pipeline.stats().frames_skipped, 1);
    }

    #[test]
    fn test_audio_format_mismatch_dropped() {
        let transport = loopback(LoopbackConfig::default());
        let mut pipeline = sender(transport.clone());
        let mut config = SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60);
        config.audio = Some(AudioFormat::new(48_000, 2));
        pipeline.configure(config).unwrap();
        let mut receiver = transport.connect("STUDIO (Test)", &ConnectOptions::default()).unwrap();

        let frame = solid_frame(8, 8, [0; 4]);
        let wrong = AudioFrame::from_planes(&[vec![0.0; 800], vec![0.0; 800]], 44_100).unwrap();
        let right = AudioFrame::from_planes(&[vec![0.25; 800], vec![0.5; 800]], 48_000).unwrap();
        assert_eq!(pipeline.push_frame(&frame, Some(&wrong), None), PushOutcome::Queued);
        assert_eq!(pipeline.push_frame(&frame, Some(&right), None), PushOutcome::Queued);
        pipeline.stop();

        let stats = pipeline.stats();
        assert_eq!(stats.audio_frames_dropped, 1);
        assert_eq!(stats.audio_frames_sent, 1);

        let mut audio = Vec::new();
        while let Ok(Some(packet)) = receiver.receive(Duration::from_millis(5)) {
            if let TransportPacket::Audio(a) = packet {
                audio.push(a);
            }
        }
        assert_eq!(audio.len(), 1);
        assert_eq!(&audio[0].samples[..2], &[0.25, 0.5]);
    }

    #[test]
    fn test_connection_metadata_and_upstream() {
        let transport = loopback(LoopbackConfig::default());
        let mut pipeline = sender(transport.clone());
        let mut config = SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60);
        config.enable_ptz = true;
        pipeline.configure(config).unwrap();

        let mut receiver = transport.connect("STUDIO (Test)", &ConnectOptions::default()).unwrap();
        match receiver.receive(Duration::from_millis(10)).unwrap() {
            Some(TransportPacket::Metadata(m)) => {
                assert!(m.as_xml().unwrap().contains("ntk_ptz=\"true\""))
            }
            other => panic!("unexpected {:?}", other),
        }
        receiver
            .send_metadata(&MetadataPacket::xml("<ptz_pan_tilt pan=\"0.1\" tilt=\"0\"/>"))
            .unwrap();
        receiver.set_tally(Tally { on_program: true, on_preview: false }).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut upstream = Vec::new();
        while (upstream.is_empty() || !pipeline.tally().on_program) && Instant::now() < deadline {
            upstream.extend(pipeline.take_upstream_metadata());
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(upstream.len(), 1);
        assert!(pipeline.tally().on_program);
        assert_eq!(pipeline.connection_count(), 1);
    }

    #[test]
    fn test_rename_recreates_sender() {
        let transport = loopback(LoopbackConfig::default());
        let mut pipeline = sender(transport.clone());
        pipeline.configure(SendTargetConfig::new("Test", 8, 8, FrameRate::FPS_60)).unwrap();
        pipeline.set_source_name("Renamed").unwrap();
        assert_eq!(pipeline.full_name(), Some("STUDIO (Renamed)"));

        let names: Vec<_> = transport.discover().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["STUDIO (Renamed)".to_string()]);
    }
}
