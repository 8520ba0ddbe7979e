//! Receiver pipeline
//!
//! A pull thread per connected source owns the `ReceiveConnection`. It
//! reassembles fragmented video, converts completed frames into pooled
//! engine frames and publishes them to a [`FrameSlot`]. The engine tick
//! reads the slot through a [`FrameHold`] so it always has something to show.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::convert::{
    audio::ensure_format, AlphaRemap, AudioConverter, ColorCorrection, ConversionOptions,
    VideoConverter,
};
use crate::error::{BridgeError, Result};
use crate::exchange::FrameSlot;
use crate::media::{AudioFormat, AudioFrame, MetadataPacket, PixelFormat, SampleFormat, VideoFrame};
use crate::pool::FramePool;
use crate::registry::{ReceiverId, SourceRegistry, SourceState};
use crate::settings::{PoolSettings, TimingSettings};
use crate::telemetry::metrics::ReceiverCounters;
use crate::telemetry::ReceiverStats;
use crate::timing::{
    duration_to_ticks, AssembledFrame, AvSync, ClockDomain, FrameAssembler, FrameHold, FrameRate,
    HoldOutcome, SyncOutcome, Ticks,
};
use crate::transport::{
    AudioPacket, Bandwidth, ConnectOptions, ReceiveConnection, Tally, Transport, TransportError,
    TransportPacket,
};

/// Metadata packets kept for the consumer before the oldest is discarded.
const METADATA_QUEUE: usize = 64;

/// Receive settings for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// `MACHINE (STREAM)` or a unique stream name
    #[serde(rename = "sourceName")]
    pub source_name: String,

    /// Name this receiver reports to the sender
    #[serde(rename = "receiverName", default)]
    pub receiver_name: String,

    #[serde(rename = "bandwidth", default)]
    pub bandwidth: Bandwidth,

    /// Engine pixel format of delivered frames
    #[serde(rename = "pixelFormat", default)]
    pub pixel_format: PixelFormat,

    /// Keep source alpha; when false frames are delivered opaque
    #[serde(rename = "alpha", default = "default_true")]
    pub alpha: bool,

    #[serde(rename = "muteAudio", default)]
    pub mute_audio: bool,

    #[serde(rename = "muteVideo", default)]
    pub mute_video: bool,

    /// Stamp frames with the source timecode instead of the local clock
    #[serde(rename = "syncTimecodeToSource", default = "default_true")]
    pub sync_timecode_to_source: bool,

    /// Expected audio format; a source advertising anything else is rejected
    #[serde(rename = "audio", default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioFormat>,

    #[serde(rename = "colorCorrection", default)]
    pub color_correction: ColorCorrection,

    #[serde(rename = "alphaMin", default)]
    pub alpha_min: f32,

    #[serde(rename = "alphaMax", default = "default_alpha_max")]
    pub alpha_max: f32,
}

fn default_true() -> bool {
    true
}

fn default_alpha_max() -> f32 {
    1.0
}

impl ReceiverConfig {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            receiver_name: String::new(),
            bandwidth: Bandwidth::default(),
            pixel_format: PixelFormat::default(),
            alpha: true,
            mute_audio: false,
            mute_video: false,
            sync_timecode_to_source: true,
            audio: None,
            color_correction: ColorCorrection::default(),
            alpha_min: 0.0,
            alpha_max: default_alpha_max(),
        }
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            color_correction: self.color_correction,
            alpha_remap: AlphaRemap::new(self.alpha_min, self.alpha_max),
            alpha: self.alpha,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.conversion_options()
            .validate()
            .map_err(|e| BridgeError::config(e.to_string()))?;
        if let Some(audio) = self.audio {
            if audio.sample_rate == 0 || audio.channels == 0 {
                return Err(BridgeError::config(format!("invalid expected audio format {}", audio)));
            }
        }
        Ok(())
    }

    fn bandwidth_label(&self) -> &'static str {
        match self.bandwidth {
            Bandwidth::Highest => "highest bandwidth",
            Bandwidth::Lowest => "lowest bandwidth",
            Bandwidth::AudioOnly => "audio only",
            Bandwidth::MetadataOnly => "metadata only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverState {
    #[default]
    Disconnected,
    Discovering,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// The transport reset the connection
    SourceLost,
}

/// Result of polling for video: new, held from a previous poll, or nothing yet.
pub type FramePoll = HoldOutcome<VideoFrame>;

enum Upstream {
    Metadata(MetadataPacket),
    Tally(Tally),
}

/// State shared between the tick thread and the pull thread.
struct ReceiverShared {
    video: FrameSlot<VideoFrame>,
    audio: Mutex<AvSync>,
    metadata: Mutex<VecDeque<MetadataPacket>>,
    counters: ReceiverCounters,
    last_timecode: Mutex<Option<Ticks>>,
    cancel: AtomicBool,
    lost: AtomicBool,
}

impl ReceiverShared {
    fn new(timing: &TimingSettings) -> Self {
        Self {
            video: FrameSlot::new(),
            audio: Mutex::new(AvSync::new(
                timing.audio_queue_frames,
                duration_to_ticks(timing.audio_resync_threshold()),
            )),
            metadata: Mutex::new(VecDeque::new()),
            counters: ReceiverCounters::default(),
            last_timecode: Mutex::new(None),
            cancel: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        }
    }
}

struct ActiveReceiver {
    thread: Option<JoinHandle<()>>,
    upstream_tx: Option<Sender<Upstream>>,
}

/// Owns the pull thread's resources.
struct PullWorker {
    connection: Box<dyn ReceiveConnection>,
    shared: Arc<ReceiverShared>,
    upstream_rx: Receiver<Upstream>,
    registry: Arc<SourceRegistry>,
    id: ReceiverId,
    source: String,
    config: ReceiverConfig,
    timeout: Duration,
    assembler: FrameAssembler,
    converter: VideoConverter,
    audio_converter: AudioConverter,
    video_pool: FramePool<u8>,
    audio_pool: FramePool<f32>,
    scratch: Vec<u8>,
    clock: Option<ClockDomain>,
    clock_offset: Ticks,
}

/// Discovers, connects to and pulls media from one named source.
pub struct ReceiverPipeline {
    transport: Arc<dyn Transport>,
    registry: Arc<SourceRegistry>,
    timing: TimingSettings,
    pool_settings: PoolSettings,
    config: ReceiverConfig,
    id: ReceiverId,
    state: ReceiverState,
    reason: Option<DisconnectReason>,
    source: Option<String>,
    frame_rate: FrameRate,
    active: Option<ActiveReceiver>,
    shared: Arc<ReceiverShared>,
    hold: FrameHold<VideoFrame>,
}

impl ReceiverPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SourceRegistry>,
        config: ReceiverConfig,
        timing: TimingSettings,
        pool: PoolSettings,
    ) -> Self {
        let id = registry.next_receiver_id();
        let frame_rate = FrameRate::default();
        Self {
            transport,
            registry,
            shared: Arc::new(ReceiverShared::new(&timing)),
            hold: FrameHold::new(timing.hold_after(frame_rate.frame_interval())),
            timing,
            pool_settings: pool,
            config,
            id,
            state: ReceiverState::Disconnected,
            reason: None,
            source: None,
            frame_rate,
            active: None,
        }
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Full name of the connected source.
    pub fn source_name(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Frame rate advertised by the source, or the default before connecting.
    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    /// Last frame handed to the consumer.
    pub fn last_frame(&self) -> Option<&VideoFrame> {
        self.hold.last()
    }

    /// Current state. A source lost by the pull thread or timed out in
    /// discovery reads as `Disconnected`.
    pub fn state(&self) -> ReceiverState {
        if self.state == ReceiverState::Connected && self.source_gone() {
            return ReceiverState::Disconnected;
        }
        self.state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        if self.state == ReceiverState::Connected && self.source_gone() {
            return Some(DisconnectReason::SourceLost);
        }
        self.reason
    }

    fn source_gone(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
            || self
                .source
                .as_deref()
                .is_some_and(|name| self.registry.source_state(name) == SourceState::Lost)
    }

    /// Connect to the source named in the configuration.
    pub fn start(&mut self) -> Result<()> {
        let name = self.config.source_name.clone();
        self.connect(&name)
    }

    /// Take exclusive ownership of `name` and start pulling from it.
    pub fn connect(&mut self, name: &str) -> Result<()> {
        self.reap();
        if self.state != ReceiverState::Disconnected {
            return Err(BridgeError::InvalidState(format!(
                "connect called while {:?}",
                self.state
            )));
        }
        self.config.validate()?;

        self.state = ReceiverState::Discovering;
        let Some(full_name) = self.registry.resolve(name) else {
            self.state = ReceiverState::Disconnected;
            return Err(BridgeError::NotFound(name.to_string()));
        };

        let source = match self.registry.claim(&full_name, self.id) {
            Ok(source) => source,
            Err(e) => {
                self.state = ReceiverState::Disconnected;
                return Err(e);
            }
        };
        self.state = ReceiverState::Connecting;

        match self.open(&full_name, source.video.map(|v| v.frame_rate), source.audio) {
            Ok(active) => {
                self.registry.set_state(&full_name, self.id, SourceState::Connected);
                tracing::info!(
                    "Receiver '{}': Connected to {} ({})",
                    self.id,
                    full_name,
                    self.config.bandwidth_label()
                );
                self.active = Some(active);
                self.source = Some(full_name);
                self.reason = None;
                self.state = ReceiverState::Connected;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Receiver '{}': Connect to {} failed: {}", self.id, full_name, e);
                self.registry.release(&full_name, self.id);
                self.state = ReceiverState::Disconnected;
                Err(e)
            }
        }
    }

    fn open(
        &mut self,
        full_name: &str,
        frame_rate: Option<FrameRate>,
        advertised_audio: Option<AudioFormat>,
    ) -> Result<ActiveReceiver> {
        if let (Some(expected), Some(actual)) = (self.config.audio, advertised_audio) {
            ensure_format(expected, actual).map_err(|e| BridgeError::config(e.to_string()))?;
        }
        if !self.transport.is_ready() {
            return Err(BridgeError::TransportUnavailable(
                "transport is not initialised".to_string(),
            ));
        }

        let options = ConnectOptions {
            receiver_name: self.config.receiver_name.clone(),
            bandwidth: self.config.bandwidth,
        };
        let connection = self
            .transport
            .connect(full_name, &options)
            .map_err(BridgeError::from_transport)?;

        if let Some(rate) = frame_rate {
            self.frame_rate = rate;
        }
        self.hold = FrameHold::new(self.timing.hold_after(self.frame_rate.frame_interval()));
        self.shared = Arc::new(ReceiverShared::new(&self.timing));

        let audio_ceiling = self.pool_settings.max_buffers + self.timing.audio_queue_frames;
        let (upstream_tx, upstream_rx) = mpsc::channel::<Upstream>();
        let worker = PullWorker {
            connection,
            shared: Arc::clone(&self.shared),
            upstream_rx,
            registry: Arc::clone(&self.registry),
            id: self.id,
            source: full_name.to_string(),
            config: self.config.clone(),
            timeout: self.timing.receive_timeout(),
            assembler: FrameAssembler::new(self.timing.max_pending_frames),
            converter: VideoConverter::new(self.config.conversion_options()),
            audio_converter: AudioConverter::new(Vec::new(), 1)?,
            video_pool: FramePool::new(
                format!("{} video", full_name),
                self.pool_settings.max_buffers,
            ),
            audio_pool: FramePool::new(format!("{} audio", full_name), audio_ceiling),
            scratch: Vec::new(),
            clock: (!self.config.sync_timecode_to_source)
                .then(|| ClockDomain::new(self.frame_rate, self.timing.audio_resync_threshold())),
            clock_offset: 0,
        };

        let stream = crate::registry::parse_source_name(full_name)
            .map(|(_, stream)| stream.to_string())
            .unwrap_or_else(|| full_name.to_string());
        let handle = thread::Builder::new()
            .name(format!("bridge-receiver-{}", stream))
            .spawn(move || worker.run())
            .map_err(|e| {
                BridgeError::TransportUnavailable(format!("failed to spawn receiver thread: {}", e))
            })?;

        Ok(ActiveReceiver {
            thread: Some(handle),
            upstream_tx: Some(upstream_tx),
        })
    }

    /// Stop and join the pull thread once the source has gone away, either
    /// by connection reset or by timing out in discovery.
    fn reap(&mut self) {
        if self.state != ReceiverState::Connected || !self.source_gone() {
            return;
        }
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(mut active) = self.active.take() {
            active.upstream_tx.take();
            if let Some(handle) = active.thread.take() {
                let _ = handle.join();
            }
        }
        if let Some(source) = &self.source {
            if !self.shared.lost.load(Ordering::Acquire) {
                tracing::warn!("Receiver '{}': Source {} timed out in discovery", self.id, source);
            }
            self.registry.release(source, self.id);
        }
        self.state = ReceiverState::Disconnected;
        self.reason = Some(DisconnectReason::SourceLost);
    }

    /// Newest frame, the held frame, or nothing. Never blocks on the network.
    pub fn poll_frame(&mut self) -> FramePoll {
        self.poll_frame_at(Instant::now())
    }

    pub fn poll_frame_at(&mut self, now: Instant) -> FramePoll {
        self.reap();
        let fresh = self.shared.video.take();
        let repeats = self.hold.repeats();
        let outcome = self.hold.update(fresh, now);
        if self.hold.repeats() > repeats {
            self.shared.counters.frames_held.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Frame to present this tick, if any has been received.
    pub fn latest_frame(&mut self) -> Option<VideoFrame> {
        self.poll_frame().into_frame()
    }

    /// Audio block nearest to `frame`. Flushes queued audio if it has drifted.
    pub fn audio_for_frame(&mut self, frame: &VideoFrame) -> Option<AudioFrame> {
        let (outcome, skipped) = {
            let mut sync = self.shared.audio.lock().unwrap_or_else(|e| e.into_inner());
            let before = sync.dropped();
            let outcome = sync.take_for_video(frame.timestamp);
            (outcome, sync.dropped() - before)
        };
        match outcome {
            SyncOutcome::Matched(audio) => {
                self.shared.counters.audio_dropped.fetch_add(skipped, Ordering::Relaxed);
                Some(audio)
            }
            SyncOutcome::Resync { flushed } => {
                self.shared.counters.audio_resyncs.fetch_add(1, Ordering::Relaxed);
                self.shared.counters.audio_dropped.fetch_add(flushed as u64, Ordering::Relaxed);
                tracing::debug!(
                    "Receiver '{}': Audio drifted from frame {}, flushed {} blocks",
                    self.id,
                    frame.frame_index,
                    flushed
                );
                None
            }
            SyncOutcome::Empty => None,
        }
    }

    /// All queued audio, oldest first.
    pub fn take_audio(&mut self) -> Vec<AudioFrame> {
        self.shared.audio.lock().unwrap_or_else(|e| e.into_inner()).drain()
    }

    pub fn take_metadata(&mut self) -> Vec<MetadataPacket> {
        self.shared
            .metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Send metadata upstream to the connected source.
    pub fn send_metadata(&mut self, packet: MetadataPacket) -> Result<()> {
        self.upstream(Upstream::Metadata(packet))
    }

    pub fn set_tally(&mut self, tally: Tally) -> Result<()> {
        self.upstream(Upstream::Tally(tally))
    }

    fn upstream(&mut self, command: Upstream) -> Result<()> {
        self.reap();
        let tx = self
            .active
            .as_ref()
            .and_then(|a| a.upstream_tx.as_ref())
            .ok_or_else(|| BridgeError::InvalidState("receiver is not connected".to_string()))?;
        tx.send(command)
            .map_err(|_| BridgeError::SourceLost(self.source.clone().unwrap_or_default()))
    }

    /// Stop pulling and release the source. Frames already handed out stay valid.
    pub fn disconnect(&mut self) {
        self.reap();
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.shared.cancel.store(true, Ordering::Release);
        active.upstream_tx.take();
        if let Some(handle) = active.thread.take() {
            let _ = handle.join();
        }

        if let Some(source) = &self.source {
            self.registry.release(source, self.id);
            let stats = self.stats();
            tracing::info!(
                "Receiver '{}': Disconnected from {} ({} frames, {} dropped, {} held)",
                self.id,
                source,
                stats.video_frames,
                stats.video_dropped() + stats.frames_overwritten,
                stats.frames_held
            );
        }
        self.hold.reset();
        self.shared.video.clear();
        self.state = ReceiverState::Disconnected;
        self.reason = Some(DisconnectReason::Requested);
    }

    pub fn stats(&self) -> ReceiverStats {
        let last_timecode = *self.shared.last_timecode.lock().unwrap_or_else(|e| e.into_inner());
        let name = self.source.as_deref().unwrap_or(&self.config.source_name);
        let mut stats = self.shared.counters.snapshot(name, last_timecode);
        stats.frames_overwritten = self.shared.video.overwrites();
        stats
    }
}

impl Drop for ReceiverPipeline {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl PullWorker {
    fn run(mut self) {
        tracing::info!("Receiver '{}': Pull thread started for {}", self.id, self.source);
        loop {
            if self.shared.cancel.load(Ordering::Acquire) {
                break;
            }
            self.forward_upstream();

            match self.connection.receive(self.timeout) {
                Ok(Some(TransportPacket::Video(packet))) => {
                    if let Some(frame) = self.assembler.push(packet) {
                        self.handle_video(frame);
                    }
                }
                Ok(Some(TransportPacket::Audio(packet))) => self.handle_audio(packet),
                Ok(Some(TransportPacket::Metadata(packet))) => self.handle_metadata(packet),
                Ok(Some(TransportPacket::StatusChange)) | Ok(None) => {}
                Err(TransportError::ConnectionReset(_)) | Err(TransportError::Closed) => {
                    self.source_lost();
                    break;
                }
                Err(e) => {
                    tracing::warn!("Receiver '{}': Receive failed: {}", self.id, e);
                    self.source_lost();
                    break;
                }
            }
        }

        let dropped = self.connection.dropped_packets();
        if dropped > 0 {
            tracing::debug!("Receiver '{}': Transport dropped {} packets", self.id, dropped);
        }
        self.connection.close();
        tracing::info!("Receiver '{}': Pull thread stopped", self.id);
    }

    fn forward_upstream(&mut self) {
        while let Ok(command) = self.upstream_rx.try_recv() {
            let result = match command {
                Upstream::Metadata(packet) => self.connection.send_metadata(&packet),
                Upstream::Tally(tally) => self.connection.set_tally(tally),
            };
            if let Err(e) = result {
                tracing::debug!("Receiver '{}': Upstream send failed: {}", self.id, e);
            }
        }
    }

    fn source_lost(&mut self) {
        self.registry.mark_lost(&self.source);
        self.registry.release(&self.source, self.id);
        self.shared.lost.store(true, Ordering::Release);
        tracing::warn!("Receiver '{}': Source {} lost", self.id, self.source);
    }

    fn handle_video(&mut self, frame: AssembledFrame) {
        let counters = &self.shared.counters;
        counters.frames_incomplete.fetch_add(frame.discarded, Ordering::Relaxed);
        counters.frames_lost.fetch_add(frame.lost, Ordering::Relaxed);
        if frame.lost > 0 {
            tracing::debug!(
                "Receiver '{}': {} frames lost before {}",
                self.id,
                frame.lost,
                frame.sequence
            );
        }
        if self.config.mute_video {
            return;
        }

        let header = frame.header;
        let decoded = match frame.contiguous() {
            Some(bytes) => {
                self.converter
                    .decode_frame(&header, bytes, self.config.pixel_format, &self.video_pool)
            }
            None => {
                self.scratch.resize(frame.len(), 0);
                frame.copy_into(&mut self.scratch);
                self.converter
                    .decode_frame(
                        &header,
                        &self.scratch,
                        self.config.pixel_format,
                        &self.video_pool,
                    )
            }
        };
        let mut video = match decoded {
            Ok(video) => video,
            Err(e) => {
                counters.frames_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Receiver '{}': Frame {} conversion failed: {}",
                    self.id,
                    frame.sequence,
                    e
                );
                return;
            }
        };

        if let Some(clock) = self.clock.as_mut() {
            let stamp = clock.stamp_video();
            self.clock_offset = stamp.timestamp - header.timestamp;
            video.apply_stamp(&stamp, header.frame_rate);
        }
        *self
            .shared
            .last_timecode
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(header.timestamp);

        let count = counters.video_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 300 == 0 {
            tracing::debug!(
                "Receiver '{}': {} frames, {} incomplete, {} lost, {} overwritten",
                self.id,
                count,
                counters.frames_incomplete.load(Ordering::Relaxed),
                counters.frames_lost.load(Ordering::Relaxed),
                self.shared.video.overwrites()
            );
        }
        if self.shared.video.publish(video).is_some() {
            tracing::trace!("Receiver '{}': Unconsumed frame overwritten", self.id);
        }
    }

    fn handle_audio(&mut self, packet: AudioPacket) {
        let counters = &self.shared.counters;
        if self.config.mute_audio {
            counters.audio_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(expected) = self.config.audio {
            if let Err(e) = ensure_format(expected, packet.format) {
                counters.audio_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Receiver '{}': Audio dropped: {}", self.id, e);
                return;
            }
        }

        let frame = self.audio_converter.from_wire(
            packet.format,
            packet.samples_per_channel,
            &packet.samples,
            SampleFormat::F32Planar,
            &self.audio_pool,
        );
        let mut frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                counters.audio_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Receiver '{}': Audio conversion failed: {}", self.id, e);
                return;
            }
        };
        frame.timestamp = packet.timestamp + self.clock_offset;

        counters.audio_frames.fetch_add(1, Ordering::Relaxed);
        let kept_all = self.shared.audio.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
        if !kept_all {
            counters.audio_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_metadata(&mut self, packet: MetadataPacket) {
        self.shared.counters.metadata_frames.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.shared.metadata.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= METADATA_QUEUE {
            queue.pop_front();
        }
        queue.push_back(packet);
    }
}
