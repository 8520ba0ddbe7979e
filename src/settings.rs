//! Bridge configuration
//!
//! Handles loading/saving of the bridge XML settings file: send targets,
//! receivers, timing policy, discovery and pool sizing.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::receiver::ReceiverConfig;
use crate::sender::SendTargetConfig;

/// Staleness and buffering policy shared by all pipelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Frames a sender may fall behind before new frames are dropped (0-16)
    #[serde(rename = "maxLagFrames", default = "default_max_lag_frames")]
    pub max_lag_frames: usize,

    /// Sender hand-off queue depth (1-16)
    #[serde(rename = "senderQueueDepth", default = "default_sender_queue_depth")]
    pub sender_queue_depth: usize,

    /// Frame intervals without a new frame before a repeat is counted as held
    #[serde(rename = "holdAfterIntervals", default = "default_hold_after_intervals")]
    pub hold_after_intervals: f32,

    /// Audio/video drift that triggers a resync
    #[serde(rename = "audioResyncThresholdMs", default = "default_audio_resync_threshold_ms")]
    pub audio_resync_threshold_ms: u64,

    /// Partial frames the receive assembler keeps in flight
    #[serde(rename = "maxPendingFrames", default = "default_max_pending_frames")]
    pub max_pending_frames: usize,

    /// Blocking receive timeout; bounds how long disconnect waits for the pull thread
    #[serde(rename = "receiveTimeoutMs", default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Received audio blocks queued for A/V matching
    #[serde(rename = "audioQueueFrames", default = "default_audio_queue_frames")]
    pub audio_queue_frames: usize,
}

fn default_max_lag_frames() -> usize {
    2
}

fn default_sender_queue_depth() -> usize {
    3
}

fn default_hold_after_intervals() -> f32 {
    1.0
}

fn default_audio_resync_threshold_ms() -> u64 {
    50
}

fn default_max_pending_frames() -> usize {
    4
}

fn default_receive_timeout_ms() -> u64 {
    100
}

fn default_audio_queue_frames() -> usize {
    16
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            max_lag_frames: default_max_lag_frames(),
            sender_queue_depth: default_sender_queue_depth(),
            hold_after_intervals: default_hold_after_intervals(),
            audio_resync_threshold_ms: default_audio_resync_threshold_ms(),
            max_pending_frames: default_max_pending_frames(),
            receive_timeout_ms: default_receive_timeout_ms(),
            audio_queue_frames: default_audio_queue_frames(),
        }
    }
}

impl TimingSettings {
    pub fn clamp(&mut self) {
        self.max_lag_frames = self.max_lag_frames.min(16);
        self.sender_queue_depth = self.sender_queue_depth.clamp(1, 16);
        if !self.hold_after_intervals.is_finite() {
            self.hold_after_intervals = default_hold_after_intervals();
        }
        self.hold_after_intervals = self.hold_after_intervals.clamp(0.0, 60.0);
        self.audio_resync_threshold_ms = self.audio_resync_threshold_ms.clamp(1, 10_000);
        self.max_pending_frames = self.max_pending_frames.clamp(1, 64);
        self.receive_timeout_ms = self.receive_timeout_ms.clamp(1, 5_000);
        self.audio_queue_frames = self.audio_queue_frames.clamp(1, 1_024);
    }

    pub fn audio_resync_threshold(&self) -> Duration {
        Duration::from_millis(self.audio_resync_threshold_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Hold interval for a stream with the given frame interval.
    pub fn hold_after(&self, frame_interval: Duration) -> Duration {
        frame_interval.mul_f32(self.hold_after_intervals.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(rename = "enabled", default = "default_discovery_enabled")]
    pub enabled: bool,

    #[serde(rename = "pollIntervalMs", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sources unseen for longer than this are evicted
    #[serde(rename = "evictionTimeoutMs", default = "default_eviction_timeout_ms")]
    pub eviction_timeout_ms: u64,
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_eviction_timeout_ms() -> u64 {
    5000
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: default_discovery_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            eviction_timeout_ms: default_eviction_timeout_ms(),
        }
    }
}

impl DiscoverySettings {
    pub fn clamp(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 60_000);
        // Evicting before the next poll could run would drop every source
        self.eviction_timeout_ms = self.eviction_timeout_ms.max(self.poll_interval_ms * 2);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Ceiling on buffers per pool
    #[serde(rename = "maxBuffers", default = "default_max_buffers")]
    pub max_buffers: usize,

    /// Buffers allocated up front when a sender is configured
    #[serde(rename = "preallocate", default = "default_preallocate")]
    pub preallocate: usize,
}

fn default_max_buffers() -> usize {
    16
}

fn default_preallocate() -> usize {
    3
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_buffers: default_max_buffers(),
            preallocate: default_preallocate(),
        }
    }
}

impl PoolSettings {
    pub fn clamp(&mut self) {
        self.max_buffers = self.max_buffers.clamp(2, 256);
        self.preallocate = self.preallocate.min(self.max_buffers);
    }
}

/// Root of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename = "BridgeSettings")]
pub struct BridgeSettings {
    #[serde(rename = "sender", default)]
    pub senders: Vec<SendTargetConfig>,

    #[serde(rename = "receiver", default)]
    pub receivers: Vec<ReceiverConfig>,

    #[serde(rename = "timing", default)]
    pub timing: TimingSettings,

    #[serde(rename = "discovery", default)]
    pub discovery: DiscoverySettings,

    #[serde(rename = "pool", default)]
    pub pool: PoolSettings,
}

impl BridgeSettings {
    /// Bring every value into its supported range.
    pub fn clamp(&mut self) {
        self.timing.clamp();
        self.discovery.clamp();
        self.pool.clamp();
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(SettingsError::Io)?;
        let mut settings: Self = from_str(&contents).map_err(SettingsError::XmlParse)?;
        settings.clamp();
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let xml = to_string(self).map_err(SettingsError::XmlWrite)?;
        let formatted = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", xml);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(SettingsError::Io)?;
            }
        }
        fs::write(path, formatted).map_err(SettingsError::Io)?;
        Ok(())
    }

    /// `<config dir>/ImmersiveBridge/bridge.xml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("ImmersiveBridge");
            p.push("bridge.xml");
            p
        })
    }

    /// Load from the default path, falling back to defaults if missing or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Settings: Failed to load {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::default_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to_file(&path)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("XML parse error: {0}")]
    XmlParse(quick_xml::DeError),

    #[error("XML write error: {0}")]
    XmlWrite(quick_xml::SeError),

    #[error("Could not find config directory")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ColorCorrection;
    use crate::media::{AudioFormat, WireFamily};
    use crate::timing::FrameRate;
    use crate::transport::Bandwidth;

    #[test]
    fn test_default_settings() {
        let settings = BridgeSettings::default();
        assert!(settings.senders.is_empty());
        assert_eq!(settings.timing.max_lag_frames, 2);
        assert_eq!(settings.timing.sender_queue_depth, 3);
        assert_eq!(settings.discovery.poll_interval_ms, 1000);
        assert_eq!(settings.discovery.eviction_timeout_ms, 5000);
        assert_eq!(settings.pool.max_buffers, 16);
    }

    #[test]
    fn test_clamping() {
        let mut settings = BridgeSettings::default();
        settings.timing.sender_queue_depth = 0;
        settings.timing.hold_after_intervals = f32::NAN;
        settings.discovery.poll_interval_ms = 1000;
        settings.discovery.eviction_timeout_ms = 10;
        settings.pool.max_buffers = 1;
        settings.pool.preallocate = 10;
        settings.clamp();

        assert_eq!(settings.timing.sender_queue_depth, 1);
        assert_eq!(settings.timing.hold_after_intervals, 1.0);
        assert_eq!(settings.discovery.eviction_timeout_ms, 2000);
        assert_eq!(settings.pool.max_buffers, 2);
        assert_eq!(settings.pool.preallocate, 2);
    }

    #[test]
    fn test_xml_round_trip() {
        let mut settings = BridgeSettings::default();
        let mut sender = SendTargetConfig::new("Test", 1920, 1080, FrameRate::FPS_59_94);
        sender.alpha = true;
        sender.wire_format = WireFamily::P216;
        sender.color_correction = ColorCorrection::LinearToSrgb;
        sender.audio = Some(AudioFormat::new(48_000, 2));
        sender.audio_channel_map = vec![1, 0];
        settings.senders.push(sender);

        let mut receiver = ReceiverConfig::new("STUDIO (Camera 1)");
        receiver.bandwidth = Bandwidth::Lowest;
        settings.receivers.push(receiver);
        settings.timing.max_lag_frames = 4;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.xml");
        settings.save_to_file(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(contents.contains("<BridgeSettings>"));

        let loaded = BridgeSettings::load_from_file(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.xml");
        fs::write(
            &path,
            "<BridgeSettings><timing><maxLagFrames>5</maxLagFrames></timing></BridgeSettings>",
        )
        .unwrap();

        let loaded = BridgeSettings::load_from_file(&path).unwrap();
        assert_eq!(loaded.timing.max_lag_frames, 5);
        assert_eq!(loaded.timing.sender_queue_depth, 3);
        assert!(loaded.discovery.enabled);
        assert!(loaded.receivers.is_empty());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeSettings::load_from_file(&dir.path().join("none.xml")).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
