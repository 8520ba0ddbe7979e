//! Network transport capability
//!
//! The bridge never talks to a network SDK directly. A backend implements
//! [`Transport`] for discovery and connection setup; each open stream is a
//! [`SendConnection`] or [`ReceiveConnection`] owned by exactly one I/O
//! thread. [`loopback::LoopbackTransport`] implements the same interface
//! in-process.

pub mod loopback;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::media::{
    AudioFormat, MetadataPacket, WireAudioFrame, WireFormat, WireFrame, WireVideoHeader,
};
use crate::timing::{FrameRate, Ticks};

pub use loopback::{LoopbackConfig, LoopbackTransport};

/// Receive bandwidth requested from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Bandwidth {
    #[default]
    Highest,
    Lowest,
    AudioOnly,
    MetadataOnly,
}

impl Bandwidth {
    pub fn carries_video(&self) -> bool {
        matches!(self, Bandwidth::Highest | Bandwidth::Lowest)
    }

    pub fn carries_audio(&self) -> bool {
        !matches!(self, Bandwidth::MetadataOnly)
    }
}

/// On-air indication sent upstream by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tally {
    pub on_program: bool,
    pub on_preview: bool,
}

impl Tally {
    /// Combine tallies from several receivers.
    pub fn merge(self, other: Tally) -> Tally {
        Tally {
            on_program: self.on_program || other.on_program,
            on_preview: self.on_preview || other.on_preview,
        }
    }
}

/// Video stream description published with a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoAdvert {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub format: WireFormat,
}

/// A source as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAdvert {
    /// Full `MACHINE (STREAM)` name
    pub name: String,
    pub url: Option<String>,
    pub video: Option<VideoAdvert>,
    pub audio: Option<AudioFormat>,
}

/// Parameters for publishing a stream.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub stream_name: String,
    pub video: VideoAdvert,
    pub audio: Option<AudioFormat>,
    /// Delivered to every receiver when it connects
    pub connection_metadata: Vec<MetadataPacket>,
}

/// Parameters for connecting to a source.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub receiver_name: String,
    pub bandwidth: Bandwidth,
}

/// One fragment of a wire video frame.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    /// Per-connection send sequence, one per frame
    pub sequence: u64,
    pub fragment: u16,
    pub fragment_count: u16,
    pub header: WireVideoHeader,
    pub payload: Bytes,
}

/// A block of interleaved audio.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub format: AudioFormat,
    pub samples_per_channel: u32,
    pub timestamp: Ticks,
    pub samples: Arc<[f32]>,
}

#[derive(Debug, Clone)]
pub enum TransportPacket {
    Video(VideoPacket),
    Audio(AudioPacket),
    Metadata(MetadataPacket),
    /// Source settings changed
    StatusChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not ready: {0}")]
    NotReady(String),

    #[error("no such source: {0}")]
    NotFound(String),

    #[error("source name already published: {0}")]
    NameInUse(String),

    #[error("connection to {0} was reset")]
    ConnectionReset(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Discovery and connection setup.
pub trait Transport: Send + Sync {
    /// False until the underlying network layer is initialised.
    fn is_ready(&self) -> bool;

    /// Machine name used when publishing sources.
    fn machine_name(&self) -> String;

    /// Sources currently visible on the network.
    fn discover(&self) -> Result<Vec<SourceAdvert>, TransportError>;

    /// Publish a stream.
    fn open_sender(
        &self,
        options: &SenderOptions,
    ) -> Result<Box<dyn SendConnection>, TransportError>;

    /// Connect to a source by its full name.
    fn connect(
        &self,
        source: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ReceiveConnection>, TransportError>;
}

/// A published stream. May block on network I/O.
pub trait SendConnection: Send {
    fn send_video(&mut self, frame: &WireFrame) -> Result<(), TransportError>;

    fn send_audio(&mut self, frame: &WireAudioFrame) -> Result<(), TransportError>;

    fn send_metadata(&mut self, packet: &MetadataPacket) -> Result<(), TransportError>;

    /// Receivers currently connected.
    fn connection_count(&self) -> usize;

    fn tally(&self) -> Tally;

    /// Next metadata packet sent upstream by a receiver.
    fn poll_upstream(&mut self) -> Option<MetadataPacket>;

    /// Release any buffers the transport still references.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self);
}

/// A connection to a source. May block on network I/O.
pub trait ReceiveConnection: Send {
    /// Wait up to `timeout` for the next packet.
    fn receive(&mut self, timeout: Duration) -> Result<Option<TransportPacket>, TransportError>;

    /// Send metadata upstream to the source.
    fn send_metadata(&mut self, packet: &MetadataPacket) -> Result<(), TransportError>;

    fn set_tally(&mut self, tally: Tally) -> Result<(), TransportError>;

    /// Packets discarded by the transport before delivery.
    fn dropped_packets(&self) -> u64 {
        0
    }

    fn close(&mut self);
}
