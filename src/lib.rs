//! Immersive Bridge Library
//!
//! Bridges a real-time engine's render and audio pipeline with a network
//! live-media transport. Rendered frames are converted and published as named
//! sources; remote sources are discovered, pulled and handed back to the
//! engine as pooled frames with frame-hold and audio/video sync.

pub mod bridge;
pub mod convert;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod media;
pub mod pool;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod settings;
pub mod telemetry;
pub mod timing;
pub mod transport;

pub use bridge::MediaBridge;
pub use convert::{AudioConverter, ConversionOptions, ConvertError, VideoConverter};
pub use engine::{MediaOutput, MediaSource};
pub use error::{BridgeError, DropReason, Result};
pub use media::{
    AudioFormat, AudioFrame, MetadataPacket, PixelFormat, VideoFrame, WireFamily, WireFormat,
    WireFrame,
};
pub use pool::{BufferSpec, FramePool, PoolError, PooledBuffer};
pub use receiver::{DisconnectReason, FramePoll, ReceiverConfig, ReceiverPipeline, ReceiverState};
pub use registry::{Source, SourceRegistry, SourceState};
pub use sender::{PushOutcome, SendTargetConfig, SenderPipeline, SenderState};
pub use settings::{BridgeSettings, SettingsError};
pub use telemetry::{init_logging, LogConfig, ReceiverStats, SenderStats};
pub use timing::{FrameRate, HoldOutcome, Timecode};
pub use transport::{Bandwidth, LoopbackTransport, Tally, Transport};
