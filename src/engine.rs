//! Engine-facing capability traits.
//!
//! The host engine drives these once per tick. They hide whether frames go
//! out to the network or come in from it behind the same shape of calls.

use crate::media::{AudioFrame, MetadataPacket, VideoFrame};
use crate::receiver::{ReceiverPipeline, ReceiverState};
use crate::sender::{PushOutcome, SenderPipeline, SenderState};
use crate::timing::FrameRate;

/// A render output published to the network.
pub trait MediaOutput: Send {
    /// Published stream name, if configured.
    fn output_name(&self) -> Option<String>;

    /// Output resolution in pixels.
    fn resolution(&self) -> Option<(u32, u32)>;

    fn frame_rate(&self) -> Option<FrameRate>;

    /// Whether alpha is carried on the wire.
    fn alpha(&self) -> bool;

    fn is_active(&self) -> bool;

    /// Check if any receivers are connected.
    fn has_receivers(&self) -> bool;

    /// Hand over this tick's frame. Must not block.
    fn push(
        &mut self,
        video: &VideoFrame,
        audio: Option<&AudioFrame>,
        metadata: Option<MetadataPacket>,
    ) -> PushOutcome;

    /// Stop publishing and release resources.
    fn stop(&mut self);
}

/// A network source feeding the engine.
pub trait MediaSource: Send {
    /// Full name of the connected source.
    fn source_name(&self) -> Option<String>;

    /// Resolution of the most recent frame.
    fn resolution(&self) -> Option<(u32, u32)>;

    fn frame_rate(&self) -> Option<FrameRate>;

    /// Whether delivered frames keep the source alpha.
    fn alpha(&self) -> bool;

    fn is_active(&self) -> bool;

    /// Frame to present this tick. Returns the held frame when nothing new arrived.
    fn pull(&mut self) -> Option<VideoFrame>;

    /// Audio matching `frame`, if any.
    fn pull_audio(&mut self, frame: &VideoFrame) -> Option<AudioFrame>;

    /// Metadata received since the last call.
    fn pull_metadata(&mut self) -> Vec<MetadataPacket>;

    /// Disconnect from the source.
    fn stop(&mut self);
}

impl MediaOutput for SenderPipeline {
    fn output_name(&self) -> Option<String> {
        self.config().map(|c| c.name.clone())
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.config().map(|c| (c.width, c.height))
    }

    fn frame_rate(&self) -> Option<FrameRate> {
        self.config().map(|c| c.frame_rate)
    }

    fn alpha(&self) -> bool {
        self.config().is_some_and(|c| c.alpha)
    }

    fn is_active(&self) -> bool {
        self.state() == SenderState::Streaming
    }

    fn has_receivers(&self) -> bool {
        self.connection_count() > 0
    }

    fn push(
        &mut self,
        video: &VideoFrame,
        audio: Option<&AudioFrame>,
        metadata: Option<MetadataPacket>,
    ) -> PushOutcome {
        self.push_frame(video, audio, metadata)
    }

    fn stop(&mut self) {
        SenderPipeline::stop(self);
    }
}

impl MediaSource for ReceiverPipeline {
    fn source_name(&self) -> Option<String> {
        ReceiverPipeline::source_name(self).map(str::to_string)
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.last_frame().map(|f| (f.width(), f.height()))
    }

    fn frame_rate(&self) -> Option<FrameRate> {
        (self.state() == ReceiverState::Connected).then(|| ReceiverPipeline::frame_rate(self))
    }

    fn alpha(&self) -> bool {
        self.config().alpha
    }

    fn is_active(&self) -> bool {
        self.state() == ReceiverState::Connected
    }

    fn pull(&mut self) -> Option<VideoFrame> {
        self.latest_frame()
    }

    fn pull_audio(&mut self, frame: &VideoFrame) -> Option<AudioFrame> {
        self.audio_for_frame(frame)
    }

    fn pull_metadata(&mut self) -> Vec<MetadataPacket> {
        self.take_metadata()
    }

    fn stop(&mut self) {
        self.disconnect();
    }
}
