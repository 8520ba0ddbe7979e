//! Media data model: formats, frames and metadata

pub mod format;
pub mod frame;
pub mod metadata;

pub use format::{AudioFormat, PixelFormat, SampleFormat, WireFamily, WireFormat};
pub use frame::{AudioFrame, VideoFrame, WireAudioFrame, WireFrame, WireVideoHeader};
pub use metadata::{
    parse_xml_element, ptz_capabilities, xml_element, xml_element_with_attributes,
    MetadataPacket, XmlElement,
};
