//! Metadata packets and XML payload helpers
//!
//! A packet is an ordered list of opaque key/value entries. Entries are
//! passed through the bridge unmodified. Most network media tools exchange
//! small XML documents, so helpers are provided for building and reading
//! those.

use bytes::Bytes;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::timing::Ticks;

/// Entry key used for XML payloads.
pub const XML_KEY: &str = "xml";

/// Metadata attached to a video frame, or standalone when `frame_index` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataPacket {
    pub frame_index: Option<u64>,
    pub timecode: Option<Ticks>,
    entries: Vec<(String, Bytes)>,
}

impl MetadataPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_frame(frame_index: u64) -> Self {
        Self {
            frame_index: Some(frame_index),
            ..Self::default()
        }
    }

    /// A packet carrying a single XML document.
    pub fn xml(xml: impl Into<String>) -> Self {
        Self::new().with_entry(XML_KEY, xml.into())
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add an entry, replacing any existing value for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The XML entry, if present and valid UTF-8.
    pub fn as_xml(&self) -> Option<&str> {
        self.get(XML_KEY).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// `<element>data</element>` with `data` escaped.
pub fn xml_element(element: &str, data: &str) -> String {
    format!("<{element}>{}</{element}>", escape(data))
}

/// `<element key="value" .../>` with values escaped.
pub fn xml_element_with_attributes(element: &str, attributes: &[(&str, &str)]) -> String {
    let mut xml = format!("<{element}");
    for (key, value) in attributes {
        xml.push_str(&format!(" {key}=\"{}\"", escape(*value)));
    }
    xml.push_str("/>");
    xml
}

/// Connection metadata advertising pan/tilt/zoom control support.
pub fn ptz_capabilities(enabled: bool) -> String {
    if enabled {
        xml_element_with_attributes(
            "ndi_capabilities",
            &[
                ("ntk_ptz", "true"),
                ("ntk_pan_tilt", "true"),
                ("ntk_zoom", "true"),
                ("ntk_iris", "false"),
                ("ntk_white_balance", "false"),
                ("ntk_exposure", "false"),
                ("ntk_record", "false"),
            ],
        )
    } else {
        xml_element_with_attributes("ndi_capabilities", &[("ntk_ptz", "false")])
    }
}

/// Root element of a small XML document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
}

impl XmlElement {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse the root element's name, attributes and text.
pub fn parse_xml_element(xml: &str) -> Result<XmlElement, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut element = XmlElement::default();
    let mut depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if element.name.is_empty() => {
                element.name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                for attr in e.attributes() {
                    let attr = attr?;
                    element.attributes.push((
                        String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                        attr.unescape_value()?.into_owned(),
                    ));
                }
                depth = 1;
            }
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            Event::Text(t) if depth == 1 => {
                element.text.push_str(&t.unescape()?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(element)
}
