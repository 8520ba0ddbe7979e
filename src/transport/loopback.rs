//! In-process transport
//!
//! Senders and receivers created from clones of the same
//! [`LoopbackTransport`] share a hub. Video frames are copied once into a
//! `Bytes` buffer and split into fragments that reference it; fragments can
//! be shuffled with a seeded RNG to exercise receive-side reassembly. Each
//! receiver has a bounded packet queue that drops its oldest packet when
//! full, the way a lossy network link would.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    AudioPacket, Bandwidth, ConnectOptions, ReceiveConnection, SendConnection, SenderOptions,
    SourceAdvert, Tally, Transport, TransportError, TransportPacket, VideoPacket,
};
use crate::media::{MetadataPacket, WireAudioFrame, WireFrame};
use crate::registry::format_source_name;

/// Loopback behaviour knobs.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Machine part of published names; defaults to the host name
    pub machine_name: Option<String>,
    /// Largest video fragment in bytes
    pub fragment_size: usize,
    /// Deliver each frame's fragments in a shuffled order
    pub shuffle_fragments: bool,
    pub seed: u64,
    /// Packets buffered per receiver before the oldest is dropped
    pub receiver_queue: usize,
    /// Added to every video send, to model a slow link
    pub send_delay: Option<Duration>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            machine_name: None,
            fragment_size: 64 * 1024,
            shuffle_fragments: false,
            seed: 0x5eed,
            receiver_queue: 1024,
            send_delay: None,
        }
    }
}

fn local_machine_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_uppercase())
        .unwrap_or_else(|_| "LOCALHOST".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-receiver packet queue.
struct Link {
    id: u64,
    bandwidth: Bandwidth,
    capacity: usize,
    queue: Mutex<VecDeque<TransportPacket>>,
    ready: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
    tally: Mutex<Tally>,
}

impl Link {
    fn push(&self, packet: TransportPacket) {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(packet);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _queue = lock(&self.queue);
        self.ready.notify_all();
    }
}

struct SourceEntry {
    id: u64,
    advert: SourceAdvert,
    connection_metadata: Vec<MetadataPacket>,
    links: Vec<Arc<Link>>,
    upstream: VecDeque<MetadataPacket>,
}

struct Hub {
    config: LoopbackConfig,
    machine: String,
    ready: AtomicBool,
    next_id: AtomicU64,
    sources: Mutex<BTreeMap<String, SourceEntry>>,
}

impl Hub {
    fn links(&self, name: &str, id: u64) -> Option<Vec<Arc<Link>>> {
        let sources = lock(&self.sources);
        sources
            .get(name)
            .filter(|entry| entry.id == id)
            .map(|entry| entry.links.clone())
    }
}

/// Transport whose network is a shared in-memory hub.
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        let machine = config
            .machine_name
            .clone()
            .unwrap_or_else(local_machine_name);
        Self {
            hub: Arc::new(Hub {
                config,
                machine,
                ready: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                sources: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Simulate the network layer going up or down.
    pub fn set_ready(&self, ready: bool) {
        self.hub.ready.store(ready, Ordering::SeqCst);
    }

    /// Number of receivers attached to a published source.
    pub fn receiver_count(&self, name: &str) -> usize {
        lock(&self.hub.sources)
            .get(name)
            .map(|entry| entry.links.len())
            .unwrap_or(0)
    }

    /// Withdraw a source as if its sender vanished; attached receivers see a reset.
    pub fn drop_source(&self, name: &str) -> bool {
        let removed = lock(&self.hub.sources).remove(name);
        match removed {
            Some(entry) => {
                for link in &entry.links {
                    link.close();
                }
                true
            }
            None => false,
        }
    }
}

impl Transport for LoopbackTransport {
    fn is_ready(&self) -> bool {
        self.hub.ready.load(Ordering::SeqCst)
    }

    fn machine_name(&self) -> String {
        self.hub.machine.clone()
    }

    fn discover(&self) -> Result<Vec<SourceAdvert>, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady("loopback hub offline".to_string()));
        }
        let sources = lock(&self.hub.sources);
        Ok(sources.values().map(|entry| entry.advert.clone()).collect())
    }

    fn open_sender(
        &self,
        options: &SenderOptions,
    ) -> Result<Box<dyn SendConnection>, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady("loopback hub offline".to_string()));
        }
        let name = format_source_name(&self.hub.machine, &options.stream_name);
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);

        let mut sources = lock(&self.hub.sources);
        if sources.contains_key(&name) {
            return Err(TransportError::NameInUse(name));
        }
        sources.insert(
            name.clone(),
            SourceEntry {
                id,
                advert: SourceAdvert {
                    name: name.clone(),
                    url: Some(format!("loopback://{}/{}", self.hub.machine, id)),
                    video: Some(options.video),
                    audio: options.audio,
                },
                connection_metadata: options.connection_metadata.clone(),
                links: Vec::new(),
                upstream: VecDeque::new(),
            },
        );

        Ok(Box::new(LoopbackSender {
            hub: Arc::clone(&self.hub),
            name,
            id,
            sequence: 0,
            rng: StdRng::seed_from_u64(self.hub.config.seed),
            closed: false,
        }))
    }

    fn connect(
        &self,
        source: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn ReceiveConnection>, TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady("loopback hub offline".to_string()));
        }
        let link = Arc::new(Link {
            id: self.hub.next_id.fetch_add(1, Ordering::Relaxed),
            bandwidth: options.bandwidth,
            capacity: self.hub.config.receiver_queue.max(1),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            tally: Mutex::new(Tally::default()),
        });

        let mut sources = lock(&self.hub.sources);
        let entry = sources
            .get_mut(source)
            .ok_or_else(|| TransportError::NotFound(source.to_string()))?;
        for packet in &entry.connection_metadata {
            link.push(TransportPacket::Metadata(packet.clone()));
        }
        entry.links.push(Arc::clone(&link));

        Ok(Box::new(LoopbackReceiver {
            hub: Arc::clone(&self.hub),
            source: source.to_string(),
            source_id: entry.id,
            link,
            closed: false,
        }))
    }
}

struct LoopbackSender {
    hub: Arc<Hub>,
    name: String,
    id: u64,
    sequence: u64,
    rng: StdRng,
    closed: bool,
}

impl LoopbackSender {
    fn links(&self) -> Result<Vec<Arc<Link>>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.hub.links(&self.name, self.id).ok_or(TransportError::Closed)
    }
}

impl SendConnection for LoopbackSender {
    fn send_video(&mut self, frame: &WireFrame) -> Result<(), TransportError> {
        if let Some(delay) = self.hub.config.send_delay {
            std::thread::sleep(delay);
        }
        let links = self.links()?;
        let sequence = self.sequence;
        self.sequence += 1;

        let payload = Bytes::copy_from_slice(frame.payload());
        let chunk = self.hub.config.fragment_size.max(1);
        let count = payload.len().div_ceil(chunk).clamp(1, u16::MAX as usize);
        let chunk = payload.len().div_ceil(count).max(1);

        let mut packets: Vec<VideoPacket> = (0..count)
            .map(|i| {
                let start = (i * chunk).min(payload.len());
                let end = ((i + 1) * chunk).min(payload.len());
                VideoPacket {
                    sequence,
                    fragment: i as u16,
                    fragment_count: count as u16,
                    header: frame.header,
                    payload: payload.slice(start..end),
                }
            })
            .collect();
        if self.hub.config.shuffle_fragments {
            packets.shuffle(&mut self.rng);
        }

        for link in links.iter().filter(|l| l.bandwidth.carries_video()) {
            for packet in &packets {
                link.push(TransportPacket::Video(packet.clone()));
            }
        }
        Ok(())
    }

    fn send_audio(&mut self, frame: &WireAudioFrame) -> Result<(), TransportError> {
        let links = self.links()?;
        let packet = AudioPacket {
            format: frame.format,
            samples_per_channel: frame.samples_per_channel,
            timestamp: frame.timestamp,
            samples: Arc::from(frame.samples()),
        };
        for link in links.iter().filter(|l| l.bandwidth.carries_audio()) {
            link.push(TransportPacket::Audio(packet.clone()));
        }
        Ok(())
    }

    fn send_metadata(&mut self, packet: &MetadataPacket) -> Result<(), TransportError> {
        for link in self.links()? {
            link.push(TransportPacket::Metadata(packet.clone()));
        }
        Ok(())
    }

    fn connection_count(&self) -> usize {
        self.hub.links(&self.name, self.id).map(|l| l.len()).unwrap_or(0)
    }

    fn tally(&self) -> Tally {
        self.hub
            .links(&self.name, self.id)
            .unwrap_or_default()
            .iter()
            .fold(Tally::default(), |acc, link| acc.merge(*lock(&link.tally)))
    }

    fn poll_upstream(&mut self) -> Option<MetadataPacket> {
        let mut sources = lock(&self.hub.sources);
        sources
            .get_mut(&self.name)
            .filter(|entry| entry.id == self.id)
            .and_then(|entry| entry.upstream.pop_front())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut sources = lock(&self.hub.sources);
        if sources.get(&self.name).map(|e| e.id) == Some(self.id) {
            if let Some(entry) = sources.remove(&self.name) {
                for link in &entry.links {
                    link.close();
                }
            }
        }
    }
}

impl Drop for LoopbackSender {
    fn drop(&mut self) {
        self.close();
    }
}

struct LoopbackReceiver {
    hub: Arc<Hub>,
    source: String,
    source_id: u64,
    link: Arc<Link>,
    closed: bool,
}

impl ReceiveConnection for LoopbackReceiver {
    fn receive(&mut self, timeout: Duration) -> Result<Option<TransportPacket>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.link.queue);
        loop {
            if let Some(packet) = queue.pop_front() {
                return Ok(Some(packet));
            }
            if self.link.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionReset(self.source.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            queue = self
                .link
                .ready
                .wait_timeout(queue, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn send_metadata(&mut self, packet: &MetadataPacket) -> Result<(), TransportError> {
        let mut sources = lock(&self.hub.sources);
        match sources.get_mut(&self.source).filter(|e| e.id == self.source_id) {
            Some(entry) => {
                entry.upstream.push_back(packet.clone());
                Ok(())
            }
            None => Err(TransportError::ConnectionReset(self.source.clone())),
        }
    }

    fn set_tally(&mut self, tally: Tally) -> Result<(), TransportError> {
        *lock(&self.link.tally) = tally;
        Ok(())
    }

    fn dropped_packets(&self) -> u64 {
        self.link.dropped.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.link.close();
        let mut sources = lock(&self.hub.sources);
        if let Some(entry) = sources.get_mut(&self.source).filter(|e| e.id == self.source_id) {
            entry.links.retain(|l| l.id != self.link.id);
        }
    }
}

impl Drop for LoopbackReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioFormat, WireFormat, WireVideoHeader};
    use crate::pool::PooledBuffer;
    use crate::timing::FrameRate;
    use crate::transport::VideoAdvert;

    fn transport(config: LoopbackConfig) -> LoopbackTransport {
        LoopbackTransport::new(LoopbackConfig {
            machine_name: Some("STUDIO".to_string()),
            ..config
        })
    }

    fn sender_options(name: &str) -> SenderOptions {
        SenderOptions {
            stream_name: name.to_string(),
            video: VideoAdvert {
                width: 4,
                height: 2,
                frame_rate: FrameRate::FPS_30,
                format: WireFormat::Bgra,
            },
            audio: Some(AudioFormat::new(48_000, 2)),
            connection_metadata: vec![MetadataPacket::xml("<hello/>")],
        }
    }

    fn wire_frame(fill: u8) -> WireFrame {
        let header = WireVideoHeader {
            width: 4,
            height: 2,
            format: WireFormat::Bgra,
            frame_rate: FrameRate::FPS_30,
            timestamp: 0,
            timecode: None,
            frame_index: 0,
        };
        WireFrame {
            header,
            data: PooledBuffer::detached(vec![fill; header.data_len()]),
        }
    }

    #[test]
    fn test_discover_and_name_collision() {
        let transport = transport(LoopbackConfig::default());
        let _sender = transport.open_sender(&sender_options("Test")).unwrap();
        let sources = transport.discover().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "STUDIO (Test)");

        let err = transport.open_sender(&sender_options("Test")).err().unwrap();
        assert_eq!(err, TransportError::NameInUse("STUDIO (Test)".to_string()));
    }

    #[test]
    fn test_fragments_reach_receiver() {
        let transport = transport(LoopbackConfig {
            fragment_size: 5,
            shuffle_fragments: true,
            ..Default::default()
        });
        let mut sender = transport.open_sender(&sender_options("Test")).unwrap();
        let mut receiver = transport
            .connect("STUDIO (Test)", &ConnectOptions::default())
            .unwrap();
        assert_eq!(sender.connection_count(), 1);

        // Connection metadata arrives first
        match receiver.receive(Duration::from_millis(10)).unwrap() {
            Some(TransportPacket::Metadata(m)) => assert_eq!(m.as_xml(), Some("<hello/>")),
            other => panic!("unexpected {:?}", other),
        }

        sender.send_video(&wire_frame(7)).unwrap();
        let mut seen = vec![false; 7];
        let mut bytes = 0;
        while let Some(TransportPacket::Video(p)) =
            receiver.receive(Duration::from_millis(10)).unwrap()
        {
            assert_eq!(p.fragment_count, 7);
            seen[p.fragment as usize] = true;
            bytes += p.payload.len();
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(bytes, 32);
    }

    #[test]
    fn test_sender_close_resets_receivers() {
        let transport = transport(LoopbackConfig::default());
        let mut sender = transport.open_sender(&sender_options("Test")).unwrap();
        let mut receiver = transport
            .connect("STUDIO (Test)", &ConnectOptions::default())
            .unwrap();
        let _ = receiver.receive(Duration::from_millis(1));
        sender.close();

        let err = receiver.receive(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, TransportError::ConnectionReset("STUDIO (Test)".to_string()));
        assert!(transport.discover().unwrap().is_empty());
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let transport = transport(LoopbackConfig {
            receiver_queue: 2,
            ..Default::default()
        });
        let mut sender = transport.open_sender(&sender_options("Test")).unwrap();
        let mut receiver = transport
            .connect("STUDIO (Test)", &ConnectOptions::default())
            .unwrap();
        for fill in 0..3 {
            sender.send_video(&wire_frame(fill)).unwrap();
        }
        assert_eq!(receiver.dropped_packets(), 2);
        match receiver.receive(Duration::from_millis(1)).unwrap() {
            Some(TransportPacket::Video(p)) => assert_eq!(p.sequence, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_upstream_metadata_and_tally() {
        let transport = transport(LoopbackConfig::default());
        let mut sender = transport.open_sender(&sender_options("Test")).unwrap();
        let mut receiver = transport
            .connect("STUDIO (Test)", &ConnectOptions::default())
            .unwrap();

        receiver.set_tally(Tally { on_program: true, on_preview: false }).unwrap();
        receiver.send_metadata(&MetadataPacket::xml("<ptz_zoom zoom=\"0.5\"/>")).unwrap();

        assert!(sender.tally().on_program);
        let upstream = sender.poll_upstream().unwrap();
        assert_eq!(upstream.as_xml(), Some("<ptz_zoom zoom=\"0.5\"/>"));

        receiver.close();
        assert_eq!(sender.connection_count(), 0);
    }

    #[test]
    fn test_audio_only_bandwidth_skips_video() {
        let transport = transport(LoopbackConfig::default());
        let mut sender = transport.open_sender(&sender_options("Test")).unwrap();
        let mut receiver = transport
            .connect(
                "STUDIO (Test)",
                &ConnectOptions {
                    receiver_name: "rx".to_string(),
                    bandwidth: Bandwidth::AudioOnly,
                },
            )
            .unwrap();
        let _ = receiver.receive(Duration::from_millis(1));
        sender.send_video(&wire_frame(1)).unwrap();
        assert!(receiver.receive(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_not_ready() {
        let transport = transport(LoopbackConfig::default());
        transport.set_ready(false);
        assert!(matches!(transport.discover(), Err(TransportError::NotReady(_))));
        assert!(transport.open_sender(&sender_options("Test")).is_err());
    }
}
