//! Source registry
//!
//! Tracks every source seen by discovery and which receiver owns each one.
//! `list()` hands out a snapshot that is rebuilt only when a discovery poll
//! is applied, so callers iterating it see a stable view between polls.
//! Live state and ownership are read through `source_state` and changed
//! through `claim`/`release` under the registry lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::error::BridgeError;
use crate::media::AudioFormat;
use crate::transport::{SourceAdvert, Transport, TransportError, VideoAdvert};

/// Discovery state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceState {
    #[default]
    Unseen,
    Discovered,
    Connecting,
    Connected,
    Lost,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Unseen => write!(f, "unseen"),
            SourceState::Discovered => write!(f, "discovered"),
            SourceState::Connecting => write!(f, "connecting"),
            SourceState::Connected => write!(f, "connected"),
            SourceState::Lost => write!(f, "lost"),
        }
    }
}

/// A source known to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Full `MACHINE (STREAM)` name
    pub name: String,
    pub machine: String,
    pub stream: String,
    pub url: Option<String>,
    pub state: SourceState,
    pub video: Option<VideoAdvert>,
    pub audio: Option<AudioFormat>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Split `"MACHINE (STREAM)"` into its parts.
///
/// Returns `None` unless both parts are non-empty.
pub fn parse_source_name(name: &str) -> Option<(&str, &str)> {
    let open = name.find(" (")?;
    let machine = name[..open].trim();
    let stream = name[open + 2..].strip_suffix(')')?.trim();
    if machine.is_empty() || stream.is_empty() {
        return None;
    }
    Some((machine, stream))
}

pub fn format_source_name(machine: &str, stream: &str) -> String {
    format!("{} ({})", machine, stream)
}

/// Identifies a receiver pipeline for source ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId(pub u64);

impl std::fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rx-{}", self.0)
    }
}

/// Changes applied by one discovery poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Owned sources that timed out and were marked `Lost` instead of removed
    pub lost: Vec<String>,
}

impl PollSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.lost.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    sources: BTreeMap<String, Source>,
    owners: HashMap<String, ReceiverId>,
    snapshot: Arc<Vec<Source>>,
}

impl RegistryInner {
    fn rebuild_snapshot(&mut self) {
        self.snapshot = Arc::new(self.sources.values().cloned().collect());
    }
}

pub struct SourceRegistry {
    inner: RwLock<RegistryInner>,
    eviction_timeout: Duration,
    next_receiver: AtomicU64,
}

impl SourceRegistry {
    pub fn new(eviction_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            eviction_timeout,
            next_receiver: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn eviction_timeout(&self) -> Duration {
        self.eviction_timeout
    }

    pub fn next_receiver_id(&self) -> ReceiverId {
        ReceiverId(self.next_receiver.fetch_add(1, Ordering::Relaxed))
    }

    /// Query the transport and apply the result.
    pub fn poll(&self, transport: &dyn Transport) -> Result<PollSummary, TransportError> {
        self.poll_at(transport, Instant::now())
    }

    pub fn poll_at(
        &self,
        transport: &dyn Transport,
        now: Instant,
    ) -> Result<PollSummary, TransportError> {
        let adverts = transport.discover()?;
        Ok(self.apply_discovery(&adverts, now))
    }

    /// Merge one discovery result, evict stale sources and rebuild the snapshot.
    pub fn apply_discovery(&self, adverts: &[SourceAdvert], now: Instant) -> PollSummary {
        let mut summary = PollSummary::default();
        let mut guard = self.write();
        let inner = &mut *guard;

        for advert in adverts {
            let Some((machine, stream)) = parse_source_name(&advert.name) else {
                tracing::debug!("SourceRegistry: Ignoring malformed source name '{}'", advert.name);
                continue;
            };
            let owned = inner.owners.contains_key(&advert.name);
            match inner.sources.get_mut(&advert.name) {
                Some(source) => {
                    source.last_seen = now;
                    source.url = advert.url.clone();
                    source.video = advert.video;
                    source.audio = advert.audio;
                    if source.state == SourceState::Lost && !owned {
                        tracing::info!("SourceRegistry: Source '{}' is back", advert.name);
                        source.state = SourceState::Discovered;
                    }
                }
                None => {
                    tracing::info!("SourceRegistry: Found source '{}'", advert.name);
                    inner.sources.insert(
                        advert.name.clone(),
                        Source {
                            name: advert.name.clone(),
                            machine: machine.to_string(),
                            stream: stream.to_string(),
                            url: advert.url.clone(),
                            state: SourceState::Discovered,
                            video: advert.video,
                            audio: advert.audio,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                    summary.added.push(advert.name.clone());
                }
            }
        }

        // Owned sources stay as `Lost` until their receiver releases them
        let timeout = self.eviction_timeout;
        let expired: Vec<String> = inner
            .sources
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > timeout)
            .map(|s| s.name.clone())
            .collect();
        for name in expired {
            if inner.owners.contains_key(&name) {
                if let Some(source) = inner.sources.get_mut(&name) {
                    if source.state != SourceState::Lost {
                        tracing::warn!(
                            "SourceRegistry: Source '{}' timed out while connected",
                            name
                        );
                        source.state = SourceState::Lost;
                        summary.lost.push(name);
                    }
                }
                continue;
            }
            tracing::info!("SourceRegistry: Source removed: {}", name);
            inner.sources.remove(&name);
            summary.removed.push(name);
        }

        inner.rebuild_snapshot();
        summary
    }

    /// Sources ordered by name, as of the last poll.
    pub fn list(&self) -> Arc<Vec<Source>> {
        Arc::clone(&self.read().snapshot)
    }

    pub fn get(&self, name: &str) -> Option<Source> {
        self.read().sources.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sources.is_empty()
    }

    /// Find a source by full name, or by stream name when exactly one matches.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let inner = self.read();
        if inner.sources.contains_key(name) {
            return Some(name.to_string());
        }
        let mut matches = inner.sources.values().filter(|s| s.stream == name);
        match (matches.next(), matches.next()) {
            (Some(source), None) => Some(source.name.clone()),
            _ => None,
        }
    }

    /// Live state of a source; `Unseen` if the registry has never seen it or it was evicted.
    pub fn source_state(&self, name: &str) -> SourceState {
        self.read()
            .sources
            .get(name)
            .map(|s| s.state)
            .unwrap_or(SourceState::Unseen)
    }

    pub fn owner(&self, name: &str) -> Option<ReceiverId> {
        self.read().owners.get(name).copied()
    }

    /// Take exclusive ownership of a source for `receiver`.
    pub fn claim(&self, name: &str, receiver: ReceiverId) -> Result<Source, BridgeError> {
        let mut inner = self.write();
        if !inner.sources.contains_key(name) {
            return Err(BridgeError::NotFound(name.to_string()));
        }
        match inner.owners.get(name) {
            Some(owner) if *owner != receiver => {
                return Err(BridgeError::AlreadyConnected(name.to_string()));
            }
            _ => {}
        }
        inner.owners.insert(name.to_string(), receiver);
        let source = inner
            .sources
            .get_mut(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        source.state = SourceState::Connecting;
        Ok(source.clone())
    }

    /// Update the state of a source owned by `receiver`.
    pub fn set_state(&self, name: &str, receiver: ReceiverId, state: SourceState) -> bool {
        let mut inner = self.write();
        if inner.owners.get(name) != Some(&receiver) {
            return false;
        }
        match inner.sources.get_mut(name) {
            Some(source) => {
                source.state = state;
                true
            }
            None => false,
        }
    }

    /// Give up ownership. A source that was not lost returns to `Discovered`.
    pub fn release(&self, name: &str, receiver: ReceiverId) {
        let mut inner = self.write();
        if inner.owners.get(name) != Some(&receiver) {
            return;
        }
        inner.owners.remove(name);
        if let Some(source) = inner.sources.get_mut(name) {
            if source.state != SourceState::Lost {
                source.state = SourceState::Discovered;
            }
        }
    }

    pub fn mark_lost(&self, name: &str) {
        let mut inner = self.write();
        if let Some(source) = inner.sources.get_mut(name) {
            if source.state != SourceState::Lost {
                tracing::warn!("SourceRegistry: Source '{}' lost", name);
                source.state = SourceState::Lost;
            }
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn advert(name: &str) -> SourceAdvert {
        SourceAdvert {
            name: name.to_string(),
            url: None,
            video: None,
            audio: None,
        }
    }

    #[test]
    fn test_parse_source_name() {
        assert_eq!(parse_source_name("STUDIO (Test)"), Some(("STUDIO", "Test")));
        assert_eq!(
            parse_source_name("MACBOOKPRO.LOCAL (OBS (Main))"),
            Some(("MACBOOKPRO.LOCAL", "OBS (Main)"))
        );
        assert_eq!(parse_source_name("STUDIO ()"), None);
        assert_eq!(parse_source_name(" (Test)"), None);
        assert_eq!(parse_source_name("Test"), None);
        assert_eq!(format_source_name("STUDIO", "Test"), "STUDIO (Test)");
    }

    #[test]
    fn test_list_is_sorted_snapshot() {
        let registry = SourceRegistry::new(Duration::from_secs(5));
        let now = Instant::now();
        let summary = registry.apply_discovery(&[advert("B (Two)"), advert("A (One)")], now);
        assert_eq!(summary.added.len(), 2);

        let snapshot = registry.list();
        let names: Vec<_> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["A (One)", "B (Two)"]);

        // Claims change live state but not the snapshot
        let id = registry.next_receiver_id();
        registry.claim("A (One)", id).unwrap();
        assert_eq!(registry.list()[0].state, SourceState::Discovered);
        assert_eq!(registry.source_state("A (One)"), SourceState::Connecting);
    }

    #[test]
    fn test_eviction_after_timeout() {
        let registry = SourceRegistry::new(Duration::from_millis(100));
        let start = Instant::now();
        registry.apply_discovery(&[advert("A (One)"), advert("B (Two)")], start);

        registry.apply_discovery(&[advert("B (Two)")], start + Duration::from_millis(50));
        assert_eq!(registry.list().len(), 2);

        let summary =
            registry.apply_discovery(&[advert("B (Two)")], start + Duration::from_millis(150));
        assert_eq!(summary.removed, vec!["A (One)".to_string()]);
        let names: Vec<_> = registry.list().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["B (Two)".to_string()]);
        assert_eq!(registry.source_state("A (One)"), SourceState::Unseen);
    }

    #[test]
    fn test_owned_source_marked_lost_on_timeout() {
        let registry = SourceRegistry::new(Duration::from_millis(100));
        let start = Instant::now();
        registry.apply_discovery(&[advert("A (One)")], start);
        let id = registry.next_receiver_id();
        registry.claim("A (One)", id).unwrap();
        registry.set_state("A (One)", id, SourceState::Connected);

        let summary = registry.apply_discovery(&[], start + Duration::from_millis(150));
        assert_eq!(summary.lost, vec!["A (One)".to_string()]);
        assert!(summary.removed.is_empty());
        assert_eq!(registry.source_state("A (One)"), SourceState::Lost);
        assert_eq!(registry.owner("A (One)"), Some(id));
        assert_eq!(registry.list()[0].state, SourceState::Lost);

        // Reported once while the owner still holds it
        let summary = registry.apply_discovery(&[], start + Duration::from_millis(200));
        assert!(summary.is_empty());

        registry.release("A (One)", id);
        assert_eq!(registry.owner("A (One)"), None);
        let summary = registry.apply_discovery(&[], start + Duration::from_millis(250));
        assert_eq!(summary.removed, vec!["A (One)".to_string()]);
        assert_eq!(registry.source_state("A (One)"), SourceState::Unseen);
    }

    #[test]
    fn test_resolve_by_stream_name() {
        let registry = SourceRegistry::default();
        let now = Instant::now();
        registry.apply_discovery(&[advert("A (Cam)"), advert("B (Cam)"), advert("B (Test)")], now);
        assert_eq!(registry.resolve("B (Test)").as_deref(), Some("B (Test)"));
        assert_eq!(registry.resolve("Test").as_deref(), Some("B (Test)"));
        assert_eq!(registry.resolve("Cam"), None);
        assert_eq!(registry.resolve("Missing"), None);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = SourceRegistry::default();
        registry.apply_discovery(&[advert("A (One)")], Instant::now());
        let first = registry.next_receiver_id();
        let second = registry.next_receiver_id();

        assert!(matches!(
            registry.claim("Z (None)", first),
            Err(BridgeError::NotFound(_))
        ));
        registry.claim("A (One)", first).unwrap();
        assert!(matches!(
            registry.claim("A (One)", second),
            Err(BridgeError::AlreadyConnected(_))
        ));

        // Only the owner can release
        registry.release("A (One)", second);
        assert_eq!(registry.owner("A (One)"), Some(first));
        registry.release("A (One)", first);
        assert!(registry.claim("A (One)", second).is_ok());
    }

    #[test]
    fn test_concurrent_claims_one_winner() {
        let registry = Arc::new(SourceRegistry::default());
        registry.apply_discovery(&[advert("A (One)")], Instant::now());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let id = registry.next_receiver_id();
                    registry.claim("A (One)", id)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(BridgeError::AlreadyConnected(_))))
                .count(),
            1
        );
    }

    #[test]
    fn test_lost_source_recovers_when_released() {
        let registry = SourceRegistry::default();
        let now = Instant::now();
        registry.apply_discovery(&[advert("A (One)")], now);
        let id = registry.next_receiver_id();
        registry.claim("A (One)", id).unwrap();
        assert!(registry.set_state("A (One)", id, SourceState::Connected));

        registry.mark_lost("A (One)");
        assert_eq!(registry.source_state("A (One)"), SourceState::Lost);
        registry.release("A (One)", id);
        assert_eq!(registry.source_state("A (One)"), SourceState::Lost);

        registry.apply_discovery(&[advert("A (One)")], now + Duration::from_millis(10));
        assert_eq!(registry.source_state("A (One)"), SourceState::Discovered);
    }
}
