//! Connection quality telemetry
//!
//! Advisory only. Ping/pong probes give round-trip time and loss over a
//! sliding window; together with path type and byte counters they yield a
//! four-level classification for diagnostics.

use cairn_core::{PathKind, PeerId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Probe outcomes kept per link
pub const LOSS_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
        };
        f.write_str(s)
    }
}

/// Map RTT and loss onto a level. Without an RTT measurement the link is
/// at best fair.
pub fn classify(rtt: Option<Duration>, loss_percent: f64) -> QualityLevel {
    let Some(rtt) = rtt else {
        return if loss_percent < 10.0 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        };
    };
    let ms = rtt.as_secs_f64() * 1000.0;
    if ms < 50.0 && loss_percent < 1.0 {
        QualityLevel::Excellent
    } else if ms < 150.0 && loss_percent < 3.0 {
        QualityLevel::Good
    } else if ms < 300.0 && loss_percent < 10.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub peer: PeerId,
    /// Smoothed round-trip time
    pub rtt: Option<Duration>,
    pub loss_percent: f64,
    pub path: PathKind,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub level: QualityLevel,
}

#[derive(Debug)]
struct LinkStats {
    path: PathKind,
    srtt: Option<Duration>,
    outstanding: BTreeMap<u64, Instant>,
    window: VecDeque<bool>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl LinkStats {
    fn new(path: PathKind) -> Self {
        Self {
            path,
            srtt: None,
            outstanding: BTreeMap::new(),
            window: VecDeque::with_capacity(LOSS_WINDOW),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    fn record_outcome(&mut self, answered: bool) {
        if self.window.len() == LOSS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(answered);
    }

    fn loss_percent(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let lost = self.window.iter().filter(|ok| !**ok).count();
        lost as f64 * 100.0 / self.window.len() as f64
    }
}

/// Per-link probe state for every open session
pub struct QualityMonitor {
    ping_timeout: Duration,
    links: HashMap<PeerId, LinkStats>,
    next_nonce: u64,
}

impl QualityMonitor {
    pub fn new(ping_timeout: Duration) -> Self {
        Self {
            ping_timeout,
            links: HashMap::new(),
            next_nonce: 1,
        }
    }

    /// Start tracking a link, resetting any previous stats
    pub fn add_link(&mut self, peer: &PeerId, path: PathKind) {
        self.links.insert(peer.clone(), LinkStats::new(path));
    }

    pub fn remove_link(&mut self, peer: &PeerId) {
        self.links.remove(peer);
    }

    pub fn record_sent(&mut self, peer: &PeerId, bytes: usize) {
        if let Some(link) = self.links.get_mut(peer) {
            link.bytes_sent += bytes as u64;
        }
    }

    pub fn record_received(&mut self, peer: &PeerId, bytes: usize) {
        if let Some(link) = self.links.get_mut(peer) {
            link.bytes_received += bytes as u64;
        }
    }

    /// Register a new probe and return its nonce
    pub fn next_ping(&mut self, peer: &PeerId, now: Instant) -> Option<u64> {
        let link = self.links.get_mut(peer)?;
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        link.outstanding.insert(nonce, now);
        Some(nonce)
    }

    /// Match a pong to its probe and fold the RTT into the smoothed estimate
    pub fn record_pong(&mut self, peer: &PeerId, nonce: u64, now: Instant) -> Option<Duration> {
        let link = self.links.get_mut(peer)?;
        let sent_at = link.outstanding.remove(&nonce)?;
        let rtt = now.saturating_duration_since(sent_at);
        link.srtt = Some(match link.srtt {
            None => rtt,
            Some(srtt) => (srtt * 7 + rtt) / 8,
        });
        link.record_outcome(true);
        Some(rtt)
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.ping_timeout;
        for link in self.links.values_mut() {
            let expired: Vec<u64> = link
                .outstanding
                .iter()
                .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
                .map(|(nonce, _)| *nonce)
                .collect();
            for nonce in expired {
                link.outstanding.remove(&nonce);
                link.record_outcome(false);
            }
        }
    }

    pub fn sample(&mut self, peer: &PeerId, now: Instant) -> Option<QualitySample> {
        self.expire(now);
        let link = self.links.get(peer)?;
        Some(Self::sample_link(peer, link))
    }

    pub fn sample_all(&mut self, now: Instant) -> Vec<QualitySample> {
        self.expire(now);
        let mut samples: Vec<QualitySample> = self
            .links
            .iter()
            .map(|(peer, link)| Self::sample_link(peer, link))
            .collect();
        samples.sort_by(|a, b| a.peer.cmp(&b.peer));
        samples
    }

    fn sample_link(peer: &PeerId, link: &LinkStats) -> QualitySample {
        let loss_percent = link.loss_percent();
        QualitySample {
            peer: peer.clone(),
            rtt: link.srtt,
            loss_percent,
            path: link.path,
            bytes_sent: link.bytes_sent,
            bytes_received: link.bytes_received,
            level: classify(link.srtt, loss_percent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_bands() {
        let ms = Duration::from_millis;
        assert_eq!(classify(Some(ms(20)), 0.0), QualityLevel::Excellent);
        assert_eq!(classify(Some(ms(20)), 2.0), QualityLevel::Good);
        assert_eq!(classify(Some(ms(120)), 0.0), QualityLevel::Good);
        assert_eq!(classify(Some(ms(200)), 5.0), QualityLevel::Fair);
        assert_eq!(classify(Some(ms(400)), 0.0), QualityLevel::Poor);
        assert_eq!(classify(Some(ms(10)), 15.0), QualityLevel::Poor);
        assert_eq!(classify(None, 0.0), QualityLevel::Fair);
        assert_eq!(classify(None, 50.0), QualityLevel::Poor);
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut monitor = QualityMonitor::new(Duration::from_secs(3));
        let bob = PeerId::from("bob");
        let start = Instant::now();
        monitor.add_link(&bob, PathKind::Direct);

        let n1 = monitor.next_ping(&bob, start).unwrap();
        monitor.record_pong(&bob, n1, start + Duration::from_millis(80));
        let n2 = monitor.next_ping(&bob, start).unwrap();
        monitor.record_pong(&bob, n2, start + Duration::from_millis(160));

        // 7/8 * 80 + 1/8 * 160 = 90
        let sample = monitor.sample(&bob, start).unwrap();
        assert_eq!(sample.rtt, Some(Duration::from_millis(90)));
        assert_eq!(sample.level, QualityLevel::Good);

        // Unknown or repeated nonces are ignored
        assert!(monitor.record_pong(&bob, n2, start).is_none());
        assert!(monitor.record_pong(&bob, 999, start).is_none());
    }

    #[test]
    fn test_loss_over_window() {
        let mut monitor = QualityMonitor::new(Duration::from_secs(3));
        let bob = PeerId::from("bob");
        let start = Instant::now();
        monitor.add_link(&bob, PathKind::Relayed);

        // 5 answered, 5 lost
        for i in 0..10u64 {
            let nonce = monitor.next_ping(&bob, start).unwrap();
            if i % 2 == 0 {
                monitor.record_pong(&bob, nonce, start + Duration::from_millis(10));
            }
        }
        let sample = monitor.sample(&bob, start + Duration::from_secs(3)).unwrap();
        assert!((sample.loss_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(sample.level, QualityLevel::Poor);
        assert_eq!(sample.path, PathKind::Relayed);

        // The window slides: 20 good probes push the losses out
        let later = start + Duration::from_secs(10);
        for _ in 0..LOSS_WINDOW {
            let nonce = monitor.next_ping(&bob, later).unwrap();
            monitor.record_pong(&bob, nonce, later + Duration::from_millis(10));
        }
        assert_eq!(monitor.sample(&bob, later).unwrap().loss_percent, 0.0);
    }

    #[test]
    fn test_byte_counters_and_removal() {
        let mut monitor = QualityMonitor::new(Duration::from_secs(3));
        let bob = PeerId::from("bob");
        monitor.add_link(&bob, PathKind::Direct);
        monitor.record_sent(&bob, 100);
        monitor.record_received(&bob, 40);

        let samples = monitor.sample_all(Instant::now());
        assert_eq!(samples.len(), 1);
        assert_eq!((samples[0].bytes_sent, samples[0].bytes_received), (100, 40));
        assert_eq!(samples[0].level, QualityLevel::Fair);

        monitor.remove_link(&bob);
        assert!(monitor.sample(&bob, Instant::now()).is_none());
        assert!(monitor.next_ping(&bob, Instant::now()).is_none());
    }
}
