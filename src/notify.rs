//! The NOTIFY sender: tells every configured peer about a zone's new
//! serial, retrying per-peer until acknowledged or exhausted, under a
//! global concurrency cap shared across all zones.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

/// No more than this many NOTIFY requests are outstanding across the
/// whole daemon at once.
pub const NOTIFY_MAX_UDP: usize = 50;

/// A peer that never acknowledges is retried this many times before
/// being given up on.
pub const NOTIFY_MAX_RETRY: u32 = 5;

/// How long to wait for an ack before retrying the same peer.
pub const NOTIFY_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Why a peer's NOTIFY campaign ended, for telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Acked,
    RetriesExhausted,
}

struct PeerCampaign {
    zone: String,
    peer: SocketAddr,
    serial: u32,
    attempt: u32,
    next_due: u64,
}

/// One zone's NOTIFY campaign: the peer list plus which peer is next,
/// advancing only on ack or retry exhaustion for the current peer.
pub struct ZoneNotifyJob {
    zone: String,
    serial: u32,
    peers: Vec<SocketAddr>,
    next_peer_index: usize,
}

impl ZoneNotifyJob {
    pub fn new(zone: String, serial: u32, peers: Vec<SocketAddr>) -> Self {
        Self {
            zone,
            serial,
            peers,
            next_peer_index: 0,
        }
    }
}

/// Schedules and tracks in-flight NOTIFY campaigns across every zone,
/// enforcing [`NOTIFY_MAX_UDP`] as a global cap with newly queued
/// campaigns waiting in FIFO order, mirroring the bounded-concurrency
/// pattern used for [`crate::tcpset::TcpSet`].
pub struct NotifySender {
    in_flight: Vec<PeerCampaign>,
    pending_jobs: VecDeque<ZoneNotifyJob>,
    pub outcomes: Vec<(String, SocketAddr, NotifyOutcome)>,
}

impl Default for NotifySender {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifySender {
    pub fn new() -> Self {
        Self {
            in_flight: Vec::new(),
            pending_jobs: VecDeque::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue a zone's NOTIFY campaign. If capacity allows, the first peer
    /// starts immediately; otherwise the whole job waits in FIFO order
    /// behind whatever else is queued.
    pub fn submit(&mut self, job: ZoneNotifyJob, now: u64) {
        self.pending_jobs.push_back(job);
        self.fill_capacity(now);
    }

    fn fill_capacity(&mut self, now: u64) {
        while self.in_flight.len() < NOTIFY_MAX_UDP {
            let Some(mut job) = self.pending_jobs.pop_front() else {
                return;
            };
            if let Some(peer) = job.peers.get(job.next_peer_index).copied() {
                self.in_flight.push(PeerCampaign {
                    zone: job.zone.clone(),
                    peer,
                    serial: job.serial,
                    attempt: 0,
                    next_due: now,
                });
                job.next_peer_index += 1;
                if job.next_peer_index < job.peers.len() {
                    self.pending_jobs.push_back(job);
                }
            }
        }
    }

    /// Peers whose retry deadline has passed and should have another
    /// NOTIFY sent now.
    pub fn due_peers(&self, now: u64) -> Vec<(String, SocketAddr, u32)> {
        self.in_flight
            .iter()
            .filter(|c| c.next_due <= now)
            .map(|c| (c.zone.clone(), c.peer, c.serial))
            .collect()
    }

    /// Record a sent attempt for `(zone, peer)`, scheduling its retry or
    /// declaring exhaustion.
    pub fn record_attempt(&mut self, zone: &str, peer: SocketAddr, now: u64) {
        if let Some(c) = self
            .in_flight
            .iter_mut()
            .find(|c| c.zone == zone && c.peer == peer)
        {
            c.attempt += 1;
            if c.attempt >= NOTIFY_MAX_RETRY {
                let (zone, peer) = (c.zone.clone(), c.peer);
                self.in_flight.retain(|c| !(c.zone == zone && c.peer == peer));
                self.outcomes.push((zone, peer, NotifyOutcome::RetriesExhausted));
                self.fill_capacity(now);
            } else {
                c.next_due = now + NOTIFY_RETRY_TIMEOUT.as_secs();
            }
        }
    }

    /// An ack (NOTIFY reply matching the query id) arrived for `(zone,
    /// peer)`; retire its campaign and free a slot for the next queued
    /// peer.
    pub fn record_ack(&mut self, zone: &str, peer: SocketAddr, now: u64) {
        let before = self.in_flight.len();
        self.in_flight.retain(|c| !(c.zone == zone && c.peer == peer));
        if self.in_flight.len() != before {
            self.outcomes.push((zone.to_string(), peer, NotifyOutcome::Acked));
            self.fill_capacity(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| format!("192.0.2.{}:53", i + 1).parse().unwrap())
            .collect()
    }

    #[test]
    fn ack_retires_campaign_and_promotes_next_peer() {
        let mut sender = NotifySender::new();
        sender.submit(
            ZoneNotifyJob::new("example.com".to_string(), 5, peers(2)),
            0,
        );
        assert_eq!(sender.in_flight_count(), 1);
        let first_peer = sender.due_peers(0)[0].1;
        sender.record_ack("example.com", first_peer, 0);
        assert_eq!(sender.in_flight_count(), 1);
        let second_peer = sender.due_peers(0)[0].1;
        assert_ne!(first_peer, second_peer);
    }

    #[test]
    fn exhausting_retries_is_reported() {
        let mut sender = NotifySender::new();
        sender.submit(
            ZoneNotifyJob::new("example.com".to_string(), 5, peers(1)),
            0,
        );
        let peer = peers(1)[0];
        for t in 0..NOTIFY_MAX_RETRY {
            sender.record_attempt("example.com", peer, (t * 15) as u64);
        }
        assert_eq!(sender.in_flight_count(), 0);
        assert_eq!(
            sender.outcomes.last(),
            Some(&("example.com".to_string(), peer, NotifyOutcome::RetriesExhausted))
        );
    }

    #[test]
    fn global_cap_queues_overflow_jobs() {
        let mut sender = NotifySender::new();
        for i in 0..(NOTIFY_MAX_UDP + 1) {
            sender.submit(
                ZoneNotifyJob::new(format!("zone{i}.example.com"), 1, peers(1)),
                0,
            );
        }
        assert_eq!(sender.in_flight_count(), NOTIFY_MAX_UDP);
        assert_eq!(sender.pending_jobs.len(), 1);
    }
}
