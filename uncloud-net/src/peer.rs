use std::{
    net::SocketAddr,
    time::{Duration, Instant, SystemTime},
};

use ipnet::IpNet;
use wireguard_control::PeerInfo;

use crate::endpoint::Endpoint;

/// How long a freshly selected endpoint gets to produce a handshake before
/// the peer is considered unreachable.
pub const REJECT_THRESHOLD: Duration = Duration::from_secs(30);
/// How long an established tunnel stays trusted after its last handshake,
/// mirroring WireGuard's reject-after-time.
pub const UP_THRESHOLD: Duration = Duration::from_secs(180);
/// Minimum time between endpoint rotations for an unreachable peer.
pub const ROTATE_INTERVAL: Duration = Duration::from_secs(5);
/// Keepalive pushed to the kernel for every peer so NAT mappings stay warm.
pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

/// The authoritative per-peer slice of the cluster configuration, as the
/// membership store sees it. `endpoint` is normally `None`: which candidate
/// the tunnel currently targets is this module's business, not membership's.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub public_key: String,
    pub endpoint: Option<Endpoint>,
    pub candidates: Vec<Endpoint>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

/// Snapshot of a peer as the kernel device reports it. Kept separate from
/// `wireguard_control::PeerInfo` so diffing logic stays constructible in
/// tests.
#[derive(Debug, Clone)]
pub struct DevicePeer {
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    pub last_handshake: Option<SystemTime>,
}

impl From<&PeerInfo> for DevicePeer {
    fn from(info: &PeerInfo) -> Self {
        DevicePeer {
            public_key: info.config.public_key.to_base64(),
            endpoint: info.config.endpoint,
            allowed_ips: info
                .config
                .allowed_ips
                .iter()
                .filter_map(|ip| IpNet::new(ip.address, ip.cidr).ok())
                .collect(),
            persistent_keepalive: info.config.persistent_keepalive_interval,
            last_handshake: info.stats.last_handshake_time,
        }
    }
}

/// Liveness tracking and endpoint candidate rotation for a single peer.
#[derive(Debug)]
pub struct Peer {
    config: PeerConfig,
    selected: Option<Endpoint>,
    last_handshake: Option<SystemTime>,
    last_endpoint_change: Instant,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let selected = config
            .endpoint
            .clone()
            .or_else(|| config.candidates.first().cloned());
        Peer {
            config,
            selected,
            last_handshake: None,
            last_endpoint_change: Instant::now(),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.config.public_key
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The endpoint the tunnel currently targets, if any. A peer with no
    /// candidates has no selection and stays down until one is advertised.
    pub fn selected_endpoint(&self) -> Option<&Endpoint> {
        self.selected.as_ref()
    }

    pub fn status(&self) -> PeerStatus {
        let handshake_age = self
            .last_handshake
            .and_then(|at| SystemTime::now().duration_since(at).ok());
        self.status_at(handshake_age, self.last_endpoint_change.elapsed())
    }

    fn status_at(
        &self,
        handshake_age: Option<Duration>,
        since_endpoint_change: Duration,
    ) -> PeerStatus {
        if self.selected.is_none() {
            return PeerStatus::Down;
        }
        match handshake_age {
            Some(age) if age < UP_THRESHOLD => PeerStatus::Up,
            Some(_) => PeerStatus::Down,
            None if since_endpoint_change < REJECT_THRESHOLD => PeerStatus::Up,
            None => PeerStatus::Down,
        }
    }

    /// Merges an authoritative config delivered by the controller. Returns
    /// the new selection when it changed.
    pub fn update_config(&mut self, config: PeerConfig) -> Option<Endpoint> {
        let mut changed = None;
        if let Some(endpoint) = &config.endpoint {
            if self.selected.as_ref() != Some(endpoint) {
                self.selected = Some(endpoint.clone());
                self.last_endpoint_change = Instant::now();
                changed = self.selected.clone();
            }
        } else {
            let still_valid = self
                .selected
                .as_ref()
                .map_or(false, |selected| config.candidates.contains(selected));
            if !still_valid {
                self.selected = config.candidates.first().cloned();
                if self.selected.is_some() {
                    self.last_endpoint_change = Instant::now();
                    changed = self.selected.clone();
                }
            }
        }
        self.config = config;
        changed
    }

    /// Reconciles with what the kernel reports: adopts the handshake
    /// timestamp, and when the kernel observed the peer from a different
    /// source address (roaming), adopts that endpoint too. Returns the
    /// adopted endpoint when it differed from the stored selection.
    pub fn update_from_device(&mut self, device: &DevicePeer) -> Option<Endpoint> {
        self.last_handshake = device.last_handshake;
        let observed = device.endpoint.map(Endpoint::from);
        match observed {
            Some(observed) if self.selected.as_ref() != Some(&observed) => {
                self.selected = Some(observed.clone());
                self.last_endpoint_change = Instant::now();
                Some(observed)
            }
            _ => None,
        }
    }

    /// Rotation policy: an unreachable peer with at least two candidates
    /// moves to the next candidate (round-robin) once `ROTATE_INTERVAL` has
    /// passed since the last endpoint change.
    pub fn should_change_endpoint(&mut self) -> Option<Endpoint> {
        if self.status() != PeerStatus::Down
            || self.config.candidates.len() < 2
            || self.last_endpoint_change.elapsed() < ROTATE_INTERVAL
        {
            return None;
        }
        let current = self
            .selected
            .as_ref()
            .and_then(|selected| self.config.candidates.iter().position(|c| c == selected))
            .unwrap_or(self.config.candidates.len() - 1);
        let next = self.config.candidates[(current + 1) % self.config.candidates.len()].clone();
        self.selected = Some(next.clone());
        self.last_endpoint_change = Instant::now();
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn config(candidates: &[&str]) -> PeerConfig {
        PeerConfig {
            public_key: "pk".to_string(),
            endpoint: None,
            candidates: candidates.iter().map(|c| endpoint(c)).collect(),
            allowed_ips: vec!["10.210.1.0/24".parse().unwrap()],
            persistent_keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
        }
    }

    #[test]
    fn new_peer_selects_first_candidate() {
        let peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        assert_eq!(
            peer.selected_endpoint(),
            Some(&endpoint("198.51.100.1:51820"))
        );
    }

    #[test]
    fn peer_without_candidates_is_down() {
        let peer = Peer::new(config(&[]));
        assert_eq!(peer.selected_endpoint(), None);
        assert_eq!(peer.status(), PeerStatus::Down);
    }

    #[test]
    fn status_follows_handshake_age() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820"]));
        peer.last_handshake = Some(SystemTime::now() - Duration::from_secs(5));
        assert_eq!(peer.status(), PeerStatus::Up);

        peer.last_handshake = Some(SystemTime::now() - (UP_THRESHOLD + Duration::from_secs(1)));
        assert_eq!(peer.status(), PeerStatus::Down);
    }

    #[test]
    fn unproven_endpoint_goes_down_after_reject_threshold() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820"]));
        assert_eq!(peer.status(), PeerStatus::Up);

        peer.last_endpoint_change = Instant::now() - (REJECT_THRESHOLD + Duration::from_secs(1));
        assert_eq!(peer.status(), PeerStatus::Down);
    }

    #[test]
    fn rotates_round_robin_when_down() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        peer.last_endpoint_change = Instant::now() - (REJECT_THRESHOLD + Duration::from_secs(1));

        let next = peer.should_change_endpoint().expect("should rotate");
        assert_eq!(next, endpoint("10.0.0.1:51820"));
        assert_eq!(peer.selected_endpoint(), Some(&next));

        // The change instant was just refreshed, so another rotation has to
        // wait out ROTATE_INTERVAL again.
        assert_eq!(peer.should_change_endpoint(), None);

        peer.last_handshake = Some(SystemTime::now() - (UP_THRESHOLD + Duration::from_secs(1)));
        peer.last_endpoint_change = Instant::now() - (ROTATE_INTERVAL + Duration::from_secs(1));
        let wrapped = peer.should_change_endpoint().expect("should rotate again");
        assert_eq!(wrapped, endpoint("198.51.100.1:51820"));
    }

    #[test]
    fn never_rotates_while_up() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        peer.last_handshake = Some(SystemTime::now());
        peer.last_endpoint_change = Instant::now() - (ROTATE_INTERVAL + Duration::from_secs(1));
        assert_eq!(peer.should_change_endpoint(), None);
    }

    #[test]
    fn never_rotates_with_a_single_candidate() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820"]));
        peer.last_endpoint_change = Instant::now() - (REJECT_THRESHOLD + Duration::from_secs(1));
        assert_eq!(peer.should_change_endpoint(), None);
    }

    #[test]
    fn update_config_replaces_differing_endpoint() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        let mut new_config = config(&["198.51.100.1:51820", "10.0.0.1:51820"]);
        new_config.endpoint = Some(endpoint("10.0.0.1:51820"));

        let changed = peer.update_config(new_config);
        assert_eq!(changed, Some(endpoint("10.0.0.1:51820")));
        assert_eq!(peer.selected_endpoint(), Some(&endpoint("10.0.0.1:51820")));
    }

    #[test]
    fn update_config_keeps_selection_while_still_a_candidate() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        peer.last_endpoint_change = Instant::now() - (REJECT_THRESHOLD + Duration::from_secs(1));
        peer.should_change_endpoint().expect("rotate to second");

        // A resync from membership must not undo the rotation.
        let changed = peer.update_config(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        assert_eq!(changed, None);
        assert_eq!(peer.selected_endpoint(), Some(&endpoint("10.0.0.1:51820")));
    }

    #[test]
    fn update_config_reselects_when_candidate_vanishes() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820", "10.0.0.1:51820"]));
        let changed = peer.update_config(config(&["192.0.2.9:51820"]));
        assert_eq!(changed, Some(endpoint("192.0.2.9:51820")));
    }

    #[test]
    fn update_from_device_adopts_roamed_endpoint() {
        let mut peer = Peer::new(config(&["198.51.100.1:51820"]));
        let device = DevicePeer {
            public_key: "pk".to_string(),
            endpoint: Some("203.0.113.9:4500".parse().unwrap()),
            allowed_ips: vec![],
            persistent_keepalive: None,
            last_handshake: Some(SystemTime::now()),
        };

        let adopted = peer.update_from_device(&device);
        assert_eq!(adopted, Some(endpoint("203.0.113.9:4500")));
        assert_eq!(peer.status(), PeerStatus::Up);

        // Same observation again: nothing to adopt.
        assert_eq!(peer.update_from_device(&device), None);
    }
}
