use super::types::IceCandidate;
use tracing::{debug, warn};

/// Candidate type as advertised in the `typ` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    pub fn of(candidate: &str) -> Self {
        let mut parts = candidate.split_whitespace();
        while let Some(token) = parts.next() {
            if token == "typ" {
                return match parts.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }
}

/// Counts of gathered candidates per type for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match CandidateKind::of(&candidate.candidate) {
            CandidateKind::Host => self.host += 1,
            CandidateKind::ServerReflexive => self.srflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    /// Logs the tally once gathering completes.
    pub fn report(&self, peer_id: &str) {
        debug!(
            peer = peer_id,
            "candidate analysis: {} host, {} srflx, {} relay",
            self.host, self.srflx, self.relay
        );
        if self.relay == 0 {
            warn!(
                peer = peer_id,
                "no relay candidates gathered, connections across symmetric NAT may fail"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn classifies_by_typ_attribute() {
        assert_eq!(
            CandidateKind::of("candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host"),
            CandidateKind::Host
        );
        assert_eq!(
            CandidateKind::of(
                "candidate:2 1 udp 1694498815 1.2.3.4 40000 typ srflx raddr 10.0.0.2 rport 50000"
            ),
            CandidateKind::ServerReflexive
        );
        assert_eq!(
            CandidateKind::of("candidate:3 1 udp 16777215 5.6.7.8 3478 typ relay"),
            CandidateKind::Relay
        );
        assert_eq!(CandidateKind::of("garbage"), CandidateKind::Unknown);
        // "relay" appearing elsewhere must not confuse the parser
        assert_eq!(
            CandidateKind::of("candidate:relay 1 udp 1 10.0.0.2 5000 typ host"),
            CandidateKind::Host
        );
    }

    #[test]
    fn tally_counts_each_kind() {
        let mut tally = CandidateTally::default();
        tally.record(&cand("candidate:1 1 udp 1 10.0.0.2 5000 typ host"));
        tally.record(&cand("candidate:1 1 udp 1 10.0.0.3 5000 typ host"));
        tally.record(&cand("candidate:2 1 udp 1 1.2.3.4 5000 typ srflx"));
        tally.record(&cand("candidate:4 1 udp 1 1.2.3.4 5000 typ prflx"));
        assert_eq!(tally.host, 2);
        assert_eq!(tally.srflx, 1);
        assert_eq!(tally.relay, 0);
        assert_eq!(tally.total(), 4);
    }
}
