use std::sync::Once;
use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

static INIT: Once = Once::new();

/// Installs the global subscriber with millisecond local timestamps.
/// `RUST_LOG` wins over the build-profile default.
pub fn init() {
    INIT.call_once(|| {
        let default_level = if crate::config::LOGGING_ENABLED {
            "debug"
        } else {
            "warn"
        };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("meetmesh={default_level},warn")));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_target(true)
            .try_init();
    });
}

/// Trace a local ICE candidate as it is gathered (trickle ICE).
pub fn dump_candidate(peer_id: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            peer = peer_id,
            kind = ?crate::peer::ice::CandidateKind::of(&init.candidate),
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "local candidate: {}",
            init.candidate
        );
    }
}

/// Snapshot of the nominated candidate pair, taken when a connection degrades.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, peer_id: &str, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    peer = peer_id,
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
