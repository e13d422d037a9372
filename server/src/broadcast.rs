use crate::error::ServerError;
use crate::network::SharedRegistry;
use crate::registry::ConnectionHandle;
use log::{debug, info};
use shared::{encode, PacketType};

/// Outcome of one broadcast pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Peers found closed by the post-send probe and removed
    pub reaped: usize,
}

/// Sends one frame to every registered connection except `exclude`
///
/// After each successful send the peer is probed; a peer that has already
/// closed its side is unregistered and its connection task told to close.
/// Encoding errors (`PayloadTooLarge`) are returned before anything is sent.
pub async fn broadcast(
    registry: &SharedRegistry,
    kind: PacketType,
    payload: &[u8],
    exclude: Option<ConnectionHandle>,
) -> Result<BroadcastReport, ServerError> {
    let frame = encode(kind, payload)?;
    let peers = registry.read().await.peers();

    let mut report = BroadcastReport::default();
    for (handle, peer_addr, peer) in peers {
        if Some(handle) == exclude {
            continue;
        }

        if let Err(e) = peer.send_frame(&frame).await {
            debug!("Broadcast to connection #{} failed: {}", handle, e);
            report.failed += 1;
            continue;
        }

        if peer.probe_closed().await {
            if registry.write().await.unregister(handle).is_some() {
                info!("Removing (host={}, #{})", peer_addr, handle);
                report.reaped += 1;
            }
            peer.close();
            continue;
        }

        info!("Broadcasting {} (host={}, #{})", kind, peer_addr, handle);
        report.delivered += 1;
    }

    Ok(report)
}
