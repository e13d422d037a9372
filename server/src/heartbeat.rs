//! Periodic PING to every registered connection

use crate::network::SharedRegistry;
use crate::shutdown::wait_for_shutdown;
use log::{debug, error, info};
use shared::{encode, PacketType};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runs until shutdown, sending one heartbeat round per `period`
///
/// The first round goes out one full period after start; new connections get
/// their first PING from the acceptor instead.
pub async fn run_heartbeat(
    registry: SharedRegistry,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        let sent = send_heartbeat_round(&registry).await;
        debug!("Heartbeat round delivered {} PING frames", sent);
    }

    info!("Heartbeat stopped");
}

/// Sends one PING to every connected handle and returns how many sends
/// succeeded
///
/// Failed sends are only logged. Dead peers are cleaned up by their connection
/// task when the socket reports the failure.
pub async fn send_heartbeat_round(registry: &SharedRegistry) -> usize {
    let frame = match encode(PacketType::Ping, b"") {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to encode heartbeat PING: {}", e);
            return 0;
        }
    };

    let peers = registry.read().await.peers();
    let mut sent = 0;
    for (handle, _, peer) in peers {
        debug!("Sending PING to connection #{}", handle);
        match peer.send_frame(&frame).await {
            Ok(()) => sent += 1,
            Err(e) => debug!("Heartbeat to connection #{} failed: {}", handle, e),
        }
    }
    sent
}
