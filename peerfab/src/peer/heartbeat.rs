//! The peer's liveness announcements to the tracker.

use crate::{
    conf::PeerConf, peer, shutdown::Shutdown, tracker::client::TrackerClient,
};

/// Heartbeats the tracker every interval until shutdown.
///
/// Transport failures are treated as transient until
/// `max_heartbeat_failures` consecutive ones, at which point the tracker
/// is declared unreachable and process shutdown is triggered. A negative
/// ack means the tracker no longer knows us (it swept us, or restarted
/// empty); the task re-registers and restores our chunk advertisements.
pub(super) async fn run(
    tracker: TrackerClient,
    conf: PeerConf,
    endpoint: String,
    shutdown: Shutdown,
) {
    let stop = shutdown.clone();
    let mut shutdown_signal = shutdown;
    let mut ticker = tokio::time::interval(conf.heartbeat_interval);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tracker.heartbeat(&conf.name).await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        failures = 0;
                        log::warn!(
                            "Tracker no longer knows '{}', re-registering",
                            conf.name
                        );
                        if let Err(e) = re_register(&tracker, &conf, &endpoint).await {
                            log::warn!("Re-registration failed: {}", e);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        log::warn!(
                            "Heartbeat failure {}/{}: {}",
                            failures,
                            conf.max_heartbeat_failures,
                            e
                        );
                        if failures >= conf.max_heartbeat_failures {
                            log::error!(
                                "Tracker unreachable, disconnecting peer '{}'",
                                conf.name
                            );
                            stop.trigger();
                            break;
                        }
                    }
                }
            }
            _ = shutdown_signal.triggered() => break,
        }
    }
}

async fn re_register(
    tracker: &TrackerClient,
    conf: &PeerConf,
    endpoint: &str,
) -> crate::error::Result<()> {
    tracker.register(&conf.name, endpoint).await?;
    peer::announce_shared(tracker, &conf.name, &conf.share_dir).await?;
    Ok(())
}
