//! Periodic sweep of expired disposition requests.
//!
//! All update-state requests share one deadline length, so a single timer
//! per receiver beats one timer per request.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::disposition::DispositionTracker;

/// Sweep period of the reaper task.
pub(crate) const REAPER_PERIOD: Duration = Duration::from_secs(1);

/// Spawns the reaper task for `tracker`. The handle is aborted when the
/// receiver closes.
pub(crate) fn spawn(tracker: DispositionTracker, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for (tag, item) in tracker.take_expired() {
                warn!(tag = %tag, "pending disposition timed out");
                item.fail_with_timeout();
            }
        }
    })
}
