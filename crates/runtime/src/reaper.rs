use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::broker::Broker;

/// Sweep idle sessions every `interval` until shutdown.
pub async fn run_reaper(broker: Arc<Broker>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let reaped = broker.reap_idle().await;
                if reaped > 0 {
                    info!(reaped, "reclaimed idle sessions");
                }
            }
        }
    }
    debug!("reaper stopped");
}

impl Broker {
    /// Stop and forget every session idle past the threshold.  Returns how
    /// many were removed.
    pub async fn reap_idle(&self) -> usize {
        let threshold = self.idle_threshold();
        let mut reaped = 0;

        for client_id in self.registry.idle_clients(threshold) {
            let Some(gate) = self.registry.gate(&client_id) else {
                continue;
            };
            let _guard = gate.lock().await;
            // A request may have landed while we waited for the gate.
            let taken = self.registry.with_session(&client_id, |s| {
                (Arc::ptr_eq(&s.gate, &gate) && s.is_idle(threshold))
                    .then(|| (s.pid, s.monitor.take()))
            });
            let Some(Some((pid, monitor))) = taken else {
                continue;
            };
            info!(%client_id, ?pid, "reaping idle session");
            if let Some(monitor) = monitor {
                monitor.stop().await;
            }
            self.registry.remove_gated(&client_id, &gate);
            reaped += 1;
        }
        reaped
    }
}
