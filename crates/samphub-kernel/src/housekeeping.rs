//! Periodic sweep of call deadlines and dead clients.
//!
//! The sweep runs as a background tokio task owned by the hub. Each tick
//! times out overdue asynchronous calls (their callers get an ERROR response)
//! and unregisters clients whose transport failed or closed.

use crate::hub::Hub;
use samphub_types::ids::ClientId;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Outcome of one housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Asynchronous calls that passed their deadline during this pass.
    pub timed_out_calls: usize,
    /// Clients unregistered because they failed the liveness check.
    pub reaped_clients: Vec<ClientId>,
}

impl HousekeepingReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out_calls == 0 && self.reaped_clients.is_empty()
    }
}

/// Spawn the sweep loop. It stops when `shutdown` flips to true or the hub
/// is dropped.
pub fn spawn(
    hub: Weak<Hub>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(hub) = hub.upgrade() else { break };
                    let report = hub.housekeeping_tick(Instant::now());
                    if !report.is_empty() {
                        info!(
                            timed_out_calls = report.timed_out_calls,
                            reaped_clients = report.reaped_clients.len(),
                            "Housekeeping pass"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Housekeeping stopped");
    })
}
