//! Network threshold monitor.

use std::sync::Arc;

use crate::activity::KillContext;
use crate::registry::Registry;
use crate::shaper::{TX_BYTES_SHUTDOWN, TX_PACKETS_SHUTDOWN};

/// Mitigates any activity whose transmit rates cross the thresholds.
///
/// No damper and no registry delete here: the NIC mitigation is the
/// graduated ladder, and the interface's rung has to survive into the next
/// tick. An interface that goes administratively down simply stops being
/// sampled and ages out.
pub struct NetworkMonitor {
    registry: Arc<Registry>,
    ctx: KillContext,
}

impl NetworkMonitor {
    /// Creates the monitor.
    pub fn new(registry: Arc<Registry>, ctx: KillContext) -> Self {
        Self { registry, ctx }
    }

    /// One monitor tick.
    pub fn tick(&self) {
        for (name, activity) in self.registry.items() {
            let usage = activity.network();
            if usage.tx_bytes_per_s < TX_BYTES_SHUTDOWN
                && usage.tx_packets_per_s < TX_PACKETS_SHUTDOWN
            {
                continue;
            }

            tracing::info!(
                "'{name}' exceeds network thresholds ({:.0} B/s, {:.0} pkt/s)",
                usage.tx_bytes_per_s,
                usage.tx_packets_per_s
            );
            if let Err(e) = activity.kill(&self.ctx) {
                tracing::error!("network mitigation for '{name}' failed: {e}");
            }
        }
    }
}
