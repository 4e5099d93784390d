use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::gateway::events::Opcode;

/// Fallback when HELLO carries an implausible interval of zero.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);

/// Ack bookkeeping shared between the connection loop and the heartbeat
/// task. The loop records acks and observed sequences; the task reads them
/// at each tick.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    /// Beats sent without a HEARTBEAT_ACK in between.
    outstanding: AtomicU32,
    /// Last observed dispatch sequence, -1 before the first DISPATCH.
    last_sequence: AtomicI64,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicU32::new(0),
            last_sequence: AtomicI64::new(-1),
        }
    }

    pub fn observe_sequence(&self, sequence: u64) {
        self.last_sequence.store(sequence as i64, Ordering::SeqCst);
    }

    pub fn ack(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn beat(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Heartbeat frame carrying the last observed sequence, or null before
    /// the first DISPATCH.
    pub fn frame(&self) -> String {
        let seq = self.last_sequence.load(Ordering::SeqCst);
        let data = if seq < 0 {
            serde_json::Value::Null
        } else {
            json!(seq as u64)
        };
        json!({ "op": Opcode::Heartbeat as u8, "data": data }).to_string()
    }
}

/// Spawn the periodic heartbeat task.
///
/// Each tick first checks liveness: more than `missed_limit` un-acked
/// beats means the connection cannot be trusted, and a signal on `missed`
/// tells the connection loop to reconnect. A send after the socket closed
/// is a no-op; the task just stops. Shutdown is signaled through the watch
/// channel and takes effect at the next select point.
pub fn spawn_heartbeat(
    interval: Duration,
    missed_limit: u32,
    monitor: Arc<HeartbeatMonitor>,
    outbound: mpsc::UnboundedSender<String>,
    missed: mpsc::UnboundedSender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        DEFAULT_HEARTBEAT_INTERVAL
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first beat belongs one full
        // interval after HELLO
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if monitor.outstanding() > missed_limit {
                        tracing::warn!(
                            outstanding = monitor.outstanding(),
                            "heartbeat ack missing, flagging connection"
                        );
                        let _ = missed.send(());
                        break;
                    }
                    if outbound.send(monitor.frame()).is_err() {
                        tracing::debug!("heartbeat after socket closed, stopping");
                        break;
                    }
                    monitor.beat();
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
