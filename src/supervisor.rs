use std::time::Duration;

use tracing::{info, warn};

use crate::launcher;
use crate::state::SharedState;
use crate::stream::StreamState;

/// One reconciliation pass over the registry.
///
/// A `Running` entry whose process died outside our control (self-exit,
/// external kill) is marked `Crashed`; a `Stopping` entry abandoned by a
/// timed-out stop whose process has since died is settled as `Stopped`.
/// Entries are never removed here, so the final log of a crashed stream
/// stays inspectable until an explicit cleanup.
///
/// Returns the ids transitioned this pass.
pub fn sweep(state: &SharedState) -> Vec<String> {
    // Probe without the registry lock; apply transitions under it.
    let mut dead = Vec::new();
    for entry in state.registry.list_all() {
        let probe_worthy = matches!(entry.state, StreamState::Running | StreamState::Stopping);
        if !probe_worthy {
            continue;
        }
        match entry.pid {
            Some(pid) if launcher::pid_alive(pid) => {}
            _ => dead.push(entry),
        }
    }

    let mut transitioned = Vec::new();
    for observed in dead {
        let to = match observed.state {
            StreamState::Stopping => StreamState::Stopped,
            _ => StreamState::Crashed,
        };
        // Compare-and-settle: the transition applies only while the record
        // still describes the probed process. A concurrent start may have
        // put a fresh process in the slot since the probe; that record is
        // left alone, pid file included.
        if state.registry.settle(&observed, to).is_none() {
            continue;
        }
        let id = observed.spec.id;
        state.registry.clear_artifacts(&id, false);
        match to {
            StreamState::Stopped => info!("Reaper settled stream [{}] as stopped", id),
            _ => warn!("Stream [{}] exited unexpectedly; marked crashed", id),
        }
        transitioned.push(id);
    }
    transitioned
}

/// Background reaper: periodically reconciles registry state against actual
/// OS process liveness. Runs for the lifetime of the supervisor.
pub async fn start_supervisor(state: SharedState, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        sweep(&state);
    }
}
