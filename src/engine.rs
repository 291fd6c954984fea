use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{error, info, warn};

use crate::error::{ControlError, Result};
use crate::launcher;
use crate::state::SharedState;
use crate::stream::{validate_id, ManagedProcess, StreamSpec, StreamState};

/// Poll period while waiting for a signaled process to exit.
const EXIT_POLL_MS: u64 = 100;

/// Snapshot returned by every lifecycle operation: the registry record plus
/// a freshly probed liveness flag. The stored state can lag an OS-level
/// crash until the next reaper sweep, the flag never does.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub process: ManagedProcess,
    pub alive: bool,
}

impl StreamStatus {
    fn probe(process: ManagedProcess) -> Self {
        let alive = process.pid.is_some_and(launcher::pid_alive);
        Self { process, alive }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Restrict the sweep to these ids; `None` means every entry.
    pub ids: Option<Vec<String>>,
    /// Force-stop every still-running entry before removal.
    pub kill_all: bool,
    /// Also delete log files of removed entries.
    pub remove_logs: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupReport {
    /// Entries removed from the registry.
    pub removed: Vec<String>,
    /// Entries force-stopped because `kill_all` was set.
    pub killed: Vec<String>,
    /// On-disk pid files without a registry entry that were swept away.
    pub stale_files: Vec<String>,
    /// Per-id failures; one bad stream never aborts the rest of the sweep.
    pub errors: Vec<CleanupError>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupError {
    pub id: String,
    pub error: String,
}

/// The lifecycle state machine around the registry: start, stop, status,
/// listing, log tailing and bulk cleanup.
pub struct Engine;

impl Engine {
    /// Start a stream. Rejected with `AlreadyRunning` while a live process
    /// exists for the id; a failed launch leaves no trace in the registry.
    pub async fn start(state: &SharedState, spec: StreamSpec) -> Result<StreamStatus> {
        spec.validate()?;

        // Refuse to pile another transcoder onto a box that is already out
        // of memory; a failed probe is only a warning.
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < 5120 => {
                return Err(ControlError::Io(std::io::Error::other(format!(
                    "insufficient system memory ({} KB available)",
                    mem.avail
                ))));
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to check memory usage: {}", e),
        }

        let id = spec.id.clone();
        let log_path = state.registry.log_path(&id);
        let placeholder = ManagedProcess {
            spec: spec.clone(),
            pid: None,
            log_path: log_path.clone(),
            started_at: SystemTime::now(),
            state: StreamState::Starting,
        };
        // Reserving the slot under the registry lock is what keeps two
        // concurrent starts for the same id from both spawning.
        state.registry.insert(placeholder)?;

        let pid = match launcher::launch(&spec, &state.config, &log_path) {
            Ok(pid) => pid,
            Err(e) => {
                state.registry.remove(&id, false);
                return Err(e.into());
            }
        };

        if let Err(e) = state.registry.commit_running(&id, pid) {
            // The process is up and tracked in memory; losing the pid file
            // only weakens rediscovery after a supervisor restart.
            error!("Failed to persist pid file for [{}]: {}", id, e);
        }

        info!("Stream [{}] started with PID {}", id, pid);
        Ok(StreamStatus::probe(state.registry.get(&id).ok_or(
            ControlError::NotFound { id },
        )?))
    }

    /// Stop a stream: SIGTERM to the process group, bounded wait, then
    /// SIGKILL. `force` skips the graceful phase. Idempotent for entries
    /// whose process is already gone. Never blocks beyond the configured
    /// grace and kill waits; a child that survives SIGKILL leaves the entry
    /// in `Stopping` for the reaper and surfaces `TerminationTimeout`.
    pub async fn stop(state: &SharedState, id: &str, force: bool) -> Result<StreamStatus> {
        validate_id(id)?;
        let entry = state
            .registry
            .get(id)
            .ok_or_else(|| ControlError::NotFound { id: id.to_string() })?;

        if entry.state.is_terminal() {
            return Ok(StreamStatus::probe(entry));
        }

        let Some(pid) = entry.pid else {
            return Ok(Self::finish_stopped(state, &entry));
        };
        if !launcher::pid_alive(pid) {
            return Ok(Self::finish_stopped(state, &entry));
        }

        // Mark Stopping only while the record still describes the process
        // we just probed; a dead child can be replaced by a concurrent
        // start at any poll boundary.
        let mut marked = false;
        state.registry.update(id, |e| {
            if e.pid == Some(pid) && !e.state.is_terminal() {
                e.state = StreamState::Stopping;
                marked = true;
            }
        });
        if !marked {
            return Ok(Self::finish_stopped(state, &entry));
        }

        if !force {
            launcher::signal_group(pid, true);
            if wait_for_exit(pid, state.config.server.stop_grace_ms).await {
                info!("Stream [{}] exited after SIGTERM", id);
                return Ok(Self::finish_stopped(state, &entry));
            }
            warn!("Stream [{}] (PID {}) ignored SIGTERM; escalating", id, pid);
        }

        launcher::signal_group(pid, false);
        if wait_for_exit(pid, state.config.server.kill_wait_ms).await {
            info!("Stream [{}] killed", id);
            return Ok(Self::finish_stopped(state, &entry));
        }

        error!("Stream [{}] (PID {}) survived SIGKILL", id, pid);
        Err(ControlError::TerminationTimeout {
            id: id.to_string(),
            pid,
        })
    }

    /// Settle the observed process as `Stopped`. The registry transition is
    /// compare-and-settle: it applies only while the record still describes
    /// the observed process, so a record replaced by a concurrent start (or
    /// removed by a racing cleanup) is left untouched and the process we
    /// actually stopped is reported stopped as-is.
    fn finish_stopped(state: &SharedState, observed: &ManagedProcess) -> StreamStatus {
        match state.registry.settle(observed, StreamState::Stopped) {
            Some(process) => {
                state.registry.clear_artifacts(&process.spec.id, false);
                StreamStatus { process, alive: false }
            }
            None => {
                let mut process = observed.clone();
                process.state = StreamState::Stopped;
                process.pid = None;
                StreamStatus { process, alive: false }
            }
        }
    }

    /// Current record for one id with freshly probed liveness. Does not
    /// transition state; `Running → Crashed` belongs to the reaper.
    pub fn status(state: &SharedState, id: &str) -> Result<StreamStatus> {
        validate_id(id)?;
        state
            .registry
            .get(id)
            .map(StreamStatus::probe)
            .ok_or_else(|| ControlError::NotFound { id: id.to_string() })
    }

    /// Snapshots of every registry entry, ordered by id, each re-probed.
    pub fn list_all(state: &SharedState) -> Vec<StreamStatus> {
        state
            .registry
            .list_all()
            .into_iter()
            .map(StreamStatus::probe)
            .collect()
    }

    /// Last `lines` lines of the stream's log. A pure file read; the log of
    /// a stopped or crashed stream stays readable until cleanup removes it.
    pub fn tail_log(state: &SharedState, id: &str, lines: usize) -> Result<String> {
        validate_id(id)?;
        let log_path = state
            .registry
            .get(id)
            .map(|e| e.log_path)
            .unwrap_or_else(|| state.registry.log_path(id));
        if !log_path.exists() {
            return Err(ControlError::NotFound { id: id.to_string() });
        }
        Ok(tail_file(&log_path, lines)?)
    }

    /// Stop every non-terminal entry, collecting per-id outcomes.
    pub async fn stop_all(state: &SharedState) -> Vec<(String, Result<StreamStatus>)> {
        let mut results = Vec::new();
        for entry in state.registry.list_all() {
            if entry.state.is_terminal() {
                continue;
            }
            let id = entry.spec.id;
            let outcome = Self::stop(state, &id, false).await;
            results.push((id, outcome));
        }
        results
    }

    /// Remove terminal entries (and optionally their logs) from the
    /// registry, plus stale pid files on disk. With `kill_all`, force-stop
    /// every still-running entry first: the single bulk shutdown switch.
    pub async fn cleanup(state: &SharedState, opts: CleanupOptions) -> CleanupReport {
        let mut report = CleanupReport::default();
        let in_scope = |id: &str| opts.ids.as_ref().is_none_or(|ids| ids.iter().any(|i| i == id));

        if opts.kill_all {
            for entry in state.registry.list_all() {
                let id = entry.spec.id;
                if entry.state.is_terminal() || !in_scope(&id) {
                    continue;
                }
                match Self::stop(state, &id, true).await {
                    Ok(_) => report.killed.push(id),
                    Err(e) => report.errors.push(CleanupError {
                        id,
                        error: e.to_string(),
                    }),
                }
            }
        }

        for entry in state.registry.list_all() {
            let id = entry.spec.id;
            if !in_scope(&id) {
                continue;
            }
            if entry.state.is_terminal() {
                state.registry.remove(&id, opts.remove_logs);
                info!("Cleaned up stream [{}]", id);
                report.removed.push(id);
            } else if opts.ids.is_some() {
                // Explicitly named but still live; tell the caller instead
                // of silently skipping.
                report.errors.push(CleanupError {
                    id,
                    error: "still running; stop it first or pass kill_all".to_string(),
                });
            }
        }

        // Pid files left behind by a previous supervisor crash. A file whose
        // pid is dead, or recycled by an unrelated process, is stale and
        // swept; nothing is ever signaled here.
        for id in state.registry.orphaned_pid_files() {
            if !in_scope(&id) {
                continue;
            }
            let ours = std::fs::read_to_string(state.registry.pid_path(&id))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .is_some_and(|pid| {
                    launcher::pid_alive(pid)
                        && launcher::pid_matches_command(pid, &state.config.server.ffmpeg_binary)
                });
            if ours {
                continue;
            }
            state.registry.clear_artifacts(&id, opts.remove_logs);
            report.stale_files.push(id);
        }

        report
    }
}

/// Poll the pid until it disappears or the budget elapses. Runs without any
/// registry lock held so other streams' operations proceed concurrently.
async fn wait_for_exit(pid: u32, budget_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);
    loop {
        if !launcher::pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(EXIT_POLL_MS)).await;
    }
}

/// Read the last `lines` lines of a file by scanning backwards in growing
/// chunks, so tailing a multi-gigabyte transcoder log stays cheap.
fn tail_file(path: &Path, lines: usize) -> std::io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    let mut position = file.seek(SeekFrom::End(0))?;
    if position == 0 || lines == 0 {
        return Ok(String::new());
    }

    let mut chunk_size: u64 = 1024;
    let mut data: Vec<u8> = Vec::new();
    while position > 0 {
        let read_size = chunk_size.min(position);
        position -= read_size;
        file.seek(SeekFrom::Start(position))?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&data);
        data = chunk;

        // One extra newline guarantees the first kept line is complete.
        if data.iter().filter(|b| **b == b'\n').count() > lines {
            break;
        }
        chunk_size = (chunk_size * 2).min(10 * 1024 * 1024);
    }

    let text = String::from_utf8_lossy(&data);
    let kept: Vec<&str> = text.lines().collect();
    let skip = kept.len().saturating_sub(lines);
    Ok(kept[skip..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(path: &Path, n: usize) {
        let mut f = std::fs::File::create(path).unwrap();
        for i in 0..n {
            writeln!(f, "line {i}").unwrap();
        }
    }

    #[test]
    fn tail_returns_exactly_n_trailing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_lines(&path, 500);

        let out = tail_file(&path, 3).unwrap();
        assert_eq!(out, "line 497\nline 498\nline 499");
    }

    #[test]
    fn tail_of_short_file_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_lines(&path, 2);

        let out = tail_file(&path, 200).unwrap();
        assert_eq!(out, "line 0\nline 1");
    }

    #[test]
    fn tail_of_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::File::create(&path).unwrap();
        assert_eq!(tail_file(&path, 10).unwrap(), "");
    }

    #[test]
    fn tail_crosses_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        // Lines long enough that 3000 of them far exceed the initial 1 KiB
        // chunk, forcing several doubling rounds.
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..3000 {
            writeln!(f, "{:0>120}", i).unwrap();
        }
        drop(f);

        let out = tail_file(&path, 50).unwrap();
        let got: Vec<&str> = out.lines().collect();
        assert_eq!(got.len(), 50);
        assert_eq!(got[0], format!("{:0>120}", 2950));
        assert_eq!(got[49], format!("{:0>120}", 2999));
    }
}
