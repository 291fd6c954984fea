use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ControlError;
use crate::launcher;
use crate::stream::{ManagedProcess, StreamSpec, StreamState};

/// Sidecar metadata persisted next to the pid file so a supervisor restart
/// can recover the exact spec that launched a child.
#[derive(Debug, Serialize, Deserialize)]
struct StreamMeta {
    spec: StreamSpec,
    started_at_unix: u64,
}

/// Authoritative stream-id → process mapping, backed by a state directory:
///
/// ```text
/// <base>/pids/<id>.pid    numeric PID, plain text
/// <base>/pids/<id>.json   serialized StreamSpec + start time
/// <base>/logs/<id>.log    merged child stdout/stderr
/// ```
///
/// A single mutex serializes all mutations; stream counts are small enough
/// that per-id locking would buy nothing. Snapshots handed out are clones,
/// never references into the map.
pub struct Registry {
    base_dir: PathBuf,
    /// The transcoder binary we launch, used to verify rediscovered pids.
    transcoder: PathBuf,
    inner: Mutex<BTreeMap<String, ManagedProcess>>,
}

impl Registry {
    /// Open (creating directories as needed) and rediscover children left
    /// over from a previous supervisor run.
    pub fn open(base_dir: &Path, transcoder: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(base_dir.join("pids"))?;
        std::fs::create_dir_all(base_dir.join("logs"))?;
        let registry = Self {
            base_dir: base_dir.to_path_buf(),
            transcoder: transcoder.to_path_buf(),
            inner: Mutex::new(BTreeMap::new()),
        };
        registry.rediscover();
        Ok(registry)
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.base_dir.join("pids")
    }

    pub fn pid_path(&self, id: &str) -> PathBuf {
        self.pids_dir().join(format!("{id}.pid"))
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.pids_dir().join(format!("{id}.json"))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.base_dir.join("logs").join(format!("{id}.log"))
    }

    pub fn get(&self, id: &str) -> Option<ManagedProcess> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Insert a record for `entry.spec.id`.
    ///
    /// Fails with `AlreadyRunning` if a live non-terminal record exists.
    /// A `Running` record whose process is actually dead (external kill the
    /// reaper has not swept yet) does not block: it is replaced, matching the
    /// stale-pid-file handling of the on-disk layout. Terminal records are
    /// always replaced; PID reuse makes strict rejection unhelpful.
    pub fn insert(&self, entry: ManagedProcess) -> Result<(), ControlError> {
        let id = entry.spec.id.clone();
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.get(&id) {
            if !existing.state.is_terminal() {
                match existing.pid {
                    Some(pid) if !launcher::pid_alive(pid) => {
                        warn!(
                            "Stream [{}] had a stale {:?} entry (PID {} dead); replacing",
                            id, existing.state, pid
                        );
                    }
                    _ => {
                        return Err(ControlError::AlreadyRunning {
                            id,
                            pid: existing.pid,
                        });
                    }
                }
            }
        }
        inner.insert(id, entry);
        Ok(())
    }

    /// Compare-and-settle: move the record for `observed`'s id into the
    /// terminal `to` state (clearing its pid), but only while the record
    /// still describes the observed process — same pid, or same start time
    /// for a record that had no pid yet. Returns the settled snapshot, or
    /// `None` when the record was replaced, removed, or already terminal.
    ///
    /// This is the guard that keeps a probed-then-applied transition (stop's
    /// poll loop, the reaper sweep) from clobbering a fresh record that a
    /// concurrent start legitimately put in the slot after the old process
    /// died.
    pub fn settle(
        &self,
        observed: &ManagedProcess,
        to: StreamState,
    ) -> Option<ManagedProcess> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(&observed.spec.id)?;
        let same_record = match observed.pid {
            Some(pid) => entry.pid == Some(pid),
            None => entry.pid.is_none() && entry.started_at == observed.started_at,
        };
        if !same_record || entry.state.is_terminal() {
            return None;
        }
        entry.pid = None;
        entry.state = to;
        Some(entry.clone())
    }

    /// Apply a mutation to the record for `id` under the registry lock,
    /// returning the updated snapshot.
    pub fn update<F>(&self, id: &str, mutation: F) -> Option<ManagedProcess>
    where
        F: FnOnce(&mut ManagedProcess),
    {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(id)?;
        mutation(entry);
        Some(entry.clone())
    }

    /// Remove the record and its pid/metadata artifacts. The log file is
    /// kept unless `remove_log` is set, so operators can inspect the final
    /// output of a stopped stream.
    pub fn remove(&self, id: &str, remove_log: bool) -> Option<ManagedProcess> {
        let removed = self.inner.lock().unwrap().remove(id);
        if removed.is_some() {
            self.clear_artifacts(id, remove_log);
        }
        removed
    }

    /// Snapshots of every record, ordered by id.
    pub fn list_all(&self) -> Vec<ManagedProcess> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Promote a `Starting` record to `Running` and persist its pid file and
    /// metadata sidecar.
    pub fn commit_running(&self, id: &str, pid: u32) -> std::io::Result<()> {
        let snapshot = self.update(id, |entry| {
            entry.pid = Some(pid);
            entry.state = StreamState::Running;
            entry.started_at = SystemTime::now();
        });
        let Some(entry) = snapshot else {
            return Ok(());
        };
        std::fs::write(self.pid_path(id), format!("{pid}\n"))?;
        let meta = StreamMeta {
            spec: entry.spec,
            started_at_unix: unix_secs(entry.started_at),
        };
        std::fs::write(self.meta_path(id), serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    /// Delete the on-disk pid and metadata files for `id` (and the log file
    /// when asked). Best-effort; missing files are fine.
    pub fn clear_artifacts(&self, id: &str, remove_log: bool) {
        let _ = std::fs::remove_file(self.pid_path(id));
        let _ = std::fs::remove_file(self.meta_path(id));
        if remove_log {
            let _ = std::fs::remove_file(self.log_path(id));
        }
    }

    /// Pid files on disk that have no registry record, e.g. left behind by a
    /// supervisor that crashed before this run. Used by cleanup.
    pub fn orphaned_pid_files(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        self.scan_pid_files()
            .into_iter()
            .filter(|id| !inner.contains_key(id))
            .collect()
    }

    fn scan_pid_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.pids_dir()) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "pid") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    /// Scan the pid directory and adopt children launched by a previous
    /// supervisor run. A live pid comes back as `Running`, a dead one as
    /// `Crashed` (its log stays inspectable until an explicit cleanup). Specs
    /// are recovered from the metadata sidecar; a pid file without one is
    /// adopted with a placeholder spec so it can still be stopped.
    fn rediscover(&self) {
        for id in self.scan_pid_files() {
            let Some(pid) = read_pid_file(&self.pid_path(&id)) else {
                warn!("Removing unreadable pid file for [{}]", id);
                self.clear_artifacts(&id, false);
                continue;
            };

            let (spec, started_at) = match read_meta_file(&self.meta_path(&id)) {
                Some(meta) => (
                    meta.spec,
                    UNIX_EPOCH + Duration::from_secs(meta.started_at_unix),
                ),
                None => {
                    warn!(
                        "Stream [{}] has no metadata sidecar; adopting with placeholder spec",
                        id
                    );
                    (StreamSpec::placeholder(&id), SystemTime::now())
                }
            };

            // A pid recycled by an unrelated process since the previous run
            // must not be adopted: stop/cleanup would signal an innocent
            // process group.
            let alive = launcher::pid_alive(pid);
            let ours = alive && launcher::pid_matches_command(pid, &self.transcoder);
            let entry = ManagedProcess {
                spec,
                pid: ours.then_some(pid),
                log_path: self.log_path(&id),
                started_at,
                state: if ours {
                    StreamState::Running
                } else {
                    StreamState::Crashed
                },
            };
            if ours {
                info!("Rediscovered running stream [{}] with PID {}", id, pid);
            } else if alive {
                warn!(
                    "PID {} for stream [{}] belongs to another process now; marking crashed",
                    pid, id
                );
            } else {
                info!("Rediscovered dead stream [{}] (PID {} gone)", id, pid);
            }
            self.inner.lock().unwrap().insert(id, entry);
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_meta_file(path: &Path) -> Option<StreamMeta> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        id: &str,
        state: StreamState,
        pid: Option<u32>,
        registry: &Registry,
    ) -> ManagedProcess {
        ManagedProcess {
            spec: StreamSpec {
                id: id.to_string(),
                source: "http://in/a.m3u8".into(),
                destination: "rtmp://out/app".into(),
                overlay_image: None,
                extra_args: Vec::new(),
            },
            pid,
            log_path: registry.log_path(id),
            started_at: SystemTime::now(),
            state,
        }
    }

    #[test]
    fn insert_rejects_live_running_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        // Our own pid is certainly alive.
        let pid = std::process::id();
        registry
            .insert(entry("s1", StreamState::Running, Some(pid), &registry))
            .unwrap();

        let err = registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning { .. }));
    }

    #[test]
    fn insert_replaces_terminal_and_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        registry
            .insert(entry("s1", StreamState::Stopped, None, &registry))
            .unwrap();
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();

        // A Running record whose pid is dead does not block either.
        registry.update("s1", |e| {
            e.state = StreamState::Running;
            e.pid = Some(i32::MAX as u32); // far above any real pid_max
        });
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();
    }

    #[test]
    fn listing_is_ordered_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        for id in ["zeta", "alpha", "mid"] {
            registry
                .insert(entry(id, StreamState::Stopped, None, &registry))
                .unwrap();
        }
        let ids: Vec<_> = registry
            .list_all()
            .into_iter()
            .map(|e| e.spec.id)
            .collect();
        assert_eq!(ids, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn commit_persists_and_remove_clears_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();
        registry.commit_running("s1", 12345).unwrap();
        assert_eq!(
            std::fs::read_to_string(registry.pid_path("s1")).unwrap().trim(),
            "12345"
        );
        assert!(registry.meta_path("s1").exists());

        registry.remove("s1", false);
        assert!(!registry.pid_path("s1").exists());
        assert!(!registry.meta_path("s1").exists());
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn settle_moves_observed_record_to_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        let dead_pid = i32::MAX as u32;
        registry
            .insert(entry("s1", StreamState::Running, Some(dead_pid), &registry))
            .unwrap();

        let observed = registry.get("s1").unwrap();
        let settled = registry.settle(&observed, StreamState::Crashed).unwrap();
        assert_eq!(settled.state, StreamState::Crashed);
        assert_eq!(settled.pid, None);

        // Already terminal: a second settle is a no-op.
        assert!(registry.settle(&observed, StreamState::Stopped).is_none());
        assert_eq!(registry.get("s1").unwrap().state, StreamState::Crashed);
    }

    #[test]
    fn settle_ignores_replaced_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        let dead_pid = i32::MAX as u32;
        registry
            .insert(entry("s1", StreamState::Running, Some(dead_pid), &registry))
            .unwrap();
        let observed = registry.get("s1").unwrap();

        // A restart replaces the dead record with a fresh live process.
        let live_pid = std::process::id();
        registry
            .insert(entry("s1", StreamState::Running, Some(live_pid), &registry))
            .unwrap();

        // Settling against the stale snapshot must leave the new record alone.
        assert!(registry.settle(&observed, StreamState::Stopped).is_none());
        let current = registry.get("s1").unwrap();
        assert_eq!(current.state, StreamState::Running);
        assert_eq!(current.pid, Some(live_pid));
    }

    #[test]
    fn settle_matches_pidless_record_by_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();
        let observed = registry.get("s1").unwrap();

        let settled = registry.settle(&observed, StreamState::Stopped).unwrap();
        assert_eq!(settled.state, StreamState::Stopped);

        // A different pid-less record (new start time) is not the observed one.
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();
        registry.update("s1", |e| e.started_at += Duration::from_secs(1));
        assert!(registry.settle(&observed, StreamState::Stopped).is_none());
        assert_eq!(registry.get("s1").unwrap().state, StreamState::Starting);
    }

    #[test]
    fn starting_placeholder_rejects_without_phantom_pid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap();

        let err = registry
            .insert(entry("s1", StreamState::Starting, None, &registry))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("already running"));
        assert!(!message.contains("PID"));
    }

    #[test]
    fn rediscovery_recovers_spec_from_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
            registry
                .insert(entry("s1", StreamState::Starting, None, &registry))
                .unwrap();
            // A pid that is long gone by now.
            registry.commit_running("s1", i32::MAX as u32).unwrap();
        }

        let reopened = Registry::open(dir.path(), Path::new("/usr/bin/ffmpeg")).unwrap();
        let rec = reopened.get("s1").expect("rediscovered entry");
        assert_eq!(rec.state, StreamState::Crashed);
        assert_eq!(rec.pid, None);
        assert_eq!(rec.spec.source, "http://in/a.m3u8");
    }
}
