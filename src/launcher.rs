use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::LaunchError;
use crate::stream::StreamSpec;

/// Centered full-frame overlay, applied when an overlay image is given and
/// the caller has not supplied a filter graph of their own.
const OVERLAY_FILTER: &str = "[0:v][1:v]overlay=(W-w)/2:(H-h)/2:format=auto";

/// Argument fragments that imply the video cannot be stream-copied.
const REENCODE_KEYWORDS: &[&str] = &[
    "-filter_complex",
    "-vf",
    "drawtext",
    "overlay",
    "format=",
    "scale",
    "crop",
];

fn should_reencode(args: &[String]) -> bool {
    let joined = args.join(" ").to_lowercase();
    REENCODE_KEYWORDS.iter().any(|kw| joined.contains(kw))
}

/// Build the ffmpeg argument vector for a spec. Deterministic: source input
/// first, optional overlay input, verbatim extra args, derived codec args,
/// flv output last.
pub fn build_args(spec: &StreamSpec, config: &AppConfig) -> Vec<String> {
    // -re paces the input at its native frame rate.
    let mut args = vec!["-re".to_string(), "-i".to_string(), spec.source.clone()];

    if let Some(image) = &spec.overlay_image {
        args.push("-i".to_string());
        args.push(image.clone());
    }

    let mut middle: Vec<String> = spec.extra_args.clone();
    if spec.overlay_image.is_some() && !should_reencode(&middle) {
        middle.push("-filter_complex".to_string());
        middle.push(OVERLAY_FILTER.to_string());
    }

    let reencode = should_reencode(&middle);
    args.extend(middle);

    let enc = &config.encoding;
    let video: &[&str] = if reencode {
        &[
            "-c:v",
            enc.video_codec.as_str(),
            "-preset",
            enc.video_preset.as_str(),
            "-tune",
            enc.video_tune.as_str(),
            "-b:v",
            enc.video_bitrate.as_str(),
        ]
    } else {
        &["-c:v", "copy"]
    };
    args.extend(video.iter().map(|s| s.to_string()));

    // Audio is always re-encoded for RTMP compatibility.
    let audio = [
        "-c:a",
        enc.audio_codec.as_str(),
        "-ar",
        enc.audio_sample_rate.as_str(),
        "-b:a",
        enc.audio_bitrate.as_str(),
        "-f",
        "flv",
    ];
    args.extend(audio.iter().map(|s| s.to_string()));
    args.push(spec.destination.clone());

    args
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Start the transcoder as a detached child in its own session, with merged
/// stdout/stderr redirected to `log_path` (created or truncated).
///
/// On success exactly one new OS process exists; on failure the log file is
/// removed again and no process is left behind.
pub fn launch(spec: &StreamSpec, config: &AppConfig, log_path: &Path) -> Result<u32, LaunchError> {
    let binary = &config.server.ffmpeg_binary;
    if !is_executable(binary) {
        return Err(LaunchError::ExecutableNotFound(binary.clone()));
    }

    let args = build_args(spec, config);
    debug!("ffmpeg args for [{}]: {:?}", spec.id, args);

    let log_file = std::fs::File::create(log_path).map_err(LaunchError::SpawnFailed)?;
    let log_err = log_file.try_clone().map_err(LaunchError::SpawnFailed)?;

    let mut cmd = Command::new(binary);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);

    // New session so a group signal reaches any helpers ffmpeg forks.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = std::fs::remove_file(log_path);
            return Err(match e.kind() {
                std::io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(binary.clone()),
                _ => LaunchError::SpawnFailed(e),
            });
        }
    };

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            let _ = std::fs::remove_file(log_path);
            return Err(LaunchError::SpawnFailed(std::io::Error::other(
                "child exited before PID could be captured",
            )));
        }
    };

    // The child handle is dropped here on purpose: the runtime reaps the
    // process in the background, and liveness is tracked by PID probing so
    // the record survives a supervisor restart.
    drop(child);

    info!("Launched stream [{}] with PID {}", spec.id, pid);
    Ok(pid)
}

/// Non-blocking liveness probe (signal 0).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Check that `pid` still belongs to the transcoder we launched, by looking
/// for the binary name in `/proc/<pid>/cmdline`. PIDs get recycled, so a
/// number recorded in a pid file may point at an unrelated process by the
/// time it is read back.
#[cfg(target_os = "linux")]
pub fn pid_matches_command(pid: u32, binary: &Path) -> bool {
    let Ok(bytes) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let needle = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cmdline = bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    cmdline.contains(&needle)
}

/// Without procfs there is nothing to compare against; trust the pid file.
#[cfg(not(target_os = "linux"))]
pub fn pid_matches_command(_pid: u32, _binary: &Path) -> bool {
    true
}

/// Signal the whole process group created at launch. The group id equals the
/// leader's pid because of the setsid at spawn time. Falls back to signaling
/// the single pid if the group is already gone.
#[cfg(unix)]
pub fn signal_group(pid: u32, graceful: bool) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let sig = if graceful {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    };
    if killpg(Pid::from_raw(pid as i32), sig).is_err() {
        let _ = kill(Pid::from_raw(pid as i32), sig);
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _graceful: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(extra: &[&str], overlay: Option<&str>) -> StreamSpec {
        StreamSpec {
            id: "s1".into(),
            source: "http://in/a.m3u8".into(),
            destination: "rtmp://out/app/key".into(),
            overlay_image: overlay.map(String::from),
            extra_args: extra.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn plain_relay_copies_video() {
        let args = build_args(&spec(&[], None), &AppConfig::default());
        assert_eq!(&args[..3], &["-re", "-i", "http://in/a.m3u8"]);
        let copy_at = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[copy_at + 1], "copy");
        assert_eq!(args.last().unwrap(), "rtmp://out/app/key");
        assert!(args.contains(&"flv".to_string()));
    }

    #[test]
    fn filter_args_trigger_reencode() {
        let args = build_args(
            &spec(&["-vf", "scale=1280:720"], None),
            &AppConfig::default(),
        );
        assert!(args.contains(&"libx264".to_string()));
        assert!(!args.contains(&"copy".to_string()));
    }

    #[test]
    fn overlay_injects_second_input_and_filter() {
        let args = build_args(&spec(&[], Some("/tmp/ad.png")), &AppConfig::default());
        let inputs: Vec<_> = args.iter().filter(|a| *a == "-i").collect();
        assert_eq!(inputs.len(), 2);
        assert!(args.contains(&"-filter_complex".to_string()));
        assert!(args.contains(&OVERLAY_FILTER.to_string()));
        // Injected filter means re-encoding.
        assert!(args.contains(&"libx264".to_string()));
    }

    #[test]
    fn overlay_respects_caller_filter_graph() {
        let args = build_args(
            &spec(
                &["-filter_complex", "[0:v][1:v]overlay=0:0"],
                Some("/tmp/ad.png"),
            ),
            &AppConfig::default(),
        );
        let filters: Vec<_> = args.iter().filter(|a| *a == "-filter_complex").collect();
        assert_eq!(filters.len(), 1);
        assert!(!args.contains(&OVERLAY_FILTER.to_string()));
    }

    #[test]
    fn extra_args_pass_through_in_order() {
        let args = build_args(&spec(&["-t", "60"], None), &AppConfig::default());
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "60");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cmdline_identity_check() {
        let me = std::process::id();
        let exe = std::env::current_exe().unwrap();
        assert!(pid_matches_command(me, &exe));
        assert!(!pid_matches_command(me, Path::new("/usr/bin/definitely-not-this")));
    }

    #[test]
    fn missing_binary_is_rejected_before_spawn() {
        let mut config = AppConfig::default();
        config.server.ffmpeg_binary = "/nonexistent/ffmpeg".into();
        let dir = tempfile::tempdir().unwrap();
        let err = launch(&spec(&[], None), &config, &dir.path().join("s1.log")).unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound(_)));
    }
}
