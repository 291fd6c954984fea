use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Bearer token required on every API route.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,

    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: PathBuf,

    /// State directory holding pids/ and logs/ per managed stream.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Reaper sweep period.
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,

    /// How long a stop waits after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Bounded wait after SIGKILL before the stop gives up.
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_token: default_auth_token(),
            ffmpeg_binary: default_ffmpeg_binary(),
            base_dir: default_base_dir(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
        }
    }
}

/// ffmpeg codec settings applied when a stream has to be re-encoded.
#[derive(Debug, Deserialize, Clone)]
pub struct EncodingConfig {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_video_preset")]
    pub video_preset: String,
    #[serde(default = "default_video_tune")]
    pub video_tune: String,
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            video_preset: default_video_preset(),
            video_tune: default_video_tune(),
            video_bitrate: default_video_bitrate(),
            audio_codec: default_audio_codec(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_auth_token() -> String {
    "CHANGE_ME".to_string()
}

fn default_ffmpeg_binary() -> PathBuf {
    PathBuf::from("/usr/bin/ffmpeg")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/streamctl")
}

fn default_supervisor_interval_ms() -> u64 {
    5000
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_kill_wait_ms() -> u64 {
    1000
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_video_preset() -> String {
    "veryfast".to_string()
}

fn default_video_tune() -> String {
    "zerolatency".to_string()
}

fn default_video_bitrate() -> String {
    "2000k".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_sample_rate() -> String {
    "44100".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
