use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Longest stream id we accept as a filesystem-path component.
const MAX_ID_LEN: usize = 128;

/// Caller-supplied description of one relay pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Unique key; also used as the pid/log filename stem.
    pub id: String,
    /// Input media URL (typically HLS).
    pub source: String,
    /// Output target URL (typically RTMP).
    pub destination: String,
    /// Optional static image composited over the video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_image: Option<String>,
    /// Additional ffmpeg tokens, passed through verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl StreamSpec {
    /// Validate the spec before any path or command is built from it.
    pub fn validate(&self) -> Result<(), ControlError> {
        validate_id(&self.id)?;
        if self.source.trim().is_empty() {
            return Err(ControlError::InvalidSpec("source URL is required".into()));
        }
        if self.destination.trim().is_empty() {
            return Err(ControlError::InvalidSpec(
                "destination URL is required".into(),
            ));
        }
        Ok(())
    }

    /// Placeholder spec for entries rediscovered from a pid file whose
    /// metadata sidecar is missing or unreadable.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: String::new(),
            destination: String::new(),
            overlay_image: None,
            extra_args: Vec::new(),
        }
    }
}

/// Reject ids that are empty, oversized, or could escape the state directory
/// once used as a filename.
pub fn validate_id(id: &str) -> Result<(), ControlError> {
    if id.is_empty() {
        return Err(ControlError::InvalidSpec("stream id is required".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(ControlError::InvalidSpec(format!(
            "stream id longer than {MAX_ID_LEN} characters"
        )));
    }
    if id == "." || id == ".." {
        return Err(ControlError::InvalidSpec(
            "stream id must not be a path component".into(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ControlError::InvalidSpec(
            "stream id may only contain [A-Za-z0-9._-]".into(),
        ));
    }
    Ok(())
}

/// Lifecycle state of a managed process. Forward-only: a restarted id gets a
/// fresh record instead of revisiting states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Failed,
}

impl StreamState {
    /// Terminal states are eligible for replacement on start and removal on
    /// cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed | Self::Failed)
    }
}

/// Live/recent record for one stream id. Owned exclusively by the registry;
/// everything handed out of the registry is a snapshot clone.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub spec: StreamSpec,
    /// Present only while the process is believed alive.
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub started_at: SystemTime,
    pub state: StreamState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_ids() {
        for id in ["stream", "cam-1", "a.b_c", "S1"] {
            assert!(validate_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for id in ["", "..", ".", "a/b", "a\\b", "../etc", "a b", "a\0b"] {
            assert!(validate_id(id).is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn rejects_oversized_id() {
        let id = "x".repeat(MAX_ID_LEN + 1);
        assert!(validate_id(&id).is_err());
    }

    #[test]
    fn spec_requires_endpoints() {
        let mut spec = StreamSpec {
            id: "s1".into(),
            source: "http://in/a.m3u8".into(),
            destination: "rtmp://out/app".into(),
            overlay_image: None,
            extra_args: Vec::new(),
        };
        assert!(spec.validate().is_ok());

        spec.source.clear();
        assert!(spec.validate().is_err());
    }
}
