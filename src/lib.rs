//! streamctl: supervisor for long-running ffmpeg relay processes.
//!
//! One OS process per logical stream, tracked in a registry that persists
//! pid and log files under a state directory so a restarted supervisor can
//! rediscover its children. Lifecycle control (start, stop, status, list,
//! log tail, cleanup) is exposed over an authenticated HTTP API; a
//! background reaper reconciles registry state against actual process
//! liveness.

pub mod config;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod web;
