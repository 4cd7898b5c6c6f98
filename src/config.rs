//! Configuration.
//!
//! Loaded from `homewatch.toml` (working directory, optional) with
//! env-var overrides. Env format: `HOMEWATCH__SECTION__KEY` (double
//! underscore separators). Every struct is immutable after load and
//! validated once.

use anyhow::{ensure, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Resolution ceiling, applied orientation-aware (portrait sources
    /// get the transposed ceiling).
    #[serde(default = "default_max_width")]
    pub max_width: i32,
    #[serde(default = "default_max_height")]
    pub max_height: i32,
    /// Hard deadline for the network connectivity probe, capped at 15 s.
    #[serde(default = "default_url_timeout")]
    pub url_timeout_secs: u64,
    /// How long a worker waits on an empty frame channel before it
    /// declares the upstream dead.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// How many device indices the local scan probes.
    #[serde(default = "default_device_scan_limit")]
    pub device_scan_limit: i32,
}

fn default_max_width() -> i32 {
    1280
}
fn default_max_height() -> i32 {
    720
}
fn default_url_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    15
}
fn default_device_scan_limit() -> i32 {
    4
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
            url_timeout_secs: default_url_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            device_scan_limit: default_device_scan_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Directory holding `fire.onnx`, `person.onnx`, `fall.onnx`.
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
    /// Evidence buffer capacity in frames (≈ one minute at 30 fps).
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,
}

fn default_model_dir() -> String {
    "models".to_string()
}
fn default_input_size() -> u32 {
    640
}
fn default_iou() -> f32 {
    0.6
}
fn default_buffer_frames() -> usize {
    1800
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            input_size: default_input_size(),
            iou_threshold: default_iou(),
            buffer_frames: default_buffer_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the date-partitioned recording tree.
    #[serde(default = "default_recording_dir")]
    pub recording_dir: String,
    /// Root for per-episode evidence clips and stills.
    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: String,
    /// JSON file persisting known network video devices.
    #[serde(default = "default_url_store")]
    pub url_store: String,
}

fn default_recording_dir() -> String {
    "recordings".to_string()
}
fn default_evidence_dir() -> String {
    "evidence".to_string()
}
fn default_url_store() -> String {
    "network_devices.json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recording_dir: default_recording_dir(),
            evidence_dir: default_evidence_dir(),
            url_store: default_url_store(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Email recipients for level ≥3 alerts. Empty disables email.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// From address handed to the mail transport.
    #[serde(default)]
    pub sender: Option<String>,
    /// Directory holding `1.mp3`..`4.mp3` cue files.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,
    /// Per-kind dedup window for cue/email delivery.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_audio_dir() -> String {
    "warning_audio".to_string()
}
fn default_cooldown() -> u64 {
    30
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            sender: None,
            audio_dir: default_audio_dir(),
            cooldown_secs: default_cooldown(),
        }
    }
}

/// Load configuration from `homewatch.toml` + environment overrides and
/// validate it.
pub fn load_config() -> Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("homewatch").required(false))
        .add_source(
            config::Environment::with_prefix("HOMEWATCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let cfg: AppConfig = settings.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> Result<()> {
    ensure!(
        cfg.capture.url_timeout_secs > 0 && cfg.capture.url_timeout_secs <= 15,
        "capture.url_timeout_secs must be in 1..=15 (the capture backend's own timeout dominates beyond that)"
    );
    ensure!(cfg.capture.idle_timeout_secs > 0, "capture.idle_timeout_secs must be non-zero");
    ensure!(cfg.detector.buffer_frames > 0, "detector.buffer_frames must be non-zero");
    ensure!(
        cfg.capture.max_width > 0 && cfg.capture.max_height > 0,
        "capture resolution ceiling must be positive"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.capture.max_width, 1280);
        assert_eq!(cfg.detector.buffer_frames, 1800);
    }

    #[test]
    fn oversized_probe_timeout_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.capture.url_timeout_secs = 20;
        assert!(validate(&cfg).is_err());
    }
}
