//! config: `speedtrap.toml` settings
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! runnable configuration apart from the model paths. Credentials and the
//! recipient list can be supplied through the environment instead of the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::detection::ModelGeneration;
use crate::estimation::DEFAULT_MIN_WINDOW;
use crate::frame_buffer::DEFAULT_CAPACITY;
use crate::pipeline::OverloadPolicy;
use crate::tracking::identity::{DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_MISSED};
use crate::tracking::{DEFAULT_GAP_THRESHOLD, DEFAULT_MAX_ACTIVE_TRACKS};

pub const DEFAULT_CONFIG_PATH: &str = "speedtrap.toml";

pub const ENV_SMTP_USERNAME: &str = "SPEEDTRAP_SMTP_USERNAME";
pub const ENV_SMTP_PASSWORD: &str = "SPEEDTRAP_SMTP_PASSWORD";
pub const ENV_EMAIL_FROM: &str = "SPEEDTRAP_EMAIL_FROM";
/// Comma-separated recipient list.
pub const ENV_EMAIL_TO: &str = "SPEEDTRAP_EMAIL_TO";
pub const ENV_SPEED_LIMIT: &str = "SPEEDTRAP_SPEED_LIMIT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub estimator: EstimatorSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub pipeline: PipelineSettings,
    pub output: OutputSettings,
    pub email: EmailSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSettings {
    /// ONNX speed regression model.
    pub model_path: PathBuf,
    /// Calibrated maximum box area; areas are divided by this.
    pub max_cbba: f64,
    /// Report only tracks strictly faster than this. Unset reports every track.
    pub speed_limit_kmh: Option<f64>,
    pub gap_threshold: u64,
    pub min_window: usize,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/speed_estimator.onnx"),
            max_cbba: 1.0,
            speed_limit_kmh: None,
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            min_window: DEFAULT_MIN_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub model_path: PathBuf,
    pub generation: ModelGeneration,
    pub confidence_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov8n.onnx"),
            generation: ModelGeneration::V8,
            confidence_threshold: 0.45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub iou_threshold: f32,
    pub max_missed: u32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Dispatch worker threads; 0 dispatches inline on the ingestion thread.
    pub workers: usize,
    pub queue_capacity: usize,
    pub overload: OverloadPolicy,
    pub frame_buffer_capacity: usize,
    pub max_active_tracks: usize,
    /// Finalize tracks still pending when the source ends.
    pub flush_pending: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 16,
            overload: OverloadPolicy::Block,
            frame_buffer_capacity: DEFAULT_CAPACITY,
            max_active_tracks: DEFAULT_MAX_ACTIVE_TRACKS,
            flush_pending: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Root of the per-day run directories.
    pub footage_dir: PathBuf,
    /// Directory of the daily operational error logs.
    pub log_dir: PathBuf,
    /// Also encode the whole input into the run directory.
    pub record: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            footage_dir: PathBuf::from("footages"),
            log_dir: PathBuf::from("logs"),
            record: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailTlsMode {
    None,
    #[default]
    StartTls,
    Tls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub tls: EmailTlsMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject_prefix: String,
    pub timeout_secs: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "smtp.gmail.com".into(),
            smtp_port: 587,
            tls: EmailTlsMode::StartTls,
            username: None,
            password: None,
            from: String::new(),
            to: Vec::new(),
            subject_prefix: String::new(),
            timeout_secs: 30,
        }
    }
}

impl EmailSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        ensure!(!self.smtp_host.is_empty(), "email.smtp_host must be set");
        ensure!(self.smtp_port != 0, "email.smtp_port must be non-zero");
        ensure!(looks_like_email(&self.from), "email.from is not an address: {:?}", self.from);
        ensure!(!self.to.is_empty(), "email.to needs at least one recipient");
        for addr in &self.to {
            ensure!(looks_like_email(addr), "email.to entry is not an address: {addr:?}");
        }
        ensure!(
            self.username.is_some() == self.password.is_some(),
            "email.username and email.password must be set together"
        );
        ensure!(self.timeout_secs > 0, "email.timeout_secs must be positive");
        Ok(())
    }
}

fn looks_like_email(addr: &str) -> bool {
    match addr.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.ends_with('.'),
        None => false,
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup(ENV_SMTP_USERNAME) {
            self.email.username = Some(user);
        }
        if let Some(pass) = lookup(ENV_SMTP_PASSWORD) {
            self.email.password = Some(pass);
        }
        if let Some(from) = lookup(ENV_EMAIL_FROM) {
            self.email.from = from;
        }
        if let Some(to) = lookup(ENV_EMAIL_TO) {
            self.email.to = to
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(limit) = lookup(ENV_SPEED_LIMIT) {
            let limit: f64 = limit
                .trim()
                .parse()
                .with_context(|| format!("{ENV_SPEED_LIMIT} is not a number: {limit:?}"))?;
            self.estimator.speed_limit_kmh = Some(limit);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let est = &self.estimator;
        ensure!(
            est.max_cbba.is_finite() && est.max_cbba > 0.0,
            "estimator.max_cbba must be positive, got {}",
            est.max_cbba
        );
        ensure!(est.gap_threshold > 0, "estimator.gap_threshold must be positive");
        ensure!(est.min_window > 0, "estimator.min_window must be positive");
        if let Some(limit) = est.speed_limit_kmh {
            ensure!(limit.is_finite() && limit >= 0.0, "estimator.speed_limit_kmh must be >= 0");
        }

        let det = &self.detector;
        ensure!(
            (0.0..=1.0).contains(&det.confidence_threshold),
            "detector.confidence_threshold must be within 0..=1"
        );
        ensure!(
            (0.0..=1.0).contains(&self.tracker.iou_threshold),
            "tracker.iou_threshold must be within 0..=1"
        );

        let pipe = &self.pipeline;
        // A track leaves the table gap_threshold frames after its last sample,
        // and its whole span must still be buffered at that point.
        let needed = est.min_window as u64 + est.gap_threshold;
        if (pipe.frame_buffer_capacity as u64) < needed {
            bail!(
                "pipeline.frame_buffer_capacity ({}) must hold estimator.min_window + estimator.gap_threshold ({}) frames",
                pipe.frame_buffer_capacity,
                needed
            );
        }
        ensure!(pipe.max_active_tracks > 0, "pipeline.max_active_tracks must be positive");
        if pipe.workers > 0 {
            ensure!(pipe.queue_capacity > 0, "pipeline.queue_capacity must be positive with workers");
        }

        self.email.validate()
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.email.password.is_some() {
            copy.email.password = Some("********".into());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.estimator.gap_threshold, 10);
        assert_eq!(s.estimator.min_window, 60);
        assert_eq!(s.pipeline.overload, OverloadPolicy::Block);
        assert!(!s.email.enabled);
        s.validate().unwrap();
    }

    #[test]
    fn shipped_file_matches_defaults() {
        let s = Settings::from_toml(include_str!("../../../speedtrap.toml")).unwrap();
        let d = Settings::default();
        assert_eq!(s.estimator.gap_threshold, d.estimator.gap_threshold);
        assert_eq!(s.pipeline.frame_buffer_capacity, d.pipeline.frame_buffer_capacity);
        assert_eq!(s.email.tls, EmailTlsMode::StartTls);
        s.validate().unwrap();
    }

    #[test]
    fn parses_sections() {
        let s = Settings::from_toml(
            r#"
            [estimator]
            max_cbba = 1000.0
            speed_limit_kmh = 60

            [detector]
            generation = "v5"

            [pipeline]
            workers = 0
            overload = "drop"
            "#,
        )
        .unwrap();
        assert_eq!(s.estimator.max_cbba, 1000.0);
        assert_eq!(s.estimator.speed_limit_kmh, Some(60.0));
        assert_eq!(s.detector.generation, ModelGeneration::V5);
        assert_eq!(s.pipeline.overload, OverloadPolicy::Drop);
        assert_eq!(s.pipeline.workers, 0);
    }

    #[test]
    fn env_overrides_credentials_and_recipients() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SMTP_USERNAME, "cam"),
            (ENV_SMTP_PASSWORD, "hunter2"),
            (ENV_EMAIL_TO, "a@x.org, b@y.org,"),
            (ENV_SPEED_LIMIT, "80"),
        ]);
        let mut s = Settings::default();
        s.apply_env_from(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.email.username.as_deref(), Some("cam"));
        assert_eq!(s.email.to, vec!["a@x.org", "b@y.org"]);
        assert_eq!(s.estimator.speed_limit_kmh, Some(80.0));
        assert_eq!(s.redacted().email.password.as_deref(), Some("********"));
    }

    #[test]
    fn bad_speed_limit_env_is_rejected() {
        let mut s = Settings::default();
        let err = s
            .apply_env_from(|k| (k == ENV_SPEED_LIMIT).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_SPEED_LIMIT));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut s = Settings::default();
        s.estimator.max_cbba = 0.0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.pipeline.frame_buffer_capacity = 10;
        assert!(s.validate().unwrap_err().to_string().contains("frame_buffer_capacity"));

        // Exactly one window is not enough: the span is read gap frames later.
        let mut s = Settings::default();
        s.pipeline.frame_buffer_capacity = s.estimator.min_window;
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("min_window + estimator.gap_threshold (70)"), "{err}");

        s.pipeline.frame_buffer_capacity = 70;
        s.validate().unwrap();
    }

    #[test]
    fn enabled_email_requires_addresses() {
        let mut s = Settings::default();
        s.email.enabled = true;
        assert!(s.validate().is_err());

        s.email.from = "cam@example.com".into();
        s.email.to = vec!["ops@example.com".into()];
        s.validate().unwrap();

        s.email.username = Some("cam".into());
        assert!(s.validate().unwrap_err().to_string().contains("together"));
    }
}
