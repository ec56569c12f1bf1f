//! dispatch: what happens to a windowed track
//!
//! Steps run strictly in order: speed regression, clip encoding, alert,
//! ledger append. The first failure stops the remaining steps and is
//! returned as a [`FinalizationError`]; nothing is retried and no step is
//! rolled back.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::detection::TrackId;
use crate::error::FinalizationError;
use crate::estimation::{SpeedRegressor, WindowedTrack};
use crate::ledger::Ledger;
use crate::notify::Notifier;
use crate::video::{ClipWriter, RgbFrame};

/// Where a run writes its ledger, clips and recording.
#[derive(Debug, Clone)]
pub struct RunLayout {
    dir: PathBuf,
    started: DateTime<Local>,
}

impl RunLayout {
    /// `<footage_dir>/day_YYYY_MM_DD`, named after the start time.
    pub fn new<P: AsRef<Path>>(footage_dir: P, started: DateTime<Local>) -> Self {
        let dir = footage_dir.as_ref().join(started.format("day_%Y_%m_%d").to_string());
        Self { dir, started }
    }

    pub fn create_dir(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(self.started.format("speed_%Hh_%Mm_%Ss.csv").to_string())
    }

    pub fn clip_path(&self, track_id: TrackId) -> PathBuf {
        self.dir.join(format!("vehicle_{track_id}.mp4"))
    }

    pub fn recording_path(&self) -> PathBuf {
        self.dir.join(self.started.format("recording_%H_%M_%S.mp4").to_string())
    }
}

/// One unit of work for the dispatcher: the windowed series plus the frames
/// it spans, or `None` when the frame buffer no longer held all of them.
pub struct FinalizationJob {
    pub windowed: WindowedTrack,
    pub frames: Option<Vec<Arc<RgbFrame>>>,
}

impl FinalizationJob {
    pub fn track_id(&self) -> TrackId {
        self.windowed.track_id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViolationRecord {
    pub track_id: TrackId,
    pub speed_kmh: f64,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Reported(ViolationRecord),
    /// Speed computed but not above the configured limit; no side effects.
    BelowLimit { track_id: TrackId, speed_kmh: f64 },
}

pub struct ViolationDispatcher {
    regressor: Mutex<Box<dyn SpeedRegressor>>,
    clips: Box<dyn ClipWriter>,
    notifier: Box<dyn Notifier>,
    ledger: Ledger,
    layout: RunLayout,
    speed_limit_kmh: Option<f64>,
}

impl ViolationDispatcher {
    pub fn new(
        regressor: Box<dyn SpeedRegressor>,
        clips: Box<dyn ClipWriter>,
        notifier: Box<dyn Notifier>,
        ledger: Ledger,
        layout: RunLayout,
    ) -> Self {
        Self {
            regressor: Mutex::new(regressor),
            clips,
            notifier,
            ledger,
            layout,
            speed_limit_kmh: None,
        }
    }

    /// Only report tracks strictly faster than `limit`.
    pub fn with_speed_limit(mut self, limit: Option<f64>) -> Self {
        self.speed_limit_kmh = limit;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn dispatch(&self, job: FinalizationJob) -> Result<DispatchOutcome, FinalizationError> {
        let FinalizationJob { windowed, frames } = job;
        let track_id = windowed.track_id;

        let speed_kmh = self.estimate(&windowed.inputs)?;
        if let Some(limit) = self.speed_limit_kmh {
            if speed_kmh <= limit {
                debug!(track_id = %track_id, speed_kmh, limit, "below speed limit");
                return Ok(DispatchOutcome::BelowLimit { track_id, speed_kmh });
            }
        }

        let frames = frames.ok_or(FinalizationError::FramesUnavailable {
            first: windowed.first_frame,
            last: windowed.last_frame,
        })?;
        let clip_path = self.layout.clip_path(track_id);
        self.clips
            .write_clip(&clip_path, &frames)
            .map_err(FinalizationError::Clip)?;

        self.notifier
            .notify(&clip_path, speed_kmh, track_id)
            .map_err(FinalizationError::Notification)?;

        self.ledger.append(track_id, speed_kmh)?;

        info!(
            track_id = %track_id,
            speed_kmh,
            frames = frames.len(),
            clip = %clip_path.display(),
            "violation recorded"
        );
        Ok(DispatchOutcome::Reported(ViolationRecord {
            track_id,
            speed_kmh,
            timestamp: Local::now(),
        }))
    }

    fn estimate(&self, inputs: &[f32]) -> Result<f64, FinalizationError> {
        let mut regressor = self.regressor.lock().map_err(|_| {
            FinalizationError::Regression(anyhow::anyhow!("speed regressor lock poisoned"))
        })?;
        regressor
            .predict(inputs)
            .map_err(FinalizationError::Regression)
    }
}
