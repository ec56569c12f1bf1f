//! pipeline: per-frame driver owning the track table and frame buffer
//!
//! [`SpeedPipeline::process_frame`] is called once per decoded frame from a
//! single thread. Evicted tracks are interpolated and windowed on that thread;
//! only windowed tracks reach the [`ViolationDispatcher`], either inline or
//! through a bounded queue served by worker threads.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::detection::{Detection, TrackId};
use crate::dispatch::{DispatchOutcome, FinalizationJob, ViolationDispatcher};
use crate::error::FinalizationError;
use crate::estimation::SpeedWindow;
use crate::frame_buffer::FrameBuffer;
use crate::tracking::{StaleTrack, TrackHistory};
use crate::video::RgbFrame;

const TIMING_INTERVAL: u64 = 300;

/// What ingestion does when every dispatch worker is busy and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverloadPolicy {
    /// Wait for queue space.
    #[default]
    Block,
    /// Drop the job and log its track id.
    Drop,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub gap_threshold: u64,
    pub max_active_tracks: usize,
    pub min_window: usize,
    pub max_cbba: f64,
    pub frame_buffer_capacity: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overload: OverloadPolicy,
}

impl From<&Settings> for PipelineOptions {
    fn from(s: &Settings) -> Self {
        Self {
            gap_threshold: s.estimator.gap_threshold,
            max_active_tracks: s.pipeline.max_active_tracks,
            min_window: s.estimator.min_window,
            max_cbba: s.estimator.max_cbba,
            frame_buffer_capacity: s.pipeline.frame_buffer_capacity,
            workers: s.pipeline.workers,
            queue_capacity: s.pipeline.queue_capacity,
            overload: s.pipeline.overload,
        }
    }
}

/// Dispatch counters shared with the worker threads.
#[derive(Debug, Default)]
struct DispatchStats {
    dispatched: AtomicU64,
    below_limit: AtomicU64,
    failed: AtomicU64,
    dropped_overload: AtomicU64,
}

impl DispatchStats {
    fn record(&self, track_id: TrackId, result: Result<DispatchOutcome, FinalizationError>) {
        match result {
            Ok(DispatchOutcome::Reported(_)) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Ok(DispatchOutcome::BelowLimit { .. }) => {
                self.below_limit.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    track_id = %track_id,
                    kind = %e.kind(),
                    error = %e,
                    "track finalization failed"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub frames: u64,
    pub finalized: u64,
    pub dropped_short: u64,
    pub below_limit: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub dropped_overload: u64,
    /// Tracks still active at shutdown and not flushed.
    pub pending_discarded: u64,
}

enum Finalizer {
    Inline(Arc<ViolationDispatcher>),
    Pool {
        tx: Sender<FinalizationJob>,
        workers: Vec<JoinHandle<()>>,
        overload: OverloadPolicy,
    },
}

impl Finalizer {
    fn submit(&self, job: FinalizationJob, stats: &DispatchStats) {
        let track_id = job.track_id();
        match self {
            Self::Inline(dispatcher) => stats.record(track_id, dispatcher.dispatch(job)),
            Self::Pool { tx, overload, .. } => {
                let sent = match overload {
                    OverloadPolicy::Block => tx.send(job).map_err(|_| "workers gone"),
                    OverloadPolicy::Drop => tx.try_send(job).map_err(|e| match e {
                        TrySendError::Full(_) => "queue full",
                        TrySendError::Disconnected(_) => "workers gone",
                    }),
                };
                if let Err(reason) = sent {
                    stats.dropped_overload.fetch_add(1, Ordering::Relaxed);
                    warn!(track_id = %track_id, reason, "finalization job dropped");
                }
            }
        }
    }

    /// Close the queue and wait for in-flight jobs.
    fn shutdown(self) {
        if let Self::Pool { tx, workers, .. } = self {
            drop(tx);
            for handle in workers {
                if handle.join().is_err() {
                    error!("dispatch worker panicked");
                }
            }
        }
    }
}

fn spawn_workers(
    count: usize,
    rx: Receiver<FinalizationJob>,
    dispatcher: &Arc<ViolationDispatcher>,
    stats: &Arc<DispatchStats>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|i| {
            let rx = rx.clone();
            let dispatcher = Arc::clone(dispatcher);
            let stats = Arc::clone(stats);
            std::thread::Builder::new()
                .name(format!("dispatch-{i}"))
                .spawn(move || {
                    for job in rx.iter() {
                        let track_id = job.track_id();
                        stats.record(track_id, dispatcher.dispatch(job));
                    }
                })
                .context("failed to spawn dispatch worker")
        })
        .collect()
}

pub struct SpeedPipeline {
    history: TrackHistory,
    frames: FrameBuffer,
    window: SpeedWindow,
    dispatcher: Arc<ViolationDispatcher>,
    finalizer: Finalizer,
    stats: Arc<DispatchStats>,
    finalized: u64,
    dropped_short: u64,
    prof_ingest: Duration,
    prof_finalize: Duration,
}

impl SpeedPipeline {
    pub fn new(options: PipelineOptions, dispatcher: ViolationDispatcher) -> Result<Self> {
        let dispatcher = Arc::new(dispatcher);
        let stats = Arc::new(DispatchStats::default());
        let finalizer = if options.workers == 0 {
            Finalizer::Inline(Arc::clone(&dispatcher))
        } else {
            let (tx, rx) = channel::bounded(options.queue_capacity.max(1));
            let workers = spawn_workers(options.workers, rx, &dispatcher, &stats)?;
            info!(
                workers = options.workers,
                queue_capacity = options.queue_capacity,
                overload = ?options.overload,
                "dispatch pool started"
            );
            Finalizer::Pool {
                tx,
                workers,
                overload: options.overload,
            }
        };

        Ok(Self {
            history: TrackHistory::new(options.gap_threshold, options.max_active_tracks),
            frames: FrameBuffer::new(options.frame_buffer_capacity),
            window: SpeedWindow::new(options.min_window, options.max_cbba),
            dispatcher,
            finalizer,
            stats,
            finalized: 0,
            dropped_short: 0,
            prof_ingest: Duration::ZERO,
            prof_finalize: Duration::ZERO,
        })
    }

    /// Index the next frame will receive; equals the number of frames seen.
    pub fn frame_index(&self) -> u64 {
        self.frames.next_index()
    }

    pub fn active_tracks(&self) -> usize {
        self.history.len()
    }

    pub fn dispatcher(&self) -> &ViolationDispatcher {
        &self.dispatcher
    }

    /// Buffer `frame`, ingest its detections and finalize every track that
    /// went stale on this frame.
    pub fn process_frame(&mut self, frame: RgbFrame, detections: &[Detection]) {
        let ingest_start = Instant::now();
        let frame_index = self.frames.push(frame);
        let summary = self.history.ingest(detections, frame_index);
        if summary.rejected > 0 {
            debug!(frame_index, rejected = summary.rejected, "track table full");
        }
        let observed: HashSet<TrackId> = detections.iter().filter_map(|d| d.track_id).collect();
        let stale = self.history.evict_stale(frame_index, &observed);
        self.prof_ingest += ingest_start.elapsed();

        let finalize_start = Instant::now();
        for track in stale {
            self.finalize(track);
        }
        self.prof_finalize += finalize_start.elapsed();

        let frames = frame_index + 1;
        if frames % TIMING_INTERVAL == 0 {
            info!(
                frames,
                active_tracks = self.history.len(),
                ingest_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_ingest.as_secs_f64() * 1000.0 / frames as f64
                ),
                finalize_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_finalize.as_secs_f64() * 1000.0 / frames as f64
                ),
                "pipeline timings"
            );
        }
    }

    fn finalize(&mut self, track: StaleTrack) {
        self.finalized += 1;
        let Some(windowed) = self.window.prepare(&track) else {
            self.dropped_short += 1;
            return;
        };
        let frames = self.frames.range(windowed.first_frame, windowed.last_frame);
        if frames.is_none() {
            debug!(
                track_id = %windowed.track_id,
                first = windowed.first_frame,
                oldest = ?self.frames.oldest_index(),
                "track span no longer buffered"
            );
        }
        self.finalizer
            .submit(FinalizationJob { windowed, frames }, &self.stats);
    }

    /// Stop ingesting: optionally finalize pending tracks, drain the workers
    /// and sync the ledger.
    pub fn finish(mut self, flush_pending: bool) -> Result<PipelineSummary> {
        let pending = self.history.drain();
        let pending_discarded = if flush_pending {
            let count = pending.len();
            for track in pending {
                self.finalize(track);
            }
            info!(count, "flushed pending tracks");
            0
        } else {
            pending.len() as u64
        };

        let frames = self.frames.next_index();
        self.finalizer.shutdown();
        self.dispatcher
            .ledger()
            .sync()
            .context("failed to sync ledger")?;

        let stats = &self.stats;
        let summary = PipelineSummary {
            frames,
            finalized: self.finalized,
            dropped_short: self.dropped_short,
            below_limit: stats.below_limit.load(Ordering::Relaxed),
            dispatched: stats.dispatched.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            dropped_overload: stats.dropped_overload.load(Ordering::Relaxed),
            pending_discarded,
        };
        info!(?summary, "pipeline finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::dispatch::RunLayout;
    use crate::estimation::SpeedRegressor;
    use crate::ledger::Ledger;
    use crate::notify::LogNotifier;
    use crate::video::ClipWriter;
    use chrono::Local;
    use std::path::Path;

    struct Fixed;

    impl SpeedRegressor for Fixed {
        fn predict(&mut self, _inputs: &[f32]) -> Result<f64> {
            Ok(80.0)
        }
    }

    struct NoClip;

    impl ClipWriter for NoClip {
        fn write_clip(&self, _path: &Path, _frames: &[Arc<RgbFrame>]) -> Result<()> {
            Ok(())
        }
    }

    fn options(min_window: usize, capacity: usize) -> PipelineOptions {
        PipelineOptions {
            gap_threshold: 3,
            max_active_tracks: 8,
            min_window,
            max_cbba: 100.0,
            frame_buffer_capacity: capacity,
            workers: 0,
            queue_capacity: 1,
            overload: OverloadPolicy::Block,
        }
    }

    fn pipeline(dir: &Path, opts: PipelineOptions) -> SpeedPipeline {
        let layout = RunLayout::new(dir, Local::now());
        let ledger = Ledger::create(layout.ledger_path()).unwrap();
        let dispatcher = ViolationDispatcher::new(
            Box::new(Fixed),
            Box::new(NoClip),
            Box::new(LogNotifier),
            ledger,
            layout,
        );
        SpeedPipeline::new(opts, dispatcher).unwrap()
    }

    fn seen(id: u64) -> Vec<Detection> {
        vec![Detection {
            class_id: 2,
            bbox: BBox::new(0.0, 0.0, 5.0, 5.0),
            track_id: Some(TrackId(id)),
        }]
    }

    fn blank() -> RgbFrame {
        RgbFrame::filled(1, 1, [0, 0, 0], 0)
    }

    #[test]
    fn frame_index_advances_once_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), options(2, 16));
        for _ in 0..4 {
            p.process_frame(blank(), &seen(1));
        }
        assert_eq!(p.frame_index(), 4);
        assert_eq!(p.active_tracks(), 1);
    }

    #[test]
    fn short_track_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), options(5, 16));
        p.process_frame(blank(), &seen(1));
        for _ in 0..3 {
            p.process_frame(blank(), &[]);
        }
        let summary = p.finish(false).unwrap();
        assert_eq!(summary.finalized, 1);
        assert_eq!(summary.dropped_short, 1);
        assert_eq!(summary.dispatched, 0);
    }

    #[test]
    fn evicted_span_outside_ring_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), options(2, 2));
        p.process_frame(blank(), &seen(1));
        p.process_frame(blank(), &seen(1));
        for _ in 0..3 {
            p.process_frame(blank(), &[]);
        }
        let summary = p.finish(false).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.dispatched, 0);
    }

    #[test]
    fn pending_tracks_flush_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), options(2, 16));
        p.process_frame(blank(), &seen(1));
        p.process_frame(blank(), &seen(1));
        let summary = p.finish(true).unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.pending_discarded, 0);

        let mut p = pipeline(dir.path(), options(2, 16));
        p.process_frame(blank(), &seen(1));
        p.process_frame(blank(), &seen(1));
        let summary = p.finish(false).unwrap();
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.pending_discarded, 1);
    }
}
