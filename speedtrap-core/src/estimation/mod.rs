//! estimation: from a finalized track to a speed estimate
//!
//! 1. [`interpolate`] fills missing frame indices linearly so the area series
//!    is dense.
//! 2. [`SpeedWindow`] drops tracks shorter than the window and divides every
//!    area by the calibration constant `max_cbba`.
//! 3. A [`SpeedRegressor`] maps the normalized series to km/h.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

use crate::detection::{TrackId, build_ort_session};
use crate::tracking::{Sample, StaleTrack};

/// Minimum dense samples before a speed estimate is attempted.
pub const DEFAULT_MIN_WINDOW: usize = 60;

// ── Interpolation ────────────────────────────────────────────────────────────

/// Fill every missing frame index between the first and last sample.
///
/// Known samples are kept as they are; each missing index `f` between known
/// neighbours `(x1, v1)` and `(x2, v2)` gets `v1 + (v2 - v1) * (f - x1) / (x2 - x1)`
/// with no bbox. A gap-free input is returned borrowed.
pub fn interpolate(samples: &[Sample]) -> Cow<'_, [Sample]> {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Cow::Borrowed(samples);
    };
    let span = (last.frame_index - first.frame_index + 1) as usize;
    if span <= samples.len() {
        return Cow::Borrowed(samples);
    }

    let mut dense = Vec::with_capacity(span);
    dense.push(*first);
    for pair in samples.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let width = (b.frame_index - a.frame_index) as f64;
        for f in a.frame_index + 1..b.frame_index {
            let fraction = (f - a.frame_index) as f64 / width;
            dense.push(Sample::interpolated(f, a.area + (b.area - a.area) * fraction));
        }
        dense.push(b);
    }
    Cow::Owned(dense)
}

// ── Window / normalization ───────────────────────────────────────────────────

/// A finalized track that passed the window, ready for regression.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedTrack {
    pub track_id: TrackId,
    pub first_frame: u64,
    pub last_frame: u64,
    /// `area / max_cbba` for every dense sample, in frame order.
    pub inputs: Vec<f32>,
    /// How many of the dense samples were interpolated.
    pub interpolated: usize,
}

impl WindowedTrack {
    /// Frames spanned, inclusive of both ends.
    pub fn frame_count(&self) -> usize {
        (self.last_frame - self.first_frame + 1) as usize
    }
}

/// Window gate and normalization policy.
#[derive(Debug, Clone, Copy)]
pub struct SpeedWindow {
    min_window: usize,
    max_cbba: f64,
}

impl SpeedWindow {
    pub fn new(min_window: usize, max_cbba: f64) -> Self {
        Self {
            min_window,
            max_cbba,
        }
    }

    pub fn min_window(&self) -> usize {
        self.min_window
    }

    /// Interpolate `track` and normalize it, or `None` when the dense series
    /// is shorter than the window.
    pub fn prepare(&self, track: &StaleTrack) -> Option<WindowedTrack> {
        let dense = interpolate(track.samples());
        if dense.len() < self.min_window {
            debug!(
                track_id = %track.id(),
                samples = dense.len(),
                min_window = self.min_window,
                "track too short for a speed estimate"
            );
            return None;
        }

        Some(WindowedTrack {
            track_id: track.id(),
            first_frame: track.first_frame(),
            last_frame: track.last_frame(),
            inputs: self.normalize(&dense),
            interpolated: dense.iter().filter(|s| s.is_interpolated()).count(),
        })
    }

    pub fn normalize(&self, dense: &[Sample]) -> Vec<f32> {
        dense
            .iter()
            .map(|s| (s.area / self.max_cbba) as f32)
            .collect()
    }
}

// ── Regression ───────────────────────────────────────────────────────────────

/// Maps a normalized area series to a rounded speed in km/h.
pub trait SpeedRegressor: Send {
    fn predict(&mut self, inputs: &[f32]) -> Result<f64>;
}

/// ONNX speed model taking a `[1, 1, N]` series and producing one scalar.
pub struct OnnxSpeedRegressor {
    session: Session,
    input_name: String,
}

impl OnnxSpeedRegressor {
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = build_ort_session(model_path.as_ref())?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("speed model declares no inputs")?;
        Ok(Self {
            session,
            input_name,
        })
    }
}

impl SpeedRegressor for OnnxSpeedRegressor {
    fn predict(&mut self, inputs: &[f32]) -> Result<f64> {
        if inputs.is_empty() {
            bail!("speed model needs at least one input sample");
        }
        let shape = [1usize, 1, inputs.len()];
        let tensor = Tensor::from_array((shape, inputs.to_vec().into_boxed_slice()))
            .context("failed to create speed model input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .context("speed model inference failed")?;
        let (_, first) = outputs
            .iter()
            .next()
            .context("speed model produced no outputs")?;
        let (_shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract speed model output")?;
        let raw = *data.first().context("speed model output is empty")?;

        if !raw.is_finite() {
            bail!("speed model produced a non-finite value");
        }
        Ok(f64::from(raw).round())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn track(points: &[(u64, f64)]) -> StaleTrack {
        let samples = points
            .iter()
            .map(|&(f, a)| Sample::interpolated(f, a))
            .collect();
        StaleTrack::from_samples(TrackId(1), samples).unwrap()
    }

    fn areas(samples: &[Sample]) -> Vec<f64> {
        samples.iter().map(|s| s.area).collect()
    }

    #[test]
    fn fills_gap_linearly() {
        let t = track(&[(0, 10.0), (1, 10.0), (5, 50.0)]);
        let dense = interpolate(t.samples());
        assert_eq!(areas(&dense), vec![10.0, 10.0, 20.0, 30.0, 40.0, 50.0]);
        let frames: Vec<u64> = dense.iter().map(|s| s.frame_index).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn observed_samples_keep_their_boxes() {
        use crate::detection::BBox;
        let a = Sample::observed(0, BBox::new(0.0, 0.0, 2.0, 5.0));
        let b = Sample::observed(3, BBox::new(0.0, 0.0, 4.0, 5.0));
        let samples = [a, b];
        let dense = interpolate(&samples);
        assert_eq!(dense[0], a);
        assert_eq!(dense[3], b);
        assert!(dense[1].is_interpolated() && dense[2].is_interpolated());
    }

    #[test]
    fn single_missing_frame_is_filled() {
        // Span 3 over 2 samples.
        let t = track(&[(4, 1.0), (6, 3.0)]);
        assert_eq!(areas(&interpolate(t.samples())), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn gap_free_input_is_borrowed_unchanged() {
        let t = track(&[(3, 1.0), (4, 7.0), (5, 2.0)]);
        let out = interpolate(t.samples());
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, t.samples());
    }

    #[test]
    fn window_rejects_59_accepts_60() {
        let window = SpeedWindow::new(60, 1000.0);
        let short: Vec<(u64, f64)> = (0..59).map(|f| (f, 100.0)).collect();
        assert!(window.prepare(&track(&short)).is_none());

        let exact: Vec<(u64, f64)> = (0..60).map(|f| (f, 100.0)).collect();
        let w = window.prepare(&track(&exact)).unwrap();
        assert_eq!(w.inputs.len(), 60);
        assert_eq!(w.frame_count(), 60);
        assert!(w.inputs.iter().all(|&v| (v - 0.1).abs() < 1e-6));
    }

    #[test]
    fn window_counts_interpolated_samples() {
        // Two observations 59 frames apart densify to 60 samples.
        let window = SpeedWindow::new(60, 1000.0);
        let w = window.prepare(&track(&[(0, 100.0), (59, 400.0)])).unwrap();
        assert_eq!(w.inputs.len(), 60);
        assert_eq!(w.interpolated, 58);
        assert!((w.inputs[59] - 0.4).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn output_is_dense_and_keeps_known_samples(
            gaps in proptest::collection::vec(1u64..6, 1..30),
            start in 0u64..100,
        ) {
            let mut frame = start;
            let mut points = vec![(frame, 0.0)];
            for (i, g) in gaps.iter().enumerate() {
                frame += g;
                points.push((frame, (i + 1) as f64 * 3.0));
            }
            let t = track(&points);
            let dense = interpolate(t.samples());

            prop_assert_eq!(dense.len() as u64, frame - start + 1);
            for (i, s) in dense.iter().enumerate() {
                prop_assert_eq!(s.frame_index, start + i as u64);
            }
            for known in t.samples() {
                prop_assert_eq!(dense[(known.frame_index - start) as usize], *known);
            }
        }
    }
}
