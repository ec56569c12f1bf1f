//! Identity assignment: a small SORT-style tracker.
//!
//! Each live identity carries a constant-velocity Kalman filter over its box
//! centre. Every frame the filters are advanced, detections are greedily
//! matched to predicted boxes by IoU, unmatched detections get fresh ids, and
//! identities unmatched for more than `max_missed` frames are retired.

use anyhow::Result;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use tracing::trace;

use crate::detection::{BBox, Detection, DetectionSource, TrackId, VehicleBox, VehicleDetector};
use crate::video::RgbFrame;

/// Process noise of the constant-velocity model.
const PROCESS_NOISE: f32 = 4.0;
/// Detector measurement noise.
const MEASUREMENT_NOISE: f32 = 16.0;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_MISSED: u32 = 5;

/// A minimal 2D constant-velocity Kalman filter over (cx, cy).
struct Kalman2D {
    /// State: [cx, cy, vx, vy]
    x: Vector4<f32>,
    p: Matrix4<f32>,
    f: Matrix4<f32>,
    h: Matrix2x4<f32>,
    q: Matrix4<f32>,
    r: Matrix2<f32>,
}

impl Kalman2D {
    fn new(cx: f32, cy: f32) -> Self {
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        );
        Self {
            x: Vector4::new(cx, cy, 0.0, 0.0),
            p: Matrix4::identity() * 100.0,
            f,
            h: Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            q: Matrix4::identity() * PROCESS_NOISE,
            r: Matrix2::identity() * MEASUREMENT_NOISE,
        }
    }

    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    fn update(&mut self, cx: f32, cy: f32) {
        let z = Vector2::new(cx, cy);
        let y = z - self.h * self.x;
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }
}

struct Identity {
    id: TrackId,
    kalman: Kalman2D,
    last_box: BBox,
    missed: u32,
}

impl Identity {
    /// Last observed box size centred on the predicted position.
    fn predicted_box(&self) -> BBox {
        let half_w = self.last_box.width() / 2.0;
        let half_h = self.last_box.height() / 2.0;
        let (cx, cy) = (self.kalman.x[0], self.kalman.x[1]);
        BBox::new(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
    }
}

/// Assigns persistent ids to per-frame vehicle boxes.
pub struct IdentityTracker {
    live: Vec<Identity>,
    next_id: u64,
    iou_threshold: f32,
    max_missed: u32,
}

impl IdentityTracker {
    pub fn new(iou_threshold: f32, max_missed: u32) -> Self {
        Self {
            live: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_missed,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Match `boxes` against the live identities and return them tagged.
    pub fn update(&mut self, boxes: &[VehicleBox]) -> Vec<Detection> {
        for identity in &mut self.live {
            identity.kalman.predict();
        }

        // Greedy association, best IoU first.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, identity) in self.live.iter().enumerate() {
            let predicted = identity.predicted_box();
            for (di, b) in boxes.iter().enumerate() {
                let iou = predicted.iou(&b.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<TrackId>> = vec![None; boxes.len()];
        let mut matched = vec![false; self.live.len()];
        for (_, ti, di) in pairs {
            if matched[ti] || assigned[di].is_some() {
                continue;
            }
            matched[ti] = true;
            let identity = &mut self.live[ti];
            let bbox = boxes[di].bbox;
            identity.kalman.update(bbox.center_x(), bbox.center_y());
            identity.last_box = bbox;
            identity.missed = 0;
            assigned[di] = Some(identity.id);
        }

        for (identity, hit) in self.live.iter_mut().zip(&matched) {
            if !hit {
                identity.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.live.retain(|i| i.missed <= max_missed);

        for (slot, b) in assigned.iter_mut().zip(boxes) {
            if slot.is_none() {
                let id = TrackId(self.next_id);
                self.next_id += 1;
                self.live.push(Identity {
                    id,
                    kalman: Kalman2D::new(b.bbox.center_x(), b.bbox.center_y()),
                    last_box: b.bbox,
                    missed: 0,
                });
                trace!(track_id = %id, "new identity");
                *slot = Some(id);
            }
        }

        boxes
            .iter()
            .zip(assigned)
            .map(|(b, track_id)| Detection {
                class_id: b.class_id,
                bbox: b.bbox,
                track_id,
            })
            .collect()
    }
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_MISSED)
    }
}

/// Detector plus identity tracker: the production [`DetectionSource`].
pub struct TrackedDetector {
    detector: Box<dyn VehicleDetector>,
    tracker: IdentityTracker,
}

impl TrackedDetector {
    pub fn new(detector: Box<dyn VehicleDetector>, tracker: IdentityTracker) -> Self {
        Self { detector, tracker }
    }
}

impl DetectionSource for TrackedDetector {
    fn detections(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        let boxes = self.detector.detect(frame)?;
        Ok(self.tracker.update(&boxes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(x: f32) -> VehicleBox {
        VehicleBox {
            class_id: 2,
            bbox: BBox::new(x, 0.0, x + 40.0, 20.0),
        }
    }

    #[test]
    fn moving_box_keeps_its_id() {
        let mut tracker = IdentityTracker::default();
        let first = tracker.update(&[car(0.0)])[0].track_id;
        for step in 1..20 {
            let out = tracker.update(&[car(step as f32 * 3.0)]);
            assert_eq!(out[0].track_id, first, "step {step}");
        }
        assert_eq!(tracker.live_count(), 1);
    }

    #[test]
    fn separate_boxes_get_separate_ids() {
        let mut tracker = IdentityTracker::default();
        let out = tracker.update(&[car(0.0), car(500.0)]);
        assert_ne!(out[0].track_id, out[1].track_id);
        assert!(out.iter().all(|d| d.track_id.is_some()));
    }

    #[test]
    fn identity_retires_after_max_missed() {
        let mut tracker = IdentityTracker::new(0.3, 2);
        let first = tracker.update(&[car(0.0)])[0].track_id;
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.live_count(), 1);
        tracker.update(&[]);
        assert_eq!(tracker.live_count(), 0);
        let again = tracker.update(&[car(0.0)])[0].track_id;
        assert_ne!(first, again);
    }

    struct Scripted(Vec<Vec<VehicleBox>>);

    impl VehicleDetector for Scripted {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Vec<VehicleBox>> {
            Ok(if self.0.is_empty() { Vec::new() } else { self.0.remove(0) })
        }
    }

    #[test]
    fn tracked_detector_tags_detector_output() {
        let script = Scripted(vec![vec![car(0.0)], vec![car(2.0)]]);
        let mut source = TrackedDetector::new(Box::new(script), IdentityTracker::default());
        let frame = RgbFrame::filled(4, 4, [0, 0, 0], 0);
        let a = source.detections(&frame).unwrap();
        let b = source.detections(&frame).unwrap();
        assert_eq!(a[0].track_id, b[0].track_id);
        assert_eq!(b[0].class_id, 2);
    }
}
