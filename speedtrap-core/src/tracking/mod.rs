//! tracking: per-vehicle sample history and stale-track eviction
//!
//! Every identity-tagged detection becomes a [`Sample`] appended to its
//! [`Track`]. A track that has not been observed for `gap_threshold` frames is
//! removed from the table and handed back to the caller as a [`StaleTrack`],
//! which offers no mutation: from then on the history is frozen.
//!
//! Lifecycle: NEW → ACTIVE (in the table) → STALE ([`StaleTrack`]) →
//! FINALIZING (owned by dispatch) → REMOVED (dropped). A track id seen again
//! after eviction starts a brand-new track.

pub mod identity;

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::detection::{BBox, Detection, TrackId};

pub use identity::{IdentityTracker, TrackedDetector};

/// Frames a track may go unobserved before it is finalized.
pub const DEFAULT_GAP_THRESHOLD: u64 = 10;
/// Upper bound on concurrently active tracks.
pub const DEFAULT_MAX_ACTIVE_TRACKS: usize = 256;

/// One observation (or interpolated point) of a track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub frame_index: u64,
    pub area: f64,
    /// `None` marks an interpolated sample.
    pub bbox: Option<BBox>,
}

impl Sample {
    pub fn observed(frame_index: u64, bbox: BBox) -> Self {
        Self {
            frame_index,
            area: bbox.area(),
            bbox: Some(bbox),
        }
    }

    pub fn interpolated(frame_index: u64, area: f64) -> Self {
        Self {
            frame_index,
            area,
            bbox: None,
        }
    }

    pub fn is_interpolated(&self) -> bool {
        self.bbox.is_none()
    }
}

/// An active track, owned by [`TrackHistory`].
#[derive(Debug, Clone)]
pub struct Track {
    id: TrackId,
    samples: Vec<Sample>,
}

impl Track {
    fn new(id: TrackId, first: Sample) -> Self {
        Self {
            id,
            samples: vec![first],
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last_frame(&self) -> u64 {
        // A track is never created empty.
        self.samples.last().map_or(0, |s| s.frame_index)
    }
}

/// A track evicted from the table. Read-only from here on.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleTrack {
    id: TrackId,
    samples: Vec<Sample>,
}

impl StaleTrack {
    /// Build a finalized history directly, e.g. from a replayed log.
    /// Samples must be strictly increasing by frame index.
    pub fn from_samples(id: TrackId, samples: Vec<Sample>) -> Option<Self> {
        let ordered = samples
            .windows(2)
            .all(|w| w[0].frame_index < w[1].frame_index);
        (!samples.is_empty() && ordered).then_some(Self { id, samples })
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn first_frame(&self) -> u64 {
        self.samples[0].frame_index
    }

    pub fn last_frame(&self) -> u64 {
        self.samples[self.samples.len() - 1].frame_index
    }
}

impl From<Track> for StaleTrack {
    fn from(track: Track) -> Self {
        Self {
            id: track.id,
            samples: track.samples,
        }
    }
}

/// What one call to [`TrackHistory::ingest`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub created: usize,
    pub appended: usize,
    /// Detections without a track id, or repeated ids within the frame.
    pub skipped: usize,
    /// New ids refused because the table was full.
    pub rejected: usize,
}

/// Track table: track id → sample history.
pub struct TrackHistory {
    tracks: HashMap<TrackId, Track>,
    gap_threshold: u64,
    max_active_tracks: usize,
}

impl TrackHistory {
    pub fn new(gap_threshold: u64, max_active_tracks: usize) -> Self {
        Self {
            tracks: HashMap::new(),
            gap_threshold: gap_threshold.max(1),
            max_active_tracks,
        }
    }

    pub fn gap_threshold(&self) -> u64 {
        self.gap_threshold
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Append one sample per identified detection, creating tracks for unseen
    /// ids. Only the first detection of an id counts within a frame.
    pub fn ingest(&mut self, detections: &[Detection], frame_index: u64) -> IngestSummary {
        let mut summary = IngestSummary::default();

        for det in detections {
            let Some(id) = det.track_id else {
                summary.skipped += 1;
                continue;
            };
            let sample = Sample::observed(frame_index, det.bbox);

            if let Some(track) = self.tracks.get_mut(&id) {
                if track.last_frame() >= frame_index {
                    summary.skipped += 1;
                } else {
                    track.samples.push(sample);
                    summary.appended += 1;
                }
                continue;
            }

            if self.tracks.len() >= self.max_active_tracks {
                warn!(
                    track_id = %id,
                    frame_index,
                    limit = self.max_active_tracks,
                    "track table full, ignoring new track"
                );
                summary.rejected += 1;
                continue;
            }

            self.tracks.insert(id, Track::new(id, sample));
            summary.created += 1;
        }

        summary
    }

    /// Remove and return every track that is not in `observed` and whose last
    /// sample is at least `gap_threshold` frames behind `frame_index`.
    pub fn evict_stale(&mut self, frame_index: u64, observed: &HashSet<TrackId>) -> Vec<StaleTrack> {
        let gap = self.gap_threshold;
        let mut stale: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| !observed.contains(&t.id))
            .filter(|t| frame_index.saturating_sub(t.last_frame()) >= gap)
            .map(|t| t.id)
            .collect();
        stale.sort_unstable();

        stale
            .into_iter()
            .filter_map(|id| self.tracks.remove(&id))
            .map(|track| {
                debug!(
                    track_id = %track.id,
                    samples = track.samples.len(),
                    last_frame = track.last_frame(),
                    frame_index,
                    "track went stale"
                );
                StaleTrack::from(track)
            })
            .collect()
    }

    /// Remove every remaining track regardless of age (end of stream).
    pub fn drain(&mut self) -> Vec<StaleTrack> {
        let mut all: Vec<StaleTrack> = self.tracks.drain().map(|(_, t)| t.into()).collect();
        all.sort_unstable_by_key(|t| t.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn det(id: u64, w: f32) -> Detection {
        Detection {
            class_id: 2,
            bbox: BBox::new(0.0, 0.0, w, 10.0),
            track_id: Some(TrackId(id)),
        }
    }

    fn observed(ids: &[u64]) -> HashSet<TrackId> {
        ids.iter().map(|&i| TrackId(i)).collect()
    }

    #[test]
    fn unseen_id_creates_one_track_with_one_sample() {
        let mut h = TrackHistory::new(10, 16);
        let s = h.ingest(&[det(7, 5.0)], 0);
        assert_eq!(s.created, 1);
        assert_eq!(h.len(), 1);
        let t = h.get(TrackId(7)).unwrap();
        assert_eq!(t.samples().len(), 1);
        assert_eq!(t.samples()[0].area, 50.0);
    }

    #[test]
    fn repeat_id_appends_instead_of_duplicating() {
        let mut h = TrackHistory::new(10, 16);
        h.ingest(&[det(7, 5.0)], 0);
        let s = h.ingest(&[det(7, 6.0)], 1);
        assert_eq!(s.appended, 1);
        assert_eq!(s.created, 0);
        assert_eq!(h.len(), 1);
        assert_eq!(h.get(TrackId(7)).unwrap().samples().len(), 2);
    }

    #[test]
    fn duplicate_id_in_one_frame_is_skipped() {
        let mut h = TrackHistory::new(10, 16);
        let s = h.ingest(&[det(1, 5.0), det(1, 8.0)], 3);
        assert_eq!((s.created, s.skipped), (1, 1));
        assert_eq!(h.get(TrackId(1)).unwrap().samples()[0].area, 50.0);
    }

    #[test]
    fn untracked_detections_are_ignored() {
        let mut h = TrackHistory::new(10, 16);
        let mut d = det(1, 5.0);
        d.track_id = None;
        assert_eq!(h.ingest(&[d], 0).skipped, 1);
        assert!(h.is_empty());
    }

    #[test]
    fn full_table_rejects_new_ids_only() {
        let mut h = TrackHistory::new(10, 1);
        h.ingest(&[det(1, 5.0)], 0);
        let s = h.ingest(&[det(1, 5.0), det(2, 5.0)], 1);
        assert_eq!((s.appended, s.rejected), (1, 1));
        assert!(h.get(TrackId(2)).is_none());
    }

    #[test]
    fn eviction_happens_exactly_at_threshold() {
        let mut h = TrackHistory::new(10, 16);
        h.ingest(&[det(3, 5.0)], 0);

        // Absent for GAP_THRESHOLD - 1 frames: still pending.
        for f in 1..10 {
            assert!(h.evict_stale(f, &observed(&[])).is_empty(), "frame {f}");
        }
        assert_eq!(h.len(), 1);

        let evicted = h.evict_stale(10, &observed(&[]));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), TrackId(3));
        assert!(h.is_empty());
        assert!(h.evict_stale(11, &observed(&[])).is_empty());
    }

    #[test]
    fn observed_tracks_are_never_evicted() {
        let mut h = TrackHistory::new(2, 16);
        h.ingest(&[det(1, 5.0)], 0);
        assert!(h.evict_stale(50, &observed(&[1])).is_empty());
    }

    #[test]
    fn reused_id_after_eviction_starts_fresh() {
        let mut h = TrackHistory::new(2, 16);
        h.ingest(&[det(1, 5.0)], 0);
        h.ingest(&[det(1, 5.0)], 1);
        assert_eq!(h.evict_stale(3, &observed(&[])).len(), 1);
        h.ingest(&[det(1, 9.0)], 4);
        let t = h.get(TrackId(1)).unwrap();
        assert_eq!(t.samples().len(), 1);
        assert_eq!(t.samples()[0].frame_index, 4);
    }

    #[test]
    fn drain_returns_everything_sorted() {
        let mut h = TrackHistory::new(10, 16);
        h.ingest(&[det(9, 1.0), det(2, 1.0), det(5, 1.0)], 0);
        let ids: Vec<u64> = h.drain().iter().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(h.is_empty());
    }

    #[test]
    fn stale_track_rejects_unordered_samples() {
        let a = Sample::interpolated(3, 1.0);
        let b = Sample::interpolated(3, 2.0);
        assert!(StaleTrack::from_samples(TrackId(1), vec![a, b]).is_none());
        assert!(StaleTrack::from_samples(TrackId(1), vec![]).is_none());
    }

    proptest! {
        #[test]
        fn samples_stay_strictly_increasing(frames in proptest::collection::vec(0u64..40, 1..60)) {
            let mut h = TrackHistory::new(1000, 4);
            for f in &frames {
                h.ingest(&[det(1, 4.0)], *f);
            }
            let t = h.get(TrackId(1)).unwrap();
            prop_assert!(t.samples().windows(2).all(|w| w[0].frame_index < w[1].frame_index));
        }

        #[test]
        fn each_track_is_evicted_at_most_once(last_seen in 0u64..30, gap in 1u64..12) {
            let mut h = TrackHistory::new(gap, 4);
            h.ingest(&[det(1, 4.0)], last_seen);
            let mut evictions = 0;
            for f in last_seen..last_seen + 40 {
                let out = h.evict_stale(f, &HashSet::new());
                if !out.is_empty() {
                    prop_assert_eq!(f - last_seen, gap);
                }
                evictions += out.len();
            }
            prop_assert_eq!(evictions, 1);
        }
    }
}
