//! Registry of alignment markers shared by the workers of a tracking session.
//!
//! Entries live in absolute bottom-up coordinates and are keyed by
//! `(track, frame)`. Every insertion goes through a single mutex.

use crate::accessor::FrameCache;
use crate::region::{track_region, RegionOptions, RegionResult};
use parking_lot::Mutex;
use pintrack_core::{
    apply_homography, quad_to_quad, ChannelMask, FrameTime, Point, Quad, RectD, Result,
    TrackError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a sample was authored by the user or computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleSource {
    Manual,
    Tracked,
}

/// One marker sample as seen by the alignment engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionMarker {
    pub track: usize,
    pub frame: FrameTime,
    pub reference_frame: FrameTime,
    pub source: SampleSource,
    pub channels: ChannelMask,
    pub center: Point,
    pub patch: Quad,
    pub search_region: RectD,
}

#[derive(Debug, Default)]
pub struct MarkerRegistry {
    markers: Mutex<BTreeMap<(usize, FrameTime), RegionMarker>>,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a marker, replacing any entry for the same track and frame.
    pub fn add_marker(&self, marker: RegionMarker) {
        self.markers
            .lock()
            .insert((marker.track, marker.frame), marker);
    }

    pub fn get_marker(&self, track: usize, frame: FrameTime) -> Option<RegionMarker> {
        self.markers.lock().get(&(track, frame)).copied()
    }

    /// All samples of one track, ordered by frame.
    pub fn markers_for_track(&self, track: usize) -> Vec<RegionMarker> {
        self.markers
            .lock()
            .range((track, FrameTime::MIN)..=(track, FrameTime::MAX))
            .map(|(_, m)| *m)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.markers.lock().clear();
    }

    /// Align `marker` against its registered reference sample.
    ///
    /// Returns the updated marker together with the raw alignment result. The
    /// updated marker is only meaningful when the result is usable; it is not
    /// inserted into the registry.
    pub fn track_marker(
        &self,
        marker: &RegionMarker,
        options: &RegionOptions,
        cache: &FrameCache,
    ) -> Result<(RegionMarker, RegionResult)> {
        let reference = self
            .get_marker(marker.track, marker.reference_frame)
            .ok_or(TrackError::MarkerNotFound {
                track: marker.track,
                frame: marker.reference_frame,
            })?;

        let reference_image = cache.gray_frame(reference.frame, marker.channels)?;
        let target_image = cache.gray_frame(marker.frame, marker.channels)?;
        let result = track_region(
            &reference_image,
            &target_image,
            &reference.patch,
            &marker.patch,
            marker.search_region,
            options,
        );

        let mut tracked = *marker;
        tracked.source = SampleSource::Tracked;
        tracked.patch = result.quad;
        // Carry the reference center through the same patch motion.
        tracked.center = quad_to_quad(&reference.patch, &result.quad)
            .and_then(|h| apply_homography(&h, reference.center))
            .unwrap_or_else(|| {
                reference.center + (result.quad.centroid() - reference.patch.centroid())
            });
        tracked.search_region = marker
            .search_region
            .translate(tracked.center - marker.center);
        Ok((tracked, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(track: usize, frame: FrameTime) -> RegionMarker {
        let center = Point::new(10.0, 10.0);
        RegionMarker {
            track,
            frame,
            reference_frame: frame - 1,
            source: SampleSource::Manual,
            channels: ChannelMask::ALL,
            center,
            patch: Quad::from_rect(RectD::new(5.0, 5.0, 15.0, 15.0)),
            search_region: RectD::new(0.0, 0.0, 20.0, 20.0),
        }
    }

    #[test]
    fn test_insert_replaces_same_key() {
        let registry = MarkerRegistry::new();
        registry.add_marker(sample(0, 3));
        let mut updated = sample(0, 3);
        updated.source = SampleSource::Tracked;
        registry.add_marker(updated);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get_marker(0, 3).map(|m| m.source),
            Some(SampleSource::Tracked)
        );
    }

    #[test]
    fn test_markers_for_track_are_ordered() {
        let registry = MarkerRegistry::new();
        for frame in [5, -2, 1] {
            registry.add_marker(sample(1, frame));
        }
        registry.add_marker(sample(0, 0));
        registry.add_marker(sample(2, 0));
        let frames: Vec<FrameTime> = registry
            .markers_for_track(1)
            .iter()
            .map(|m| m.frame)
            .collect();
        assert_eq!(frames, vec![-2, 1, 5]);
        registry.clear();
        assert!(registry.is_empty());
    }
}
