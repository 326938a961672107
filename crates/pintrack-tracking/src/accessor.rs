//! Frame access for tracking sessions.

use crate::image::{rgb_to_gray, GrayImage};
use parking_lot::Mutex;
use pintrack_core::{ChannelMask, FrameTime, RectD, Result, RgbFrame};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Supplies decoded frames to the tracker.
pub trait ImageSource: Send + Sync {
    /// Frame size in pixels.
    fn format(&self) -> (u32, u32);

    /// Decode the top-down RGB frame at `time`.
    fn fetch_frame(&self, time: FrameTime) -> Result<RgbFrame>;

    /// Area covered by the image at `time`, in top-down pixel coordinates.
    fn region_of_definition(&self, _time: FrameTime) -> RectD {
        let (w, h) = self.format();
        RectD::new(0.0, 0.0, f64::from(w), f64::from(h))
    }
}

/// Grayscale frames decoded during one tracking session, keyed by time and
/// channel mask.
///
/// Each session owns its cache, and the cache is cleared when the session ends.
pub struct FrameCache {
    source: Arc<dyn ImageSource>,
    frames: Mutex<HashMap<(FrameTime, ChannelMask), Arc<GrayImage>>>,
}

impl FrameCache {
    pub fn new(source: Arc<dyn ImageSource>) -> Self {
        Self {
            source,
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Height of the source format, used for vertical flips.
    pub fn height(&self) -> f64 {
        f64::from(self.source.format().1)
    }

    /// Bottom-up grayscale frame at `time`, decoding it on first use.
    pub fn gray_frame(&self, time: FrameTime, channels: ChannelMask) -> Result<Arc<GrayImage>> {
        if let Some(frame) = self.frames.lock().get(&(time, channels)) {
            return Ok(Arc::clone(frame));
        }
        // Decode outside the lock; a concurrent decode of the same key is harmless.
        let rgb = self.source.fetch_frame(time)?;
        let gray = Arc::new(rgb_to_gray(&rgb, channels));
        debug!(time, width = gray.width, height = gray.height, "Decoded frame");
        let mut frames = self.frames.lock();
        let entry = frames.entry((time, channels)).or_insert(gray);
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Drop every cached frame.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}
