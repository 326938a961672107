//! RGB frame buffers handed over by image sources.
//!
//! Rows are stored top-down: row 0 is the top of the picture.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which colour channels take part in tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMask {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
}

impl ChannelMask {
    pub const ALL: Self = Self {
        red: true,
        green: true,
        blue: true,
    };

    pub const NONE: Self = Self {
        red: false,
        green: false,
        blue: false,
    };

    pub const fn new(red: bool, green: bool, blue: bool) -> Self {
        Self { red, green, blue }
    }

    /// Channels enabled in both masks.
    pub fn intersect(self, other: Self) -> Self {
        Self {
            red: self.red && other.red,
            green: self.green && other.green,
            blue: self.blue && other.blue,
        }
    }

    pub fn count(self) -> usize {
        usize::from(self.red) + usize::from(self.green) + usize::from(self.blue)
    }

    pub fn is_empty(self) -> bool {
        self.count() == 0
    }
}

impl Default for ChannelMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// An RGB frame in CPU memory with `f32` samples in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Interleaved RGB samples, `width * height * 3` long
    pub data: Vec<f32>,
}

impl RgbFrame {
    /// Create a black frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * 3],
        }
    }

    /// Total memory usage of this frame in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }

    /// RGB triple at `(x, y)`, `None` outside the frame.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.index(x, y);
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [f32; 3]) {
        if x < self.width && y < self.height {
            let i = self.index(x, y);
            self.data[i..i + 3].copy_from_slice(&rgb);
        }
    }

    /// Mean of the enabled channels at `(x, y)`.
    ///
    /// An empty mask yields zero.
    #[inline]
    pub fn luminance(&self, x: u32, y: u32, mask: ChannelMask) -> f32 {
        let Some([r, g, b]) = self.pixel(x, y) else {
            return 0.0;
        };
        let n = mask.count();
        if n == 0 {
            return 0.0;
        }
        let mut sum = 0.0;
        if mask.red {
            sum += r;
        }
        if mask.green {
            sum += g;
        }
        if mask.blue {
            sum += b;
        }
        sum / n as f32
    }
}

/// Arc-wrapped frame for shared ownership.
pub type SharedFrame = Arc<RgbFrame>;
