//! Deterministic synthetic footage.
//!
//! Frames show Gaussian blobs moving at constant velocity over a flat
//! background. Each blob carries a smaller satellite so that rotation and
//! scale stay observable.

use crate::accessor::ImageSource;
use pintrack_core::{FrameTime, Point, Result, RgbFrame, TrackError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    /// Center at frame 0, top-down pixels.
    pub origin: Point,
    /// Motion in pixels per frame.
    pub velocity: Point,
    pub sigma: f64,
    pub amplitude: f32,
}

impl Blob {
    pub fn center_at(&self, time: FrameTime) -> Point {
        self.origin + self.velocity * f64::from(time)
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    background: f32,
    blobs: Vec<Blob>,
    /// Frames outside this range fail to decode.
    frame_range: Option<(FrameTime, FrameTime)>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            background: 0.1,
            blobs: Vec::new(),
            frame_range: None,
        }
    }

    /// Add a blob starting at `origin` and moving by `velocity` per frame.
    pub fn with_blob(mut self, origin: Point, velocity: Point, sigma: f64) -> Self {
        self.blobs.push(Blob {
            origin,
            velocity,
            sigma,
            amplitude: 0.8,
        });
        self
    }

    pub fn with_frame_range(mut self, first: FrameTime, last: FrameTime) -> Self {
        self.frame_range = Some((first, last));
        self
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    fn splat(&self, data: &mut [f32], center: Point, sigma: f64, amplitude: f32) {
        let reach = (sigma * 4.0).ceil();
        let x0 = (center.x - reach).floor().max(0.0) as u32;
        let y0 = (center.y - reach).floor().max(0.0) as u32;
        let x1 = ((center.x + reach).ceil().max(0.0) as u32).min(self.width.saturating_sub(1));
        let y1 = ((center.y + reach).ceil().max(0.0) as u32).min(self.height.saturating_sub(1));
        let two_sigma2 = 2.0 * sigma * sigma;
        for y in y0..=y1 {
            for x in x0..=x1 {
                let d2 = Point::new(f64::from(x), f64::from(y)).distance_squared(center);
                let v = amplitude * (-d2 / two_sigma2).exp() as f32;
                data[(y * self.width + x) as usize] += v;
            }
        }
    }
}

impl ImageSource for SyntheticSource {
    fn format(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fetch_frame(&self, time: FrameTime) -> Result<RgbFrame> {
        if let Some((first, last)) = self.frame_range {
            if time < first || time > last {
                return Err(TrackError::Frame {
                    time,
                    message: format!("outside synthetic range {first}..={last}"),
                });
            }
        }
        let mut intensity = vec![self.background; self.width as usize * self.height as usize];
        for blob in &self.blobs {
            let center = blob.center_at(time);
            self.splat(&mut intensity, center, blob.sigma, blob.amplitude);
            let satellite = center + Point::new(blob.sigma, blob.sigma * 0.5);
            self.splat(&mut intensity, satellite, blob.sigma * 0.5, blob.amplitude * 0.5);
        }

        let mut frame = RgbFrame::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = intensity[(y * self.width + x) as usize];
                frame.set_pixel(x, y, [v, v * 0.8, v * 0.6]);
            }
        }
        Ok(frame)
    }
}
