//! Grayscale image utilities for region alignment.
//!
//! Images handed to the alignment engine are stored bottom-up: row 0 is the
//! bottom row of the picture, matching the engine's coordinate frame.

use pintrack_core::{ChannelMask, Point, RectD, RgbFrame};

/// A grayscale image stored as f32 values.
#[derive(Debug, Clone)]
pub struct GrayImage {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl GrayImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; width as usize * height as usize],
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.width as usize + x]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, val: f32) {
        if x < self.width && y < self.height {
            self.data[y as usize * self.width as usize + x as usize] = val;
        }
    }

    /// Whether bilinear sampling at `(x, y)` stays on real pixels.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= f64::from(self.width) - 1.0 && y <= f64::from(self.height) - 1.0
    }

    /// Bilinear sample; coordinates outside the image clamp to the border.
    #[inline]
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let (xi, yi) = (x0 as i32, y0 as i32);
        let top = self.get(xi, yi) * (1.0 - fx) + self.get(xi + 1, yi) * fx;
        let bottom = self.get(xi, yi + 1) * (1.0 - fx) + self.get(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Copy out a `w × h` region starting at `(x0, y0)`; pixels outside the
    /// source clamp to its border.
    pub fn crop(&self, x0: i32, y0: i32, w: u32, h: u32) -> GrayImage {
        let mut out = GrayImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                out.set(x, y, self.get(x0 + x as i32, y0 + y as i32));
            }
        }
        out
    }

    /// Separable Gaussian blur. A sigma below 0.1 returns a copy.
    pub fn gaussian_blur(&self, sigma: f64) -> GrayImage {
        if sigma < 0.1 {
            return self.clone();
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as i32;

        let mut horizontal = GrayImage::new(self.width, self.height);
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let mut acc = 0.0f32;
                for (k, w) in kernel.iter().enumerate() {
                    acc += self.get(x + k as i32 - radius, y) * w;
                }
                horizontal.set(x as u32, y as u32, acc);
            }
        }

        let mut out = GrayImage::new(self.width, self.height);
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let mut acc = 0.0f32;
                for (k, w) in kernel.iter().enumerate() {
                    acc += horizontal.get(x, y + k as i32 - radius) * w;
                }
                out.set(x as u32, y as u32, acc);
            }
        }
        out
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as i32;
    let two_sigma2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|k| (-(f64::from(k * k)) / two_sigma2).exp() as f32)
        .collect();
    let sum: f32 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Convert a top-down RGB frame to a bottom-up grayscale image using the
/// mean of the enabled channels.
pub fn rgb_to_gray(frame: &RgbFrame, mask: ChannelMask) -> GrayImage {
    let mut gray = GrayImage::new(frame.width, frame.height);
    for y in 0..frame.height {
        let src_row = frame.height - 1 - y;
        for x in 0..frame.width {
            gray.set(x, y, frame.luminance(x, src_row, mask));
        }
    }
    gray
}

/// Compute spatial gradients (Ix, Iy) using central differences.
pub fn compute_gradients(img: &GrayImage) -> (GrayImage, GrayImage) {
    let mut ix = GrayImage::new(img.width, img.height);
    let mut iy = GrayImage::new(img.width, img.height);
    for y in 0..img.height as i32 {
        for x in 0..img.width as i32 {
            ix.set(
                x as u32,
                y as u32,
                (img.get(x + 1, y) - img.get(x - 1, y)) * 0.5,
            );
            iy.set(
                x as u32,
                y as u32,
                (img.get(x, y + 1) - img.get(x, y - 1)) * 0.5,
            );
        }
    }
    (ix, iy)
}

/// A blurred crop of a frame together with its gradients, addressed in the
/// coordinates of the full frame.
#[derive(Debug, Clone)]
pub struct ImageWindow {
    image: GrayImage,
    grad_x: GrayImage,
    grad_y: GrayImage,
    origin: Point,
    /// Area of the full frame covered by real pixels.
    valid: RectD,
}

impl ImageWindow {
    /// Crop `area` (grown by the blur support) out of `frame`, blur it and
    /// precompute gradients.
    pub fn build(frame: &GrayImage, area: RectD, sigma: f64) -> Self {
        let margin = (sigma * 3.0).ceil() + 2.0;
        let grown = area.expand(margin);
        let x0 = grown.x1.floor() as i32;
        let y0 = grown.y1.floor() as i32;
        let w = (grown.x2.ceil() as i32 - x0 + 1).max(1) as u32;
        let h = (grown.y2.ceil() as i32 - y0 + 1).max(1) as u32;

        let image = frame.crop(x0, y0, w, h).gaussian_blur(sigma);
        let (grad_x, grad_y) = compute_gradients(&image);
        let valid = RectD::new(
            0.0,
            0.0,
            f64::from(frame.width) - 1.0,
            f64::from(frame.height) - 1.0,
        );
        Self {
            image,
            grad_x,
            grad_y,
            origin: Point::new(f64::from(x0), f64::from(y0)),
            valid,
        }
    }

    /// Whether `p` lies on real frame pixels and inside this window.
    #[inline]
    pub fn contains(&self, p: Point) -> bool {
        let local = p - self.origin;
        self.valid.contains(p) && self.image.contains(local.x, local.y)
    }

    #[inline]
    pub fn sample(&self, p: Point) -> f32 {
        let local = p - self.origin;
        self.image.sample(local.x, local.y)
    }

    #[inline]
    pub fn gradient(&self, p: Point) -> (f32, f32) {
        let local = p - self.origin;
        (
            self.grad_x.sample(local.x, local.y),
            self.grad_y.sample(local.x, local.y),
        )
    }
}
