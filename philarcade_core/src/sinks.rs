// SPDX-License-Identifier: GPL-3.0
// sinks.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

// Output side-channels that devices drive. They are opaque callback targets, and
// the embedding machine decides what happens to the bytes, samples and frames.

/// This trait is a serial line a device transmits bytes onto.
pub trait SerialLine {

    /// Called once per byte, in wire order.
    fn transmit(&mut self, byte: u8);
}

/// This trait receives mixed stereo audio, one frame per output sample tick.
pub trait AudioSink {

    fn push_frame(&mut self, left: i16, right: i16);
}

/// This trait receives rendered video frames.
pub trait FrameSink {

    fn present(&mut self, frame: &Bitmap);
}

/// An inclusive clipping rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Rect {

    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Rect { min_x, min_y, max_x, max_y }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// This struct is a 16-bit-per-pixel frame buffer, as produced by the video devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: usize,
    height: usize,
    pixels: Vec<u16>,
}

impl Bitmap {

    pub fn new(width: usize, height: usize) -> Self {
        Bitmap {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns the whole bitmap as a clipping rectangle.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32 - 1, self.height as i32 - 1)
    }

    pub fn pixel(&self, x: usize, y: usize) -> u16 {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x]
        } else {
            0
        }
    }

    /// Writes a pixel, silently dropping writes outside the bitmap.
    pub fn set_pixel(&mut self, x: i32, y: i32, value: u16) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.pixels[y as usize * self.width + x as usize] = value;
        }
    }

    /// Fills the part of `rect` that lies inside the bitmap.
    pub fn fill(&mut self, value: u16, rect: &Rect) {
        for y in rect.min_y.max(0)..=rect.max_y.min(self.height as i32 - 1) {
            for x in rect.min_x.max(0)..=rect.max_x.min(self.width as i32 - 1) {
                self.pixels[y as usize * self.width + x as usize] = value;
            }
        }
    }
}
