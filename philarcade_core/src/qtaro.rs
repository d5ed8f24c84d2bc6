// SPDX-License-Identifier: GPL-3.0
// qtaro.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use philarcade_utility::BitField;

/// This module contains the King Qtaro PCI card that feeds the Qtaro boards.
pub mod king_qtaro;

/// This module contains the sprite renderer whose output the Qtaro boards mix.
pub mod vj_sprite;

#[cfg(test)]
mod tests;

/// Size of a decoded movie frame until the stream says otherwise.
pub const DEFAULT_FRAME_WIDTH: usize = 352;
pub const DEFAULT_FRAME_HEIGHT: usize = 240;

/// Mix levels at or above this show only the overlay.
const MIX_LEVEL_OVERLAY_ONLY: u16 = 15;

/// Bit of the control register that is set while a stream is being fed.
const STREAM_ACTIVE_BIT: u32 = 7;

/// This struct is a 32-bit-per-pixel frame. Each pixel carries three 8-bit
/// channels in bytes 0 to 2 and alpha in byte 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
}

impl RgbFrame {

    pub fn new(width: usize, height: usize) -> Self {
        RgbFrame {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    /// Wraps pixels produced elsewhere. Missing pixels read as zero and
    /// extra ones are dropped.
    pub fn from_pixels(width: usize, height: usize, mut pixels: Vec<u32>) -> Self {

        pixels.resize(width * height, 0);
        RgbFrame { width, height, pixels }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel(&self, x: usize, y: usize) -> u32 {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x]
        } else {
            0
        }
    }

    /// Writes a pixel, silently dropping writes outside the frame.
    pub fn set_pixel(&mut self, x: i32, y: i32, value: u32) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.pixels[y as usize * self.width + x as usize] = value;
        }
    }
}

/// This trait is the MPEG video decoder a Qtaro board streams into. Times are
/// in seconds of stream presentation time.
pub trait MpegVideoDecoder {

    /// Discards everything buffered and starts a new stream.
    fn reset_stream(&mut self);

    /// Called with each stream byte, in order.
    fn write_byte(&mut self, byte: u8);

    /// Tells the decoder no more bytes will arrive for this stream.
    fn signal_end(&mut self);

    /// Returns the presentation time of the next frame to be decoded.
    fn time(&self) -> f64;

    /// Decodes the next frame, or returns `None` if there is not enough data.
    fn decode(&mut self) -> Option<RgbFrame>;
}

/// This struct models one Qtaro sub-board: it buffers an MPEG video stream
/// sent to it by DMA, decodes frames as virtual time passes and mixes the
/// latest one with the sprite overlay.
pub struct Qtaro {

    // Control register. Bit 7 brackets a stream.
    control: u8,

    // Movie state.
    frame_width: usize,
    frame_height: usize,
    frame: Option<RgbFrame>,
    stream_time: f64,
    video_decode_enabled: bool,

    // Overlay against movie blend, 0 (movie only) to 15 (overlay only).
    mix_level: u16,

    decoder: Option<Box<dyn MpegVideoDecoder>>,
}

impl Qtaro {

    pub fn new() -> Self {
        let mut qtaro = Qtaro {
            control: 0,
            frame_width: DEFAULT_FRAME_WIDTH,
            frame_height: DEFAULT_FRAME_HEIGHT,
            frame: None,
            stream_time: 0.0,
            video_decode_enabled: false,
            mix_level: 0,
            decoder: None,
        };
        qtaro.reset();
        qtaro
    }

    pub fn attach_decoder(&mut self, decoder: Box<dyn MpegVideoDecoder>) {
        self.decoder = Some(decoder);
    }

    pub fn reset(&mut self) {

        self.control = 0;
        self.frame_width = DEFAULT_FRAME_WIDTH;
        self.frame_height = DEFAULT_FRAME_HEIGHT;
        self.frame = None;
        self.mix_level = 0;
        self.video_decode_enabled = false;
        self.reset_stream();
    }

    /// Starts a new stream. The last decoded frame stays on screen until the
    /// new stream produces one.
    pub fn reset_stream(&mut self) {

        self.stream_time = 0.0;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset_stream();
        }
    }

    pub fn mix_w(&mut self, data: u16) {

        if data != self.mix_level {
            log::debug!("qtaro: mix level {:04x}", data);
        }
        self.mix_level = data;
    }

    pub fn mix_level(&self) -> u16 {
        self.mix_level
    }

    pub fn reg_r(&self) -> u8 {
        self.control
    }

    /// Raising bit 7 starts a new stream, dropping it ends the current one.
    pub fn reg_w(&mut self, data: u8) {

        let was_active = self.control.is_set(STREAM_ACTIVE_BIT);
        let is_active = data.is_set(STREAM_ACTIVE_BIT);
        if is_active && !was_active {
            log::debug!("qtaro: stream started {:02x}", data);
            self.reset_stream();
        } else if !is_active && was_active {
            log::debug!("qtaro: stream ended {:02x}", data);
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.signal_end();
            }
        }
        self.control = data;
    }

    pub fn reg2_r(&self) -> u8 {
        0
    }

    /// 0x20 is the idle state the driver waits for after tearing a stream down.
    pub fn reg3_r(&self) -> u32 {
        0x20
    }

    pub fn reg3_w(&mut self, data: u32) {
        log::trace!("qtaro: reg3 write {:08x} ignored", data);
    }

    /// Feeds one stream byte to the decoder.
    pub fn write(&mut self, data: u8) {

        match self.decoder.as_mut() {
            Some(decoder) => decoder.write_byte(data),
            None => log::trace!("qtaro: no decoder, dropping {:02x}", data),
        }
    }

    pub fn set_video_decode_enabled(&mut self, enabled: bool) {

        if enabled != self.video_decode_enabled {
            log::debug!("qtaro: video decoding {}", if enabled { "enabled" } else { "disabled" });
        }
        self.video_decode_enabled = enabled;
    }

    pub fn is_video_decode_enabled(&self) -> bool {
        self.video_decode_enabled
    }

    /// Advances the stream clock by `elapsed` seconds and decodes every frame
    /// due by then, keeping the last one.
    pub fn update_frame(&mut self, elapsed: f64) {

        if !self.video_decode_enabled {
            return;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };

        self.stream_time += elapsed;
        while decoder.time() <= self.stream_time {
            let Some(frame) = decoder.decode() else {
                break;
            };
            log::trace!("qtaro: frame at {:.3}s, stream at {:.3}s", decoder.time(), self.stream_time);
            self.frame_width = frame.width();
            self.frame_height = frame.height();
            self.frame = Some(frame);
        }
    }

    /// Returns the size of the movie picture the overlay has to match.
    pub fn frame_size(&self) -> (usize, usize) {
        (self.frame_width, self.frame_height)
    }

    pub fn frame(&self) -> Option<&RgbFrame> {
        self.frame.as_ref()
    }

    /// Mixes the current movie frame into `base`, which holds the overlay.
    /// Level 0 replaces the overlay, levels 1 to 14 blend `level / 15` of the
    /// overlay with the rest from the movie, and 15 and above leave it alone.
    pub fn render_video_frame(&self, base: &mut RgbFrame) {

        let Some(frame) = self.frame.as_ref() else {
            return;
        };
        if !self.video_decode_enabled || self.mix_level >= MIX_LEVEL_OVERLAY_ONLY {
            return;
        }
        if base.width() != frame.width() || base.height() != frame.height() {
            log::error!(
                "qtaro: overlay is {}x{} but the movie is {}x{}",
                base.width(), base.height(), frame.width(), frame.height()
            );
            return;
        }

        if self.mix_level == 0 {
            base.pixels.copy_from_slice(&frame.pixels);
            return;
        }

        let overlay_blend = self.mix_level as f64 / 15.0;
        let movie_blend = 1.0 - overlay_blend;
        for (pixel, movie) in base.pixels.iter_mut().zip(frame.pixels.iter()) {
            let mut mixed = 0xFF000000;
            for lane in 0..3 {
                let shift = lane * 8;
                let value = movie.bits(shift, 8) as f64 * movie_blend + pixel.bits(shift, 8) as f64 * overlay_blend;
                mixed |= (value.min(255.0) as u32) << shift;
            }
            *pixel = mixed;
        }
    }
}
