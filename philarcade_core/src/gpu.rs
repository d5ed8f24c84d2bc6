// SPDX-License-Identifier: GPL-3.0
// gpu.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use crate::sinks::{Bitmap, Rect};

/// This module contains the Konami 037122 tilemap and CRT controller chip.
pub mod k037122;

/// This module contains the Konami 057714 "GCU" 2D graphics chip.
pub mod k057714;

/// This module contains the Shamisen Brothers sprite video chip.
pub mod shambros_video;


/// This trait provides an implementation-opaque way of asking a video chip to
/// produce its picture, so the embedding machine can scan out any of them.
pub trait VideoChip {

    /// Implementations must render the current picture into `bitmap`, touching
    /// only pixels inside `cliprect`.
    fn draw(&mut self, bitmap: &mut Bitmap, cliprect: &Rect);
}

/// Packs 5-bit channels into an xRGB1555 pixel.
#[inline(always)]
pub(crate) fn pack_rgb555(r: u32, g: u32, b: u32) -> u16 {
    ((r.min(0x1F) << 10) | (g.min(0x1F) << 5) | b.min(0x1F)) as u16
}

/// Splits an xRGB1555 pixel into its 5-bit channels.
#[inline(always)]
pub(crate) fn unpack_rgb555(pixel: u16) -> (u32, u32, u32) {
    let pixel = pixel as u32;
    ((pixel >> 10) & 0x1F, (pixel >> 5) & 0x1F, pixel & 0x1F)
}
