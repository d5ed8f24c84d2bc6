// SPDX-License-Identifier: GPL-3.0
// vj_sprite.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::RgbFrame;
use philarcade_utility::BitField;

/// Sprites are cut from 256x256 pages of one byte per pixel.
pub const SPRITE_PAGE_SIZE: u32 = 256;
pub const SPRITE_PAGE_BYTES: usize = 0x10000;

/// Width of the output frame in pixels. Every source pixel becomes two.
pub const OUTPUT_WIDTH: usize = 720;

/// Palette words per colour entry.
const PALETTE_ENTRY_WORDS: usize = 4;

/// Bits of words 0 and 2 the sprite hardware does not interpret.
const UNK1_MASK: u16 = 0x80FB;
const UNK2_MASK: u16 = 0xF000;

/// One sprite list entry, decoded from six words of sprite RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpriteEntry {
    pub disable: bool,
    pub code: u32,
    pub color: u32,
    pub tx: u8,
    pub ty: u8,
    pub src_width: u16,
    pub src_height: u16,
    pub sx: i32,
    pub sy: i32,

    /// Word 0 bits other than the enable bit and colour. Stored, not interpreted.
    pub unk1: u16,

    /// Word 2 bits above the page code. Stored, not interpreted.
    pub unk2: u16,
}

impl SpriteEntry {

    pub fn decode(words: &[u16; 6]) -> Self {

        if words[0] & 3 != 0 {
            log::trace!("vj sprite: low bits of word 0 set {:04x}", words[0]);
        }

        SpriteEntry {
            disable: !words[0].is_set(2),
            color: words[0].bits(8, 7) as u32,
            tx: words[1].bits(0, 8) as u8,
            ty: words[1].bits(8, 8) as u8,
            code: words[2].bits(0, 12) as u32,
            src_width: words[3].bits(0, 8) + 1,
            src_height: words[3].bits(8, 8) + 1,
            sy: words[4].bits(0, 9) as i32 - (words[4] & 0x200) as i32,
            sx: words[5].bits(0, 10) as i32 - (words[5] & 0x400) as i32,
            unk1: words[0] & UNK1_MASK,
            unk2: words[2] & UNK2_MASK,
        }
    }

    /// Packs the entry back into sprite RAM words. The passthrough fields are
    /// written back where they came from.
    pub fn encode(&self) -> [u16; 6] {
        [
            (self.unk1 & UNK1_MASK) | ((!self.disable as u16) << 2) | (((self.color & 0x7F) as u16) << 8),
            self.tx as u16 | ((self.ty as u16) << 8),
            (self.code & 0xFFF) as u16 | (self.unk2 & UNK2_MASK),
            (self.src_width.wrapping_sub(1) & 0xFF) | ((self.src_height.wrapping_sub(1) & 0xFF) << 8),
            (self.sy & 0x3FF) as u16,
            (self.sx & 0x7FF) as u16,
        ]
    }
}

/// This struct holds the sprite pages and draws sprites out of them. Each page
/// is stored in 8x8 blocks of 64 bytes, with 32 blocks per row of blocks.
pub struct VjSprite {
    gfx: Vec<u8>,
}

impl VjSprite {

    /// Creates the renderer over sprite data, padding it to whole pages.
    pub fn new(mut gfx: Vec<u8>) -> Self {

        let pages = gfx.len().div_ceil(SPRITE_PAGE_BYTES);
        gfx.resize(pages * SPRITE_PAGE_BYTES, 0);
        VjSprite { gfx }
    }

    pub fn page_count(&self) -> usize {
        self.gfx.len() / SPRITE_PAGE_BYTES
    }

    /// Returns the pen at `(x, y)` of page `code`.
    pub fn pixel(&self, code: u32, x: u32, y: u32) -> u8 {

        let offset = code as usize * SPRITE_PAGE_BYTES
            + (y as usize / 8) * 2048
            + (y as usize % 8) * 8
            + (x as usize / 8) * 64
            + (x as usize % 8);
        self.gfx.get(offset).copied().unwrap_or(0)
    }

    /// Draws one sprite into `output` at its screen position. The source window
    /// starts at `(tx, ty)` within the page; columns and rows past the page edge
    /// are skipped but still take up space. Every source pixel covers two output
    /// pixels across and two lines down. There is no transparent pen.
    pub fn render(&self, output: &mut RgbFrame, entry: &SpriteEntry, palette: &[u16]) {

        if entry.code as usize >= self.page_count() {
            log::warn!("vj sprite: page {:03x} out of range", entry.code);
            return;
        }

        for row in 0..entry.src_height as u32 {
            let draw_y = entry.ty as u32 + row;
            if draw_y >= SPRITE_PAGE_SIZE {
                continue;
            }
            let out_y = (entry.sy + row as i32) * 2;

            for column in 0..entry.src_width as u32 {
                let draw_x = entry.tx as u32 + column;
                if draw_x >= SPRITE_PAGE_SIZE {
                    continue;
                }
                let out_x = (entry.sx + column as i32) * 2;

                let pen = self.pixel(entry.code, draw_x, draw_y) as usize;
                let base = (entry.color as usize * 0x100 + pen) * PALETTE_ENTRY_WORDS;
                let word = |i: usize| palette.get(base + i).copied().unwrap_or(0) as u32 & 0xFF;
                let left = word(0) | (word(1) << 8) | (word(2) << 16);
                let right = word(0) | (word(3) << 8) | (word(2) << 16);

                for line in [out_y, out_y + 1] {
                    output.set_pixel(out_x, line, left);
                    output.set_pixel(out_x + 1, line, right);
                }
            }
        }
    }
}
