// SPDX-License-Identifier: GPL-3.0
// shambros_video.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{pack_rgb555, unpack_rgb555, VideoChip};
use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};
use crate::sinks::{Bitmap, Rect};
use philarcade_utility::BitField;

/// Size of object RAM in 16-bit words.
pub const OBJ_RAM_WORDS: usize = 0x4000;

/// Size of palette RAM in 16-bit words, 0x100 entries per palette.
pub const PALETTE_RAM_WORDS: usize = 0x8000;

/// Word offset of palette RAM in the RAM window.
const PALETTE_RAM_BASE: u32 = 0x8000;

/// Sprites are built from 16x16 tiles of one byte per pixel.
const TILE_SIZE: i32 = 16;
const TILE_BYTES: u32 = 0x100;

/// Character offsets below this are the font, drawn only with a palette.
const FONT_LIMIT: u32 = 0x10000;

/// One entry of the sprite list, decoded from four words of object RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sprite {
    x: i32,
    y: i32,
    transparency: u32,
    palette: u32,
    tiles_w: u32,
    tiles_h: u32,
    char_offset: u32,
    is_transparent: bool,
    is_last: bool,
}

impl Sprite {

    fn decode(words: &[u16]) -> Self {
        Sprite {
            x: (words[0] & 0x1FF) as i32,
            y: (words[1] & 0x1FF) as i32,
            transparency: words[1].bits(10, 5) as u32,
            palette: words[2].bits(0, 6) as u32,
            tiles_w: words[2].bits(8, 3) as u32 + 1,
            tiles_h: words[2].bits(12, 3) as u32 + 1,
            char_offset: words[3].bits(0, 14) as u32 * TILE_BYTES,
            is_transparent: words[3].is_set(14),
            is_last: words[3].is_set(15),
        }
    }
}

/// This struct models the Shamisen Brothers video chip: a list of tiled
/// sprites in object RAM, drawn from character flash through palette RAM.
pub struct ShambrosVideo {

    // Register state.
    enabled: bool,
    flash_write_enable: bool,

    // Memories.
    obj_ram: Vec<u16>,
    palette_ram: Vec<u16>,
    flash: Vec<u16>,

    map: AddressMap<ShambrosVideo>,
}

impl ShambrosVideo {

    /// Creates the chip over a character flash of the given size in words.
    pub fn new(flash_words: usize) -> Self {
        let mut video = ShambrosVideo {
            enabled: false,
            flash_write_enable: false,

            // Setup memories. Flash starts erased.
            obj_ram: vec![0; OBJ_RAM_WORDS],
            palette_ram: vec![0; PALETTE_RAM_WORDS],
            flash: vec![0xFFFF; flash_words],

            map: ShambrosVideo::build_map(),
        };
        video.reset();
        video
    }

    fn build_map() -> AddressMap<ShambrosVideo> {

        let mut map: AddressMap<ShambrosVideo> = AddressMap::new(2);
        map.map_write(0x14, 0x15, ShambrosVideo::enabled_w)
            .map_write(0x18, 0x19, ShambrosVideo::flash_control_w);
        map
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.flash_write_enable = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replaces the character flash contents.
    pub fn load_flash(&mut self, words: &[u16]) {

        let count = words.len().min(self.flash.len());
        self.flash[..count].copy_from_slice(&words[..count]);
    }

    /// Reads a word of the RAM window: object RAM first, palette RAM from 0x8000.
    pub fn ram_read(&self, offset: u32) -> u16 {

        match offset {
            o if (o as usize) < OBJ_RAM_WORDS => self.obj_ram[o as usize],
            o if o >= PALETTE_RAM_BASE && ((o - PALETTE_RAM_BASE) as usize) < PALETTE_RAM_WORDS => {
                self.palette_ram[(o - PALETTE_RAM_BASE) as usize]
            },
            _ => 0xFFFF,
        }
    }

    pub fn ram_write(&mut self, offset: u32, data: u16) {

        match offset {
            o if (o as usize) < OBJ_RAM_WORDS => self.obj_ram[o as usize] = data,
            o if o >= PALETTE_RAM_BASE && ((o - PALETTE_RAM_BASE) as usize) < PALETTE_RAM_WORDS => {
                self.palette_ram[(o - PALETTE_RAM_BASE) as usize] = data;
            },
            _ => log::warn!("shambros video: ram write out of range {:05x} = {:04x}", offset, data),
        }
    }

    /// Reads a word of character flash.
    pub fn data_read(&self, offset: u32) -> u16 {
        self.flash.get(offset as usize).copied().unwrap_or(0xFFFF)
    }

    /// Writes a word of character flash, when writes have been enabled.
    pub fn data_write(&mut self, offset: u32, data: u16) {

        if !self.flash_write_enable {
            return;
        }
        match self.flash.get_mut(offset as usize) {
            Some(word) => *word = data,
            None => log::warn!("shambros video: flash write out of range {:06x}", offset),
        }
    }

    fn enabled_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.enabled = data != 0;
    }

    fn flash_control_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.flash_write_enable = data != 0;
    }

    /// Returns the palette index stored for a character pixel. Even byte
    /// offsets are the high byte of a flash word.
    fn colour_index(&self, offset: u32) -> u32 {

        let word = self.data_read(offset / 2);
        word.bits(8 * (1 - (offset & 1)), 8) as u32
    }

    fn draw_sprite(&self, sprite: &Sprite, bitmap: &mut Bitmap, cliprect: &Rect) {

        for m in 0..sprite.tiles_h {
            for n in 0..sprite.tiles_w {
                for i in 0..TILE_SIZE {
                    for j in 0..TILE_SIZE {
                        let ty = sprite.y + m as i32 * TILE_SIZE + i;
                        let tx = sprite.x + n as i32 * TILE_SIZE + j;
                        if !cliprect.contains(tx, ty) {
                            continue;
                        }

                        let offset = sprite.char_offset
                            + m * TILE_BYTES * sprite.tiles_w
                            + n * TILE_BYTES
                            + (i * TILE_SIZE + j) as u32;

                        // Font characters need a palette to show.
                        if offset < FONT_LIMIT && sprite.palette == 0 {
                            continue;
                        }

                        let colour_index = self.colour_index(offset);
                        if colour_index == 0 {
                            continue;
                        }
                        let colour = self.palette_ram[(sprite.palette * 0x100 + colour_index) as usize];

                        let pixel = if sprite.is_transparent {
                            let t = sprite.transparency;
                            let (dr, dg, db) = unpack_rgb555(bitmap.pixel(tx as usize, ty as usize));
                            let (r, g, b) = unpack_rgb555(colour);
                            pack_rgb555(
                                (dr * (31 - t) + r * t) >> 5,
                                (dg * (31 - t) + g * t) >> 5,
                                (db * (31 - t) + b * t) >> 5,
                            )
                        } else {
                            colour
                        };
                        bitmap.set_pixel(tx, ty, pixel);
                    }
                }
            }
        }
    }
}

impl VideoChip for ShambrosVideo {

    /// Walks the sprite list until the entry flagged as last.
    fn draw(&mut self, bitmap: &mut Bitmap, cliprect: &Rect) {

        bitmap.fill(0, cliprect);

        if !self.enabled {
            return;
        }

        for entry in self.obj_ram.chunks_exact(4) {
            let sprite = Sprite::decode(entry);
            if sprite.is_last {
                break;
            }

            // Blank tile.
            if sprite.char_offset == 0 {
                continue;
            }
            if !cliprect.contains(sprite.x, sprite.y) {
                continue;
            }
            self.draw_sprite(&sprite, bitmap, cliprect);
        }
    }
}

impl Bus for ShambrosVideo {

    fn read(&mut self, _offset: u32, mem_mask: u32) -> u32 {
        unmapped_read(mem_mask)
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset);
        let handler = self.map.find_write(address);
        match handler {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("shambros video: unmapped write {:02x} = {:04x}", address, data),
        }
    }
}
