// SPDX-License-Identifier: GPL-3.0
// k037122.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{pack_rgb555, VideoChip};
use crate::bus::address_map::AddressMap;
use crate::bus::{combine_data, unmapped_read, Bus};
use crate::sinks::{Bitmap, FrameSink, Rect};
use crate::timer::{earliest, Clock, EventTimer, Time, Timed};
use philarcade_utility::BitField;

/// Character RAM, tile RAM and register file sizes in 32-bit words.
pub const CHAR_RAM_WORDS: usize = 0x200000 / 4;
pub const TILE_RAM_WORDS: usize = 0x20000 / 4;
pub const REG_WORDS: usize = 0x400 / 4;

/// Size of the character RAM window the host sees, selected by the bank register.
pub const CHAR_BANK_WORDS: usize = 0x40000 / 4;

/// Palette entries: 256 colours for each of 32 banks.
pub const PALETTE_ENTRIES: usize = 8192;

/// Each 8x8 character takes 128 bytes, one 16-bit slot per pixel.
const CHAR_WORDS: usize = 32;

/// Default pixel clock (50MHz / 3).
const DEFAULT_PIXEL_CLOCK: u32 = 50_000_000 / 3;

/// Largest picture handed to a frame sink in either direction.
const MAX_FRAME_SIZE: i32 = 2048;

/// Value of the status register at 0x14.
const STATUS_VALUE: u32 = 0x3FA;

// Register indices.
const REG_SCROLL: usize = 0x20 / 4;
const REG_LINE_INC: usize = 0x24 / 4;
const REG_PIXEL_INC: usize = 0x28 / 4;
const REG_CONTROL: usize = 0x30 / 4;
const REG_ORIGIN: usize = 0x34 / 4;

// Tile word fields.
const TILE_FLIP_X: u32 = 0x400000;
const TILE_FLIP_Y: u32 = 0x800000;

/// This trait receives the chip's interrupt-related outputs.
pub trait TilemapIrqLines {

    /// Called with the new vertical blank level.
    fn vblank(&mut self, state: bool);

    /// Called when the game acknowledges a screen interrupt, with the screen number.
    fn irq_cleared(&mut self, screen: u32);
}

/// Display timing in pixels and lines. Porches and widths come from the
/// registers as written, so a bad write can make them negative; the visible
/// area is derived from the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTiming {
    pub h_total: i32,
    pub h_visarea: i32,
    pub h_syncwidth: i32,
    pub h_frontporch: i32,
    pub h_backporch: i32,
    pub v_total: i32,
    pub v_visarea: i32,
    pub v_syncwidth: i32,
    pub v_frontporch: i32,
    pub v_backporch: i32,
    pub pixel_clock: u32,
}

impl DisplayTiming {

    /// 512x384 at 24kHz, the mode boot code expects before it programs the chip.
    fn new() -> Self {
        let mut timing = DisplayTiming {
            h_total: 644,
            h_visarea: 512,
            h_syncwidth: 40,
            h_frontporch: 0,
            h_backporch: 48,
            v_total: 428,
            v_visarea: 384,
            v_syncwidth: 6,
            v_frontporch: 0,
            v_backporch: 26,
            pixel_clock: DEFAULT_PIXEL_CLOCK,
        };
        timing.h_frontporch = timing.h_total - timing.h_backporch - timing.h_syncwidth - timing.h_visarea;
        timing.v_frontporch = timing.v_total - timing.v_backporch - timing.v_syncwidth - timing.v_visarea;
        timing
    }

    fn recompute(&mut self) {
        self.h_visarea = self.h_total - self.h_syncwidth - self.h_backporch - self.h_frontporch;
        self.v_visarea = self.v_total - self.v_syncwidth - self.v_backporch - self.v_frontporch;
    }

    pub fn visible_area(&self) -> Rect {
        Rect::new(
            0,
            0,
            self.h_visarea.clamp(1, MAX_FRAME_SIZE) - 1,
            self.v_visarea.clamp(1, MAX_FRAME_SIZE) - 1,
        )
    }

    pub fn line_period(&self) -> Time {
        Time::from_secs_f64(self.h_total.max(1) as f64 / self.pixel_clock.max(1) as f64)
    }

    pub fn frame_period(&self) -> Time {
        self.line_period() * self.v_total.max(1) as u64
    }

    /// Line the vertical blank starts on. It can fall before the top of the
    /// frame, in which case it wraps to the end of the previous one.
    pub fn vsync_start(&self) -> i32 {
        (self.v_syncwidth - self.v_backporch).rem_euclid(self.v_total.max(1))
    }

    pub fn vsync_stop(&self) -> i32 {
        self.v_backporch.rem_euclid(self.v_total.max(1))
    }
}

/// This struct models the 037122 tilemap chip: one rotatable and zoomable
/// 8bpp tilemap, either 128x128 or 256x64 tiles, a colour lookup table in tile
/// RAM and a programmable CRT controller.
pub struct K037122 {

    // Virtual time source and the vertical blank edges.
    clock: Clock,
    vsync_start_timer: EventTimer,
    vsync_stop_timer: EventTimer,
    frame_origin: Time,
    timing: DisplayTiming,

    // Memories.
    char_ram: Vec<u32>,
    tile_ram: Vec<u32>,
    reg: [u32; REG_WORDS],

    // Byte offsets into tile RAM.
    tilemap_base: u32,
    palette_base: u32,

    // Interrupt state.
    vblank: bool,
    vblank_irq_cleared: bool,

    map: AddressMap<K037122>,
    lines: Option<Box<dyn TilemapIrqLines>>,
    sink: Option<Box<dyn FrameSink>>,
}

/// Implementation functions for the tilemap chip.
impl K037122 {

    pub fn new(clock: Clock) -> Self {
        let mut chip = K037122 {

            // Setup timing.
            clock,
            vsync_start_timer: EventTimer::new(),
            vsync_stop_timer: EventTimer::new(),
            frame_origin: Time::ZERO,
            timing: DisplayTiming::new(),

            // Setup memories.
            char_ram: vec![0; CHAR_RAM_WORDS],
            tile_ram: vec![0; TILE_RAM_WORDS],
            reg: [0; REG_WORDS],

            tilemap_base: 0,
            palette_base: 0,

            vblank: false,
            vblank_irq_cleared: true,

            map: K037122::build_map(),
            lines: None,
            sink: None,
        };
        chip.reset();
        chip
    }

    fn build_map() -> AddressMap<K037122> {

        let mut map: AddressMap<K037122> = AddressMap::new(4);

        map.map(0x000, 0x3FF, Some(K037122::reg_r), Some(K037122::reg_w))
            .map_write(0x00, 0x0F, K037122::timing_w)
            .map_write(0x10, 0x17, K037122::irq_ack_w)
            .map_read(0x14, 0x17, K037122::status_r)
            .map_write(0x34, 0x37, K037122::clut_w);
        map
    }

    pub fn attach_lines(&mut self, lines: Box<dyn TilemapIrqLines>) {
        self.lines = Some(lines);
    }

    /// Attaches the sink that receives a rendered frame at every vertical blank.
    pub fn attach_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sink = Some(sink);
    }

    pub fn reset(&mut self) {

        self.char_ram.fill(0);
        self.tile_ram.fill(0);
        self.reg = [0; REG_WORDS];

        self.tilemap_base = 0;
        self.palette_base = 0;

        self.vblank = false;
        self.vblank_irq_cleared = true;
        self.vsync_stop_timer.reset();

        self.timing = DisplayTiming::new();
        self.recompute_video_timing();
    }

    /// Changes the pixel clock, which the game board may drive at other rates.
    pub fn set_pixel_clock(&mut self, hz: u32) {

        if hz != self.timing.pixel_clock {
            self.timing.pixel_clock = hz;
            self.recompute_video_timing();
        }
    }

    pub fn timing(&self) -> &DisplayTiming {
        &self.timing
    }

    pub fn vblank(&self) -> bool {
        self.vblank
    }

    pub fn palette_base(&self) -> u32 {
        self.palette_base
    }

    pub fn tilemap_base(&self) -> u32 {
        self.tilemap_base
    }

    /// Reads a word of tile RAM, which also holds the colour lookup table.
    pub fn sram_read(&self, offset: u32) -> u32 {
        self.tile_ram[offset as usize % TILE_RAM_WORDS]
    }

    pub fn sram_write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let word = &mut self.tile_ram[offset as usize % TILE_RAM_WORDS];
        *word = combine_data(*word, data, mem_mask);
    }

    /// Reads a word of the character RAM window, in the bank selected by 0x30.
    pub fn char_read(&self, offset: u32) -> u32 {
        self.char_ram[self.char_index(offset)]
    }

    pub fn char_write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let index = self.char_index(offset);
        self.char_ram[index] = combine_data(self.char_ram[index], data, mem_mask);
    }

    fn char_index(&self, offset: u32) -> usize {

        let bank = self.reg[REG_CONTROL].bits(0, 3) as usize;
        bank * CHAR_BANK_WORDS + (offset as usize % CHAR_BANK_WORDS)
    }

    /// Returns a colour lookup table entry as xRGB1555. Entries hold blue in bits
    /// 11 to 15, red in 6 to 10 and six bits of green in 0 to 5.
    pub fn palette_colour(&self, index: usize) -> u16 {

        let entry = self.tile_ram[(self.palette_base as usize / 4 + index % PALETTE_ENTRIES) % TILE_RAM_WORDS];
        pack_rgb555(entry.bits(6, 5), entry.bits(0, 6) >> 1, entry.bits(11, 5))
    }

    fn recompute_video_timing(&mut self) {

        self.timing.recompute();
        log::debug!(
            "k037122: screen {}x{} total {}x{}, vsync {}..{}, pixel clock {}",
            self.timing.h_visarea, self.timing.v_visarea, self.timing.h_total, self.timing.v_total,
            self.timing.vsync_start(), self.timing.vsync_stop(), self.timing.pixel_clock
        );

        let now = self.clock.now();
        self.frame_origin = now;
        let delay = self.time_until_line(now, self.timing.vsync_start());
        self.vsync_start_timer.adjust(now, delay);
    }

    /// Returns how long until the beam next reaches the start of `line`. A beam
    /// already there waits a whole frame.
    fn time_until_line(&self, now: Time, line: i32) -> Time {

        let frame = self.timing.frame_period().as_picos().max(1);
        let into_frame = (now - self.frame_origin).as_picos() % frame;
        let target = (self.timing.line_period() * line.max(0) as u64).as_picos();
        if target > into_frame {
            Time::from_picos(target - into_frame)
        } else {
            Time::from_picos(frame - into_frame + target)
        }
    }

    fn set_vblank(&mut self, state: bool) {

        self.vblank = state;
        if let Some(lines) = self.lines.as_mut() {
            lines.vblank(state);
        }
    }

    fn store(&mut self, reg: usize, data: u32, mem_mask: u32) {
        self.reg[reg] = combine_data(self.reg[reg], data, mem_mask);
    }

    fn reg_r(&mut self, index: u32, _mem_mask: u32) -> u32 {
        self.reg[index as usize]
    }

    fn reg_w(&mut self, index: u32, data: u32, mem_mask: u32) {
        self.store(index as usize, data, mem_mask);
    }

    fn status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        STATUS_VALUE
    }

    /// Each timing register holds two 16-bit fields, upper and lower lanes.
    fn timing_w(&mut self, index: u32, data: u32, mem_mask: u32) {

        let high = (mem_mask & 0xFFFF0000 != 0).then_some(data.bits(16, 16) as i32);
        let low = (mem_mask & 0x0000FFFF != 0).then_some(data.bits(0, 16) as i32);
        let timing = &mut self.timing;

        match index {
            0 => {
                if let Some(value) = high {
                    timing.h_total = value + 1;
                }
                if let Some(value) = low {
                    timing.h_syncwidth = value + 1;
                }
            },
            1 => {
                if let Some(value) = high {
                    timing.h_frontporch = value - 1;
                }
                if let Some(value) = low {
                    timing.h_backporch = value + 1;
                }
            },
            2 => {
                if let Some(value) = high {
                    timing.v_total = value + 1;
                }
                if let Some(value) = low {
                    timing.v_syncwidth = value + 1;
                }
            },
            _ => {
                if let Some(value) = high {
                    timing.v_frontporch = value;
                }
                if let Some(value) = low {
                    timing.v_backporch = value + 1;
                }
            },
        }

        self.recompute_video_timing();
        self.store(index as usize, data, mem_mask);
    }

    /// The low half of 0x10 acknowledges screen 0's interrupt and the high half
    /// of 0x14 screen 1's. An acknowledgement is only passed on while no
    /// vertical blank is outstanding.
    fn irq_ack_w(&mut self, index: u32, data: u32, mem_mask: u32) {

        let lanes = if index == 0 { 0x0000FFFF } else { 0xFFFF0000 };
        if mem_mask & lanes != 0 && self.vblank_irq_cleared {
            if let Some(lines) = self.lines.as_mut() {
                lines.irq_cleared(index);
            }
        }
        self.store(0x10 / 4 + index as usize, data, mem_mask);
    }

    /// Bit 2 moves the colour lookup table to 0x18000 and the tilemap to 0,
    /// otherwise the table is at 0 and the tilemap at 0x8000.
    fn clut_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        if mem_mask & 0x0000FFFF != 0 {
            let high_clut = data.is_set(2);
            self.palette_base = if high_clut { 0x18000 } else { 0 };
            self.tilemap_base = if high_clut { 0 } else { 0x8000 };
        }
        self.store(REG_ORIGIN, data, mem_mask);
    }

    /// Returns the pen at `(x, y)` of a character. Even columns are in the
    /// upper half of each word.
    fn char_pixel(&self, code: u32, x: u32, y: u32) -> u32 {

        let word = self.char_ram[(code as usize * CHAR_WORDS + y as usize * 4 + x as usize / 2) % CHAR_RAM_WORDS];
        if x & 1 == 0 {
            word.bits(16, 8)
        } else {
            word.bits(0, 8)
        }
    }

    /// Returns the colour at a pixel of the tilemap, or `None` where pen 0
    /// leaves it transparent.
    fn tilemap_pixel(&self, columns: u32, x: u32, y: u32) -> Option<u16> {

        let tile_index = (y / 8) * columns + (x / 8);
        let tile = self.tile_ram[(tile_index as usize + self.tilemap_base as usize / 4) % TILE_RAM_WORDS];

        let mut tile_x = x % 8;
        let mut tile_y = y % 8;
        if tile & TILE_FLIP_X != 0 {
            tile_x = 7 - tile_x;
        }
        if tile & TILE_FLIP_Y != 0 {
            tile_y = 7 - tile_y;
        }

        let pen = self.char_pixel(tile.bits(0, 14), tile_x, tile_y);
        if pen == 0 {
            return None;
        }
        Some(self.palette_colour((tile.bits(17, 5) * 256 + pen) as usize))
    }
}

impl VideoChip for K037122 {

    /// Draws the tilemap with its rotation and zoom. The start position is 12.4
    /// fixed point and the increments 4.12, both widened to 16.16 here.
    fn draw(&mut self, bitmap: &mut Bitmap, cliprect: &Rect) {

        let scrollx = (self.reg[REG_SCROLL] >> 16) as i16;
        let mut scrolly = self.reg[REG_SCROLL] as i16;
        let incxx = (self.reg[REG_PIXEL_INC] >> 16) as i16 as i32;
        let incxy = self.reg[REG_PIXEL_INC] as i16 as i32;
        let incyx = (self.reg[REG_LINE_INC] >> 16) as i16 as i32;
        let incyy = self.reg[REG_LINE_INC] as i16 as i32;
        let origin_at_zero = self.reg[REG_ORIGIN].is_set(16);

        // The 128x128 layout takes its line X increment unscaled.
        let (columns, rows, incyx) = if self.reg[REG_CONTROL].is_set(16) {
            if !origin_at_zero {
                scrolly = scrolly.wrapping_sub(0x2000);
            }
            (128, 128, incyx)
        } else {
            if !origin_at_zero {
                scrolly = scrolly.wrapping_sub(0x1000);
            }
            (256, 64, incyx << 4)
        };
        let (incxx, incxy, incyy) = (incxx << 4, incxy << 4, incyy << 4);

        let width = (columns * 8) << 16;
        let height = (rows * 8) << 16;

        let mut start_x = ((scrollx as i32) << 12)
            .wrapping_add(cliprect.min_x.wrapping_mul(incxx))
            .wrapping_add(cliprect.min_y.wrapping_mul(incyx));
        let mut start_y = ((scrolly as i32) << 12)
            .wrapping_add(cliprect.min_x.wrapping_mul(incxy))
            .wrapping_add(cliprect.min_y.wrapping_mul(incyy));

        for y in cliprect.min_y..=cliprect.max_y {
            let mut cx = start_x;
            let mut cy = start_y;
            for x in cliprect.min_x..=cliprect.max_x {
                if (cx as u32) < width && (cy as u32) < height {
                    let pixel = self.tilemap_pixel(columns, cx as u32 >> 16, cy as u32 >> 16);
                    if let Some(colour) = pixel {
                        bitmap.set_pixel(x, y, colour);
                    }
                }
                cx = cx.wrapping_add(incxx);
                cy = cy.wrapping_add(incxy);
            }
            start_x = start_x.wrapping_add(incyx);
            start_y = start_y.wrapping_add(incyy);
        }
    }
}

impl Bus for K037122 {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let address = self.map.byte_address(offset);
        match self.map.find_read(address) {
            Some((read, index)) => read(self, index, mem_mask) & mem_mask,
            None => unmapped_read(mem_mask),
        }
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset);
        match self.map.find_write(address) {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("k037122: unmapped write {:03x} = {:08x}", address, data),
        }
    }
}

impl Timed for K037122 {

    fn next_deadline(&self) -> Option<Time> {
        earliest([self.vsync_start_timer.next_fire(), self.vsync_stop_timer.next_fire()])
    }

    /// The blank starts with a rendered frame and ends by scheduling the next one.
    fn run_timers(&mut self, now: Time) {

        if self.vsync_start_timer.take_due(now) {
            let delay = self.time_until_line(now, self.timing.vsync_stop());
            self.vsync_stop_timer.adjust(now, delay);
            self.vblank_irq_cleared = false;
            self.set_vblank(true);

            if self.sink.is_some() {
                let visible = self.timing.visible_area();
                let mut frame = Bitmap::new(visible.max_x as usize + 1, visible.max_y as usize + 1);
                self.draw(&mut frame, &visible);
                if let Some(sink) = self.sink.as_mut() {
                    sink.present(&frame);
                }
            }
        }

        if self.vsync_stop_timer.take_due(now) {
            self.set_vblank(false);
            let delay = self.time_until_line(now, self.timing.vsync_start());
            self.vsync_start_timer.adjust(now, delay);
        }
    }
}
