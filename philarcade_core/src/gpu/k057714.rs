// SPDX-License-Identifier: GPL-3.0
// k057714.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{pack_rgb555, unpack_rgb555, VideoChip};
use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};
use crate::sinks::{Bitmap, FrameSink, Rect};
use crate::timer::{Clock, EventTimer, Time, Timed};
use philarcade_utility::{BitField, CustomInteger};

/// Size of video RAM in 32-bit words (32MiB).
pub const VRAM_WORDS: usize = 0x800000;

/// Width of one framebuffer line in 16-bit pixels.
pub const FB_PITCH: i64 = 1024;

/// Mask applied to every 16-bit VRAM address.
const VRAM16_MASK: u32 = (VRAM_WORDS as u32 * 2) - 1;

/// Commands a single display list invocation may run, sub-lists included.
const DISPLAY_LIST_LIMIT: usize = 0x1000;

/// Default pixel clock (25.175MHz).
const DEFAULT_PIXEL_CLOCK: u32 = 25_175_000;

// Indices into the unknown passthrough register file.
const UNKNOWN_0A: usize = 0;
const UNKNOWN_0C: usize = 1;
const UNKNOWN_0E: usize = 2;
const UNKNOWN_6C: usize = 3;

/// Splits a 32-bit access into the two 16-bit registers it covers. The chip
/// sits on a big-endian bus, so the register at the lower byte address is in
/// the upper lanes.
fn halves(data: u32, mem_mask: u32) -> [Option<u16>; 2] {
    [
        (mem_mask & 0xFFFF0000 != 0).then_some((data >> 16) as u16),
        (mem_mask & 0x0000FFFF != 0).then_some(data as u16),
    ]
}

/// Scales each channel of a pixel by `alpha / 16`, keeping the top bit.
fn scale_colour(pixel: u16, alpha: u32) -> u16 {

    let (r, g, b) = unpack_rgb555(pixel);
    pack_rgb555((r * alpha) >> 4, (g * alpha) >> 4, (b * alpha) >> 4) | (pixel & 0x8000)
}

/// Adds two pixels channel by channel with saturation. The top bit comes from `dst`.
fn add_colours(src: u16, dst: u16) -> u16 {

    let (sr, sg, sb) = unpack_rgb555(src);
    let (dr, dg, db) = unpack_rgb555(dst);
    pack_rgb555(sr + dr, sg + dg, sb + db) | (dst & 0x8000)
}

/// The command encoded in the top three bits of the first word of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Nop,
    CallList,
    EndList,
    FramebufferConfig,
    FillRect,
    DrawObject,
    DrawCharacter,
}

impl Command {

    fn decode(word: u32) -> Self {
        match word >> 29 {
            0 => Command::Nop,
            1 => Command::CallList,
            2 => Command::EndList,
            3 => Command::FramebufferConfig,
            4 => Command::FillRect,
            5 => Command::DrawObject,
            _ => Command::DrawCharacter,
        }
    }
}

/// A region of VRAM scanned out to a position on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayWindow {
    pub base: u32,
    pub width: u16,
    pub height: u16,
    pub x: u16,
    pub y: u16,
    pub enabled: bool,
    pub brightness: [u8; 2],
    pub brightness_flags: [bool; 2],
}

impl DisplayWindow {

    fn new() -> Self {
        DisplayWindow {
            base: 0,
            width: 0,
            height: 0,
            x: 0,
            y: 0,
            enabled: false,
            brightness: [16; 2],
            brightness_flags: [false; 2],
        }
    }
}

/// CRT controller timing, all in pixels or lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcTiming {
    pub h_visarea: u32,
    pub h_frontporch: u32,
    pub h_backporch: u32,
    pub h_syncpulse: u32,
    pub v_visarea: u32,
    pub v_frontporch: u32,
    pub v_backporch: u32,
    pub v_syncpulse: u32,
    pub pixel_clock: u32,
}

impl CrtcTiming {

    /// 640x480 at 25.175MHz, which is what boot code that never programs the
    /// CRTC expects.
    fn new() -> Self {
        CrtcTiming {
            h_visarea: 640,
            h_frontporch: 16,
            h_backporch: 48,
            h_syncpulse: 96,
            v_visarea: 480,
            v_frontporch: 10,
            v_backporch: 33,
            v_syncpulse: 2,
            pixel_clock: DEFAULT_PIXEL_CLOCK,
        }
    }

    pub fn htotal(&self) -> u32 {
        self.h_visarea + self.h_frontporch + self.h_backporch + self.h_syncpulse
    }

    pub fn vtotal(&self) -> u32 {
        self.v_visarea + self.v_frontporch + self.v_backporch + self.v_syncpulse
    }

    pub fn visible_area(&self) -> Rect {
        Rect::new(0, 0, self.h_visarea as i32 - 1, self.v_visarea as i32 - 1)
    }

    /// Returns the duration of one whole frame, blanking included.
    pub fn frame_period(&self) -> Time {
        let pixels = self.htotal() as f64 * self.vtotal() as f64;
        Time::from_secs_f64(pixels / self.pixel_clock.max(1) as f64)
    }
}

/// This struct models the 057714 GCU: a 2D drawing engine fed through two
/// command FIFOs or VRAM-resident display lists, plus four composited display
/// windows and a direct write port.
pub struct K057714 {

    // Virtual time source and the vertical blank cadence.
    clock: Clock,
    frame_timer: EventTimer,
    crtc: CrtcTiming,

    // Video RAM and its access ports.
    vram: Vec<u32>,
    vram_read_addr: u32,
    vram_fifo_addr: [u32; 2],
    vram_fifo_mode: [u16; 2],
    command_fifo: [[u32; 4]; 2],
    command_fifo_ptr: [usize; 2],

    // Scanout.
    windows: [DisplayWindow; 4],
    windows_disabled: bool,
    direct: DisplayWindow,
    direct_config: u16,
    priority: u16,
    mixbuffer: u16,
    bgcolor: u16,

    // Origin for relative drawing commands.
    fb_origin_x: u32,
    fb_origin_y: u32,

    // Interrupt control and line state.
    irqctrl: u16,
    irq: bool,

    // Registers stored but not interpreted.
    unknown: [u16; 4],

    map: AddressMap<K057714>,
    sink: Option<Box<dyn FrameSink>>,
}

/// Implementation functions for the GCU.
impl K057714 {

    pub fn new(clock: Clock) -> Self {
        let mut gpu = K057714 {

            // Setup timing.
            clock,
            frame_timer: EventTimer::new(),
            crtc: CrtcTiming::new(),

            // Setup video RAM.
            vram: vec![0; VRAM_WORDS],
            vram_read_addr: 0,
            vram_fifo_addr: [0; 2],
            vram_fifo_mode: [0; 2],
            command_fifo: [[0; 4]; 2],
            command_fifo_ptr: [0; 2],

            // Setup scanout.
            windows: [DisplayWindow::new(); 4],
            windows_disabled: false,
            direct: DisplayWindow::new(),
            direct_config: 0,
            priority: 0,
            mixbuffer: 0,
            bgcolor: 0,

            fb_origin_x: 0,
            fb_origin_y: 0,

            irqctrl: 0,
            irq: false,

            unknown: [0; 4],

            map: K057714::build_map(),
            sink: None,
        };
        gpu.reset();
        gpu
    }

    fn build_map() -> AddressMap<K057714> {

        let mut map: AddressMap<K057714> = AddressMap::new(4);

        map.map_write(0x00, 0x03, K057714::crtc_horizontal_w)
            .map_write(0x04, 0x07, K057714::crtc_vertical_w)
            .map_write(0x08, 0x0B, K057714::crtc_sync_w)
            .map_write(0x0C, 0x0F, K057714::unknown_0c_w)
            .map_write(0x10, 0x13, K057714::irq_priority_w)
            .map_write(0x14, 0x1B, K057714::brightness_w)
            .map_write(0x1C, 0x1F, K057714::direct_config_w);

        map.map_write(0x20, 0x2F, K057714::window_position_w)
            .map_write(0x30, 0x3F, K057714::window_size_w)
            .map_write(0x40, 0x4F, K057714::window_base_w);

        map.map_write(0x50, 0x53, K057714::direct_position_w)
            .map_write(0x54, 0x57, K057714::direct_size_w)
            .map_write(0x58, 0x5B, K057714::direct_base_w);

        map.map_write(0x5C, 0x5F, K057714::vram_read_addr_w)
            .map_write(0x60, 0x67, K057714::fifo_addr_w)
            .map_write(0x68, 0x6B, K057714::fifo_mode_w)
            .map_write(0x6C, 0x6F, K057714::mixbuffer_w)
            .map_write(0x70, 0x77, K057714::fifo_w)
            .map_read(0x78, 0x7B, K057714::status_r)
            .map_read(0x80, 0xFF, K057714::vram_r);

        map
    }

    /// Attaches the sink that receives a rendered frame at every vertical blank.
    pub fn attach_sink(&mut self, sink: Box<dyn FrameSink>) {
        self.sink = Some(sink);
    }

    /// Returns the chip to its power-on state.
    pub fn reset(&mut self) {

        self.crtc = CrtcTiming { pixel_clock: self.crtc.pixel_clock, ..CrtcTiming::new() };

        self.vram.fill(0);
        self.vram_read_addr = 0;
        self.vram_fifo_addr = [0; 2];
        self.vram_fifo_mode = [0; 2];
        self.command_fifo = [[0; 4]; 2];
        self.command_fifo_ptr = [0; 2];

        self.windows = [DisplayWindow::new(); 4];
        self.windows_disabled = false;
        self.direct = DisplayWindow::new();
        self.direct_config = 0;
        self.priority = 0;
        self.mixbuffer = 0;
        self.bgcolor = 0;

        self.fb_origin_x = 0;
        self.fb_origin_y = 0;

        self.irqctrl = 0;
        self.irq = false;
        self.unknown = [0; 4];

        self.crtc_changed();
    }

    /// Changes the pixel clock, which the game board may drive at other rates.
    pub fn set_pixel_clock(&mut self, hz: u32) {
        self.crtc.pixel_clock = hz;
        self.crtc_changed();
    }

    pub fn crtc(&self) -> &CrtcTiming {
        &self.crtc
    }

    pub fn windows(&self) -> &[DisplayWindow; 4] {
        &self.windows
    }

    pub fn direct_window(&self) -> &DisplayWindow {
        &self.direct
    }

    pub fn fb_origin(&self) -> (u32, u32) {
        (self.fb_origin_x, self.fb_origin_y)
    }

    pub fn background_colour(&self) -> u16 {
        self.bgcolor
    }

    /// Returns the level of the interrupt output.
    pub fn irq(&self) -> bool {
        self.irq
    }

    /// Returns one of the registers the chip stores without interpreting, by
    /// byte address.
    pub fn unknown_register(&self, address: u32) -> Option<u16> {

        match address {
            0x0A => Some(self.unknown[UNKNOWN_0A]),
            0x0C => Some(self.unknown[UNKNOWN_0C]),
            0x0E => Some(self.unknown[UNKNOWN_0E]),
            0x6C => Some(self.unknown[UNKNOWN_6C]),
            _ => None,
        }
    }

    /// Copies 32-bit words into VRAM, wrapping at the end.
    pub fn load_vram(&mut self, word_index: u32, words: &[u32]) {

        for (i, word) in words.iter().enumerate() {
            let index = (word_index as usize).wrapping_add(i) & (VRAM_WORDS - 1);
            self.vram[index] = *word;
        }
    }

    /// Reads one 16-bit pixel. Even addresses are the upper half of a word.
    pub fn vram16(&self, address: u32) -> u16 {

        let address = address & VRAM16_MASK;
        let word = self.vram[(address >> 1) as usize];
        if address & 1 == 0 {
            (word >> 16) as u16
        } else {
            word as u16
        }
    }

    fn set_vram16(&mut self, address: u32, value: u16) {

        let address = address & VRAM16_MASK;
        let word = &mut self.vram[(address >> 1) as usize];
        if address & 1 == 0 {
            *word = (*word & 0x0000FFFF) | ((value as u32) << 16);
        } else {
            *word = (*word & 0xFFFF0000) | value as u32;
        }
    }

    fn vram_word(&self, index: u32) -> u32 {
        self.vram[index as usize & (VRAM_WORDS - 1)]
    }

    fn crtc_changed(&mut self) {

        let period = self.crtc.frame_period();
        log::debug!(
            "k057714: screen {}x{} total {}x{}, frame {:?}",
            self.crtc.h_visarea, self.crtc.v_visarea, self.crtc.htotal(), self.crtc.vtotal(), period
        );
        self.frame_timer.adjust_periodic(self.clock.now(), period, period);
    }

    fn crtc_horizontal_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [visarea, porches] = halves(data, mem_mask);
        if let Some(visarea) = visarea {
            self.crtc.h_visarea = visarea as u32 + 1;
        }
        if let Some(porches) = porches {
            self.crtc.h_frontporch = porches.bits(8, 8) as u32 + 1;
            self.crtc.h_backporch = porches.bits(0, 8) as u32 + 1;
        }
        self.crtc_changed();
    }

    fn crtc_vertical_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [visarea, porches] = halves(data, mem_mask);
        if let Some(visarea) = visarea {
            self.crtc.v_visarea = visarea as u32 + 1;
        }
        if let Some(porches) = porches {
            self.crtc.v_frontporch = porches.bits(8, 8) as u32 + 1;
            self.crtc.v_backporch = porches.bits(0, 8) as u32 + 1;
        }
        self.crtc_changed();
    }

    fn crtc_sync_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [sync, unknown] = halves(data, mem_mask);
        if let Some(sync) = sync {
            self.crtc.h_syncpulse = sync.bits(8, 8) as u32 + 1;
            self.crtc.v_syncpulse = sync.bits(0, 8) as u32 + 1;
            self.crtc_changed();
        }
        if let Some(unknown) = unknown {
            log::trace!("k057714: unknown register 0a = {:04x}", unknown);
            self.unknown[UNKNOWN_0A] = unknown;
        }
    }

    fn unknown_0c_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [reg_0c, reg_0e] = halves(data, mem_mask);
        if let Some(value) = reg_0c {
            log::trace!("k057714: unknown register 0c = {:04x}", value);
            self.unknown[UNKNOWN_0C] = value;
        }
        if let Some(value) = reg_0e {
            log::trace!("k057714: unknown register 0e = {:04x}", value);
            self.unknown[UNKNOWN_0E] = value;
        }
    }

    fn irq_priority_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [irqctrl, priority] = halves(data, mem_mask);
        if let Some(irqctrl) = irqctrl {
            if !irqctrl.is_set(0) {
                self.irq = false;
            }
            self.irqctrl = irqctrl;
        }
        if let Some(priority) = priority {
            log::debug!("k057714: priority {:04x}", priority);
            self.priority = priority;
            for (i, window) in self.windows.iter_mut().enumerate() {
                window.enabled = priority.is_set(3 - i as u32);
            }
            self.windows_disabled = priority.is_set(4);
        }
    }

    fn brightness_w(&mut self, index: u32, data: u32, mem_mask: u32) {

        for (half, value) in halves(data, mem_mask).into_iter().enumerate() {
            let Some(value) = value else {
                continue;
            };
            let window = &mut self.windows[index as usize * 2 + half];
            for i in 0..2 {
                window.brightness[i] = value.bits(i as u32 * 5 + 2, 5) as u8;
                window.brightness_flags[i] = value.is_set(i as u32);
            }
        }
    }

    fn direct_config_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [config, bgcolor] = halves(data, mem_mask);
        if let Some(config) = config {
            // Opening the port restarts the write position.
            if config.is_set(0) && !self.direct_config.is_set(0) {
                self.direct.x = 0;
                self.direct.y = 0;
            }
            self.direct.enabled = config.is_set(0);
            self.direct_config = config;
        }
        if let Some(bgcolor) = bgcolor {
            self.bgcolor = bgcolor;
        }
    }

    fn window_position_w(&mut self, index: u32, data: u32, _mem_mask: u32) {

        let window = &mut self.windows[index as usize];
        window.x = data as u16;
        window.y = (data >> 16) as u16;
    }

    fn window_size_w(&mut self, index: u32, data: u32, mem_mask: u32) {

        let [height, width] = halves(data, mem_mask);
        let window = &mut self.windows[index as usize];
        if let Some(height) = height {
            window.height = height;
        }
        if let Some(width) = width {
            window.width = width;
        }
    }

    fn window_base_w(&mut self, index: u32, data: u32, _mem_mask: u32) {
        self.windows[index as usize].base = data;
    }

    fn direct_position_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.direct.x = data as u16;
        self.direct.y = (data >> 16) as u16;
    }

    fn direct_size_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [height, width] = halves(data, mem_mask);
        if let Some(height) = height {
            self.direct.height = height;
        }
        if let Some(width) = width {
            self.direct.width = width;
        }
    }

    fn direct_base_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.direct.base = data;
    }

    fn vram_read_addr_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.vram_read_addr = data >> 1;
    }

    fn fifo_addr_w(&mut self, index: u32, data: u32, _mem_mask: u32) {
        self.vram_fifo_addr[index as usize] = data >> 1;
    }

    fn fifo_mode_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        for (fifo, mode) in halves(data, mem_mask).into_iter().enumerate() {
            if let Some(mode) = mode {
                self.vram_fifo_mode[fifo] = mode;
            }
        }
    }

    fn mixbuffer_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let [unknown, mixbuffer] = halves(data, mem_mask);
        if let Some(unknown) = unknown {
            log::trace!("k057714: unknown register 6c = {:04x}", unknown);
            self.unknown[UNKNOWN_6C] = unknown;
        }
        if let Some(mixbuffer) = mixbuffer {
            self.mixbuffer = mixbuffer;
        }
    }

    fn fifo_w(&mut self, index: u32, data: u32, _mem_mask: u32) {

        let fifo = index as usize;
        if self.vram_fifo_mode[fifo] & 0x100 != 0 {

            // Command words execute in groups of four.
            self.command_fifo[fifo][self.command_fifo_ptr[fifo]] = data;
            self.command_fifo_ptr[fifo] += 1;
            if self.command_fifo_ptr[fifo] >= 4 {
                let command = self.command_fifo[fifo];
                log::trace!("k057714: fifo {} command {:08x?}", fifo, command);
                self.command_fifo_ptr[fifo] = 0;
                self.execute_command(command);
            }
        } else {
            let address = self.vram_fifo_addr[fifo] as usize & (VRAM_WORDS - 1);
            self.vram[address] = data;
            self.vram_fifo_addr[fifo] = self.vram_fifo_addr[fifo].wrapping_add(1);
        }
    }

    fn status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        // Bits 0 and 2 report room in FIFOs 0 and 1. The busy flags in bits 4
        // and 5 always read clear.
        let mut status = 0;
        if self.command_fifo_ptr[0] < 4 {
            status |= 0x1;
        }
        if self.command_fifo_ptr[1] < 4 {
            status |= 0x4;
        }
        ((self.irqctrl as u32) << 16) | status
    }

    fn vram_r(&mut self, index: u32, _mem_mask: u32) -> u32 {
        self.vram_word(self.vram_read_addr.wrapping_add(index))
    }

    /// Handles the vertical blank input. A rising edge raises the interrupt
    /// when it is enabled.
    pub fn vblank(&mut self, state: bool) {

        if state && self.irqctrl.is_set(0) {
            self.irq = true;
        }
    }

    /// Writes one pixel through the direct access port. The first write of
    /// every line is a dummy.
    pub fn direct_write(&mut self, data: u16) {

        if !self.direct.enabled {
            return;
        }

        if self.direct.x > 0 {
            let address = self.direct.base
                .wrapping_add(self.direct.y as u32 * FB_PITCH as u32)
                .wrapping_add(self.direct.x as u32 - 1);
            self.set_vram16(address, data);
        }
        self.direct.x = self.direct.x.wrapping_add(1);

        if self.direct.x as u32 > self.direct.width as u32 + 1 {
            self.direct.y = self.direct.y.wrapping_add(1);
            self.direct.x = 0;
        }
    }

    /// Executes one four-word command.
    pub fn execute_command(&mut self, cmd: [u32; 4]) {

        match Command::decode(cmd[0]) {
            Command::Nop | Command::EndList => (),
            Command::CallList => self.execute_display_list(cmd[0] & 0xFFFFFF),
            Command::FramebufferConfig => self.fb_config(cmd),
            Command::FillRect => self.fill_rect(cmd),
            Command::DrawObject => self.draw_object(cmd),
            Command::DrawCharacter => self.draw_character(cmd),
        }
    }

    /// Walks the display list at the given 16-bit VRAM address until its end
    /// marker. Sub-list calls run to completion before the caller continues,
    /// and the whole walk is bounded so a looping list cannot hang the machine.
    pub fn execute_display_list(&mut self, address: u32) {

        log::trace!("k057714: display list {:08x}", address);

        let mut returns: Vec<u32> = Vec::new();
        let mut address = address / 2;
        let mut executed = 0;

        loop {
            if address as usize >= VRAM_WORDS {
                match returns.pop() {
                    Some(resume) => {
                        address = resume;
                        continue;
                    },
                    None => break,
                }
            }
            if executed >= DISPLAY_LIST_LIMIT {
                log::warn!("k057714: display list stopped after {} commands", executed);
                break;
            }

            let cmd = [
                self.vram_word(address),
                self.vram_word(address + 1),
                self.vram_word(address + 2),
                self.vram_word(address + 3),
            ];
            address += 4;
            executed += 1;

            match Command::decode(cmd[0]) {
                Command::CallList => {
                    returns.push(address);
                    address = (cmd[0] & 0xFFFFFF) / 2;
                },
                Command::EndList => match returns.pop() {
                    Some(resume) => address = resume,
                    None => break,
                },
                _ => self.execute_command(cmd),
            }
        }
    }

    fn fb_config(&mut self, cmd: [u32; 4]) {

        log::trace!("k057714: fb config {:08x?}", cmd);
        self.fb_origin_x = cmd[2] & 0x3FF;
        self.fb_origin_y = cmd[3] & 0x3FFF;
    }

    fn fill_rect(&mut self, cmd: [u32; 4]) {

        let width = cmd[0].bits(0, 10) as i64 + 1;
        let height = cmd[0].bits(10, 10) as i64 + 1;
        let relative = cmd[0].is_set(28);

        let mut x = cmd[1].bits(0, 10) as i64;
        let mut y = cmd[1].bits(10, 14) as i64;

        // Meaning unknown; values of 0x20 or 0x40 are typical.
        let unk1 = cmd[0].bits(21, 7);
        let unk2 = (cmd[1].bits(24, 6) << 1) | cmd[0].bit(20);

        if relative {
            x += self.fb_origin_x as i64;
            y += self.fb_origin_y as i64;
        }

        let colours = [
            (cmd[2] >> 16) as u16,
            cmd[2] as u16,
            (cmd[3] >> 16) as u16,
            cmd[3] as u16,
        ];

        log::trace!(
            "k057714: fill rect x {} y {} w {} h {} unk1 {:02x} unk2 {:02x}",
            x, y, width, height, unk1, unk2
        );

        for j in y..y + height {
            for i in x..x + width {
                self.set_vram16((j * FB_PITCH + i) as u32, colours[(i & 3) as usize]);
            }
        }
    }

    fn draw_object(&mut self, cmd: [u32; 4]) {

        let mut address_x = cmd[0].bits(0, 10);
        let address_y = cmd[0].bits(10, 14);
        let relative = cmd[0].is_set(28);

        let mut x = cmd[1].bits(0, 10) as i64;
        let mut y = cmd[1].bits(10, 14) as i64;
        let xflip = cmd[1].is_set(26);
        let yflip = cmd[1].is_set(27);

        // Bits 28-29 pick the destination blend stage, 30-31 transparency.
        let flag_bit28 = cmd[1].is_set(28);
        let flag_bit29 = cmd[1].is_set(29);
        let flag_bit30 = cmd[1].is_set(30);
        let flag_bit31 = cmd[1].is_set(31);
        let trans_enable = flag_bit31 || flag_bit30;
        let trans_value = if flag_bit31 { 0x0000 } else { 0x8000 };

        let mut width = cmd[2].bits(0, 9) as i64 + 1;
        let xscale = (cmd[2].bits(10, 12) as i32).sign_extend(11) as i64;
        let alpha1_1 = cmd[2].bits(22, 5);
        let alpha1_2 = cmd[2].bits(27, 5);

        let mut height = cmd[3].bits(0, 10) as i64 + 1;
        let yscale = (cmd[3].bits(10, 12) as i32).sign_extend(11) as i64;
        let alpha2_1 = cmd[3].bits(22, 5);
        let alpha2_2 = cmd[3].bits(27, 5);

        // Which of each pair of alpha fields applies is not known for certain.
        let alpha1 = if flag_bit30 {
            alpha1_2
        } else if flag_bit31 {
            alpha1_1
        } else {
            16
        };
        let alpha2 = if flag_bit28 {
            alpha2_2
        } else if flag_bit29 {
            alpha2_1
        } else {
            16
        };

        if xscale == 0 || yscale == 0 {
            return;
        }

        if xflip && (4 - ((width - 1) % 4)) <= (address_x % 4) as i64 {
            address_x = address_x.wrapping_sub(4);
        }

        if yflip {
            y -= ((height * 64) - 1) / yscale - ((height - 1) * 64) / yscale;
        }

        if relative {
            x += self.fb_origin_x as i64;
            y += self.fb_origin_y as i64;
        }

        let address = (address_y << 10) | address_x;
        let orig_height = height;

        log::trace!(
            "k057714: draw object {:08x} x {} y {} w {} h {} scale {} {}",
            address, x, y, width, height, xscale, yscale
        );

        // Scales are 6.6 fixed point.
        width = (((width * 65536) / xscale) * 64) / 65536;
        height = (((height * 65536) / yscale) * 64) / 65536;

        if width <= 0 || height <= 0 {
            return;
        }

        let xinc = if xflip { -1 } else { 1 };
        let mut v = 0;
        for j in 0..height {
            let mut fbaddr = (j + y) * FB_PITCH + x;
            let row = if yflip { orig_height - 1 - (v >> 6) } else { v >> 6 };
            let index = address as i64 + row * FB_PITCH;

            if xflip {
                fbaddr += width - 1;
            }

            let mut u = 0;
            for _ in 0..width {
                let mut pixel = self.vram16((index + (u >> 6)) as u32);

                if !trans_enable || (pixel & 0x8000) == trans_value {
                    pixel = scale_colour(pixel, alpha1);
                    if flag_bit28 || flag_bit29 {
                        let dst = scale_colour(self.vram16(fbaddr as u32), alpha2);
                        pixel = add_colours(pixel, dst);
                    }
                    self.set_vram16(fbaddr as u32, pixel);
                }

                fbaddr += xinc;
                u += xscale;
            }
            v += yscale;
        }
    }

    fn draw_character(&mut self, cmd: [u32; 4]) {

        let x = (cmd[1] & 0x3FF) as i64;
        let y = ((cmd[1] >> 10) & 0x3FFF) as i64;
        let mut address = cmd[0] & 0xFFFFFF;

        let width = (cmd[0].bits(24, 5) + 1) * 8;
        let height = (cmd[1].bits(24, 5) + 1) * 8;

        let colours = [
            (cmd[2] >> 16) as u16,
            cmd[2] as u16,
            (cmd[3] >> 16) as u16,
            cmd[3] as u16,
        ];

        if width > 8 || height > 16 {
            log::error!("k057714: unsupported character size {}x{}", width, height);
            debug_assert!(width <= 8 && height <= 16, "unsupported character size {}x{}", width, height);
            return;
        }

        for j in 0..height as i64 {
            let fbaddr = (y + j) * FB_PITCH + x;
            let line = self.vram16(address);
            address = address.wrapping_add(4);

            for i in 0..8 {
                let p = line.bits((7 - i) * 2, 2) as usize;
                self.set_vram16((fbaddr + i as i64) as u32, colours[p]);
            }
        }
    }

    fn draw_window(&self, index: usize, bitmap: &mut Bitmap, cliprect: &Rect, inverse_trans: bool) {

        let window = &self.windows[index];
        let mut height = window.height as i32 + 1;
        let mut width = window.width as i32 + 1;
        let trans_value = if inverse_trans { 0x8000 } else { 0x0000 };

        // A zero size means the window runs to the edge of the clip area.
        if window.height == 0 || window.y as i32 + height > cliprect.max_y {
            height = cliprect.max_y - window.y as i32;
        }
        if window.width == 0 || window.x as i32 + width > cliprect.max_x {
            width = cliprect.max_x - window.x as i32;
        }

        for j in 0..height {
            let line = window.base.wrapping_add((j as i64 * FB_PITCH) as u32);
            for i in 0..width {
                let pixel = self.vram16(line.wrapping_add(i as u32));
                if pixel & 0x8000 == trans_value {
                    continue;
                }

                let (mut r, mut g, mut b) = unpack_rgb555(pixel);
                for brightness in window.brightness {
                    r = (r * brightness as u32) >> 4;
                    g = (g * brightness as u32) >> 4;
                    b = (b * brightness as u32) >> 4;
                }
                bitmap.set_pixel(window.x as i32 + i, window.y as i32 + j, pack_rgb555(r, g, b));
            }
        }
    }
}

impl VideoChip for K057714 {

    /// Composites the enabled windows in priority order. Slot `i` of the
    /// priority register names the window drawn `i`-th.
    fn draw(&mut self, bitmap: &mut Bitmap, cliprect: &Rect) {

        bitmap.fill(0, cliprect);

        if self.windows_disabled {
            return;
        }

        let inverse_trans = (self.mixbuffer & 0x0F) != 0 && self.mixbuffer != 0xFFF;

        for slot in 0..4 {
            let window = self.priority.bits(8 + slot * 2, 2) as usize;
            if self.priority.is_set(3 - window as u32) {
                self.draw_window(window, bitmap, cliprect, inverse_trans);
            }
        }
    }
}

impl Bus for K057714 {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let address = self.map.byte_address(offset);
        let handler = self.map.find_read(address);
        match handler {
            Some((read, index)) => read(self, index, mem_mask) & mem_mask,
            None => unmapped_read(mem_mask),
        }
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset);
        let handler = self.map.find_write(address);
        match handler {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("k057714: unmapped write {:02x} = {:08x}", address, data),
        }
    }
}

impl Timed for K057714 {

    fn next_deadline(&self) -> Option<Time> {
        self.frame_timer.next_fire()
    }

    /// Each frame ends in a vertical blank, where the picture is handed to the
    /// sink and the interrupt is raised.
    fn run_timers(&mut self, now: Time) {

        if !self.frame_timer.take_due(now) {
            return;
        }

        if self.sink.is_some() {
            let visible = self.crtc.visible_area();
            let mut frame = Bitmap::new(self.crtc.h_visarea as usize, self.crtc.v_visarea as usize);
            self.draw(&mut frame, &visible);
            if let Some(sink) = self.sink.as_mut() {
                sink.present(&frame);
            }
        }
        self.vblank(true);
    }
}
