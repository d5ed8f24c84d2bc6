// SPDX-License-Identifier: GPL-3.0
// king_qtaro.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::Qtaro;
use crate::bus::address_map::AddressMap;
use crate::bus::{combine_data, unmapped_read, Bus};
use crate::timer::{Clock, EventTimer, Time, Timed};
use philarcade_utility::BitField;

/// Number of Qtaro boards behind the card, one per screen.
pub const QTARO_COUNT: usize = 3;

/// Cadence of the DMA engine while all three streams are running.
pub const DMA_TIMER_PERIOD: Time = Time::from_micros(250);

/// Bytes moved per stream per DMA tick.
const DMA_BURST_BYTES: u32 = 64;

/// Size of each of the byte-wide event register banks.
const EVENT_BYTES: usize = 5;

/// Interrupt register bit that reads set while any DMA is running.
const INT_DMA_BUSY: u32 = 0x10;

/// Low bits of event I/O byte 0, which read set once the Qtaro firmware is loaded.
const EVENT_IO_READY: u8 = 0b111;

/// This trait is the host memory the card bus-masters descriptors and stream
/// data out of.
pub trait DmaMemory {

    fn read_dword(&mut self, address: u32) -> u32;

    fn read_byte(&mut self, address: u32) -> u8;
}

/// Reads the bytes of `bank` that fall in dword `index`, on the lanes selected
/// by `mem_mask`. Byte 0 of each dword is in the low lane.
fn read_lanes(bank: &[u8], index: u32, mem_mask: u32) -> u32 {

    let mut value = 0;
    for lane in 0..4 {
        if (mem_mask >> (lane * 8)) & 0xFF == 0 {
            continue;
        }
        let byte = bank.get(index as usize * 4 + lane).copied().unwrap_or(0);
        value |= (byte as u32) << (lane * 8);
    }
    value
}

/// Writes the lanes selected by `mem_mask` into `bank`. Lanes past the end of
/// the bank are ignored.
fn write_lanes(bank: &mut [u8], index: u32, data: u32, mem_mask: u32) {

    for lane in 0..4 {
        if (mem_mask >> (lane * 8)) & 0xFF == 0 {
            continue;
        }
        if let Some(byte) = bank.get_mut(index as usize * 4 + lane) {
            *byte = data.bits(lane as u32 * 8, 8) as u8;
        }
    }
}

/// This struct models the King Qtaro PCI card: it streams MPEG video to three
/// Qtaro boards by walking descriptor chains in host memory, and carries the
/// event, interrupt and firmware upload registers the driver polls.
pub struct KingQtaro {

    // Virtual time source and the DMA cadence.
    clock: Clock,
    dma_timer: EventTimer,

    qtaro: [Qtaro; QTARO_COUNT],
    dma_memory: Option<Box<dyn DmaMemory>>,

    // Interrupt and event registers.
    int_reg: u32,
    int_fpga: u32,
    event: u32,
    event_mask: u32,
    event_io: [u8; EVENT_BYTES],
    event_io_mask: [u8; EVENT_BYTES],
    event_unk: [u8; EVENT_BYTES],

    // Per-stream DMA state.
    dma_running: [bool; QTARO_COUNT],
    dma_descriptor_addr: [u32; QTARO_COUNT],
    dma_descriptor_length: [u32; QTARO_COUNT],

    // Video control, and when it was last written.
    last_video_control: u16,
    video_last_update: Option<Time>,

    map: AddressMap<KingQtaro>,
}

/// Implementation functions for the King Qtaro card.
impl KingQtaro {

    pub fn new(clock: Clock) -> Self {
        let mut card = KingQtaro {

            // Setup timing.
            clock,
            dma_timer: EventTimer::new(),

            // Setup boards.
            qtaro: [Qtaro::new(), Qtaro::new(), Qtaro::new()],
            dma_memory: None,

            int_reg: 0,
            int_fpga: 0,
            event: 0,
            event_mask: 0,
            event_io: [0; EVENT_BYTES],
            event_io_mask: [0; EVENT_BYTES],
            event_unk: [0; EVENT_BYTES],

            dma_running: [false; QTARO_COUNT],
            dma_descriptor_addr: [0; QTARO_COUNT],
            dma_descriptor_length: [0; QTARO_COUNT],

            last_video_control: 0,
            video_last_update: None,

            map: KingQtaro::build_map(),
        };
        card.reset();
        card
    }

    fn build_map() -> AddressMap<KingQtaro> {

        let mut map: AddressMap<KingQtaro> = AddressMap::new(4);

        map.map_read(0x10, 0x13, KingQtaro::qtaro_reg2_r::<0>)
            .map(0x18, 0x1B, Some(KingQtaro::qtaro_reg3_r::<0>), Some(KingQtaro::qtaro_reg3_w::<0>))
            .map_read(0x20, 0x23, KingQtaro::qtaro_reg2_r::<1>)
            .map(0x28, 0x2B, Some(KingQtaro::qtaro_reg3_r::<1>), Some(KingQtaro::qtaro_reg3_w::<1>))
            .map_read(0x30, 0x33, KingQtaro::qtaro_reg2_r::<2>)
            .map(0x38, 0x3B, Some(KingQtaro::qtaro_reg3_r::<2>), Some(KingQtaro::qtaro_reg3_w::<2>));

        map.map_write(0x50, 0x53, KingQtaro::dma_requested_w::<0>)
            .map_write(0x54, 0x57, KingQtaro::dma_descriptor_addr_w::<0>)
            .map(0x58, 0x5B, Some(KingQtaro::dma_running_r::<0>), Some(KingQtaro::dma_running_w::<0>))
            .map_write(0x60, 0x63, KingQtaro::dma_requested_w::<1>)
            .map_write(0x64, 0x67, KingQtaro::dma_descriptor_addr_w::<1>)
            .map(0x68, 0x6B, Some(KingQtaro::dma_running_r::<1>), Some(KingQtaro::dma_running_w::<1>))
            .map_write(0x70, 0x73, KingQtaro::dma_requested_w::<2>)
            .map_write(0x74, 0x77, KingQtaro::dma_descriptor_addr_w::<2>)
            .map(0x78, 0x7B, Some(KingQtaro::dma_running_r::<2>), Some(KingQtaro::dma_running_w::<2>));

        map.map(0x80, 0x83, Some(KingQtaro::firmware_status_r), Some(KingQtaro::firmware_w))
            .map(0x84, 0x87, Some(KingQtaro::firmware_done_r), Some(KingQtaro::firmware_w))
            .map(0x88, 0x8B, Some(KingQtaro::firmware_status_r), Some(KingQtaro::firmware_w))
            .map(0x8C, 0x8F, Some(KingQtaro::firmware_done_r), Some(KingQtaro::firmware_w));

        map.map(0x90, 0x97, Some(KingQtaro::event_io_r), Some(KingQtaro::event_io_w))
            .map(0x98, 0x9F, Some(KingQtaro::event_unk_r), Some(KingQtaro::event_unk_w))
            .map(0xA0, 0xA7, Some(KingQtaro::event_io_mask_r), Some(KingQtaro::event_io_mask_w))
            .map(0xA8, 0xAB, Some(KingQtaro::event_mask_r), Some(KingQtaro::event_mask_w))
            .map(0xAC, 0xAF, Some(KingQtaro::event_r), Some(KingQtaro::event_w));

        map.map(0xB0, 0xB3, Some(KingQtaro::qtaro_reg_r), Some(KingQtaro::qtaro_reg_w))
            .map(0xB4, 0xB7, Some(KingQtaro::int_r), Some(KingQtaro::int_w))
            .map(0xB8, 0xBB, Some(KingQtaro::int_fpga_r), Some(KingQtaro::int_fpga_w));

        map
    }

    /// Attaches the host memory descriptors and stream data are fetched from.
    pub fn attach_dma_memory(&mut self, memory: Box<dyn DmaMemory>) {
        self.dma_memory = Some(memory);
    }

    pub fn reset(&mut self) {

        self.dma_timer.reset();
        for qtaro in self.qtaro.iter_mut() {
            qtaro.reset();
        }

        self.int_reg = 0;
        self.int_fpga = 0;
        self.event = 0;
        self.event_mask = 0;
        self.event_io = [0; EVENT_BYTES];
        self.event_io_mask = [0; EVENT_BYTES];
        self.event_unk = [0; EVENT_BYTES];

        self.dma_running = [false; QTARO_COUNT];
        self.dma_descriptor_addr = [0; QTARO_COUNT];
        self.dma_descriptor_length = [0; QTARO_COUNT];

        self.last_video_control = 0;
        self.video_last_update = None;
    }

    pub fn qtaro(&self, index: usize) -> &Qtaro {
        &self.qtaro[index]
    }

    pub fn qtaro_mut(&mut self, index: usize) -> &mut Qtaro {
        &mut self.qtaro[index]
    }

    pub fn is_dma_running(&self, index: usize) -> bool {
        self.dma_running[index]
    }

    pub fn dma_descriptor_addr(&self, index: usize) -> u32 {
        self.dma_descriptor_addr[index]
    }

    /// Written by the sub-board. Bits 0, 2 and 4 blank the movie on each
    /// screen when set. Every write also advances the decoders by the virtual
    /// time since the previous write.
    pub fn video_control_w(&mut self, data: u16) {

        let now = self.clock.now();
        let elapsed = self.video_last_update.map(|last| now - last);
        self.video_last_update = Some(now);

        log::debug!("king qtaro: video control {:04x}", data);

        for (i, qtaro) in self.qtaro.iter_mut().enumerate() {
            let is_enabled = !data.is_set(i as u32 * 2);
            let was_enabled = !self.last_video_control.is_set(i as u32 * 2);

            if !is_enabled && was_enabled {
                self.dma_descriptor_addr[i] = 0;
                self.dma_descriptor_length[i] = 0;
                self.dma_running[i] = false;
                qtaro.reset_stream();
            }

            qtaro.set_video_decode_enabled(is_enabled);

            if let Some(elapsed) = elapsed {
                qtaro.update_frame(elapsed.as_secs_f64());
            }
        }

        self.last_video_control = data;
    }

    fn qtaro_reg2_r<const N: usize>(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.qtaro[N].reg2_r() as u32
    }

    fn qtaro_reg3_r<const N: usize>(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.qtaro[N].reg3_r()
    }

    fn qtaro_reg3_w<const N: usize>(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.qtaro[N].reg3_w(data);
    }

    /// Byte 1 of the dword is board 0's control register, byte 2 board 1's and
    /// byte 3 board 2's.
    fn qtaro_reg_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        self.qtaro.iter()
            .enumerate()
            .fold(0, |value, (i, qtaro)| value | (qtaro.reg_r() as u32) << ((i + 1) * 8))
    }

    fn qtaro_reg_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        for (i, qtaro) in self.qtaro.iter_mut().enumerate() {
            let shift = (i as u32 + 1) * 8;
            if mem_mask.bits(shift, 8) != 0 {
                qtaro.reg_w(data.bits(shift, 8) as u8);
            }
        }
    }

    /// Writing exactly 1 requests a stream. Once all three are requested the
    /// DMA engine starts ticking.
    fn dma_requested_w<const N: usize>(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let was_running = self.dma_running[N];
        self.dma_running[N] = data == 1;

        log::debug!("king qtaro: dma {} requested {:08x}", N, data);

        if self.dma_running[N] && !was_running && self.dma_running.iter().all(|running| *running) {
            log::debug!("king qtaro: dma transfers started");
            self.dma_timer.adjust_periodic(self.clock.now(), DMA_TIMER_PERIOD, DMA_TIMER_PERIOD);
        }
    }

    fn dma_descriptor_addr_w<const N: usize>(&mut self, _index: u32, data: u32, mem_mask: u32) {

        log::debug!("king qtaro: dma {} descriptor {:08x}", N, data);
        self.dma_descriptor_addr[N] = combine_data(self.dma_descriptor_addr[N], data, mem_mask);
        self.dma_descriptor_length[N] = 0;
    }

    /// The driver won't queue another descriptor while bit 0 is set.
    fn dma_running_r<const N: usize>(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.dma_running[N] as u32
    }

    /// Only ever written with 0 while tearing a stream down, which the card
    /// ignores.
    fn dma_running_w<const N: usize>(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        log::debug!("king qtaro: dma {} running write {:08x} ignored", N, data);
    }

    /// Bit 8 would mean an upload is still in progress. Uploads are instant here.
    fn firmware_status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        0
    }

    /// Reads 1 once the last byte of an upload has been accepted.
    fn firmware_done_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        1
    }

    fn firmware_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        log::trace!("king qtaro: firmware write {:08x}", data);
    }

    fn event_io_r(&mut self, index: u32, mem_mask: u32) -> u32 {

        let mut bank = self.event_io;
        bank[0] |= EVENT_IO_READY;
        read_lanes(&bank, index, mem_mask)
    }

    fn event_io_w(&mut self, index: u32, data: u32, mem_mask: u32) {
        write_lanes(&mut self.event_io, index, data, mem_mask);
    }

    fn event_unk_r(&mut self, index: u32, mem_mask: u32) -> u32 {
        read_lanes(&self.event_unk, index, mem_mask)
    }

    fn event_unk_w(&mut self, index: u32, data: u32, mem_mask: u32) {
        write_lanes(&mut self.event_unk, index, data, mem_mask);
    }

    fn event_io_mask_r(&mut self, index: u32, mem_mask: u32) -> u32 {
        read_lanes(&self.event_io_mask, index, mem_mask)
    }

    fn event_io_mask_w(&mut self, index: u32, data: u32, mem_mask: u32) {
        write_lanes(&mut self.event_io_mask, index, data, mem_mask);
    }

    fn event_mask_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.event_mask
    }

    /// 0xe0e00 is written while the driver waits on board events, which it never
    /// actually listens for.
    fn event_mask_w(&mut self, _index: u32, data: u32, mem_mask: u32) {
        self.event_mask = combine_data(self.event_mask, data, mem_mask);
    }

    fn event_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.event
    }

    fn event_w(&mut self, _index: u32, data: u32, mem_mask: u32) {
        self.event = combine_data(self.event, data, mem_mask);
    }

    fn int_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let mut value = self.int_reg & !INT_DMA_BUSY;
        if self.dma_running.iter().any(|running| *running) {
            value |= INT_DMA_BUSY;
        }
        value
    }

    fn int_w(&mut self, _index: u32, data: u32, mem_mask: u32) {
        self.int_reg = combine_data(self.int_reg, data, mem_mask);
    }

    fn int_fpga_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.int_fpga
    }

    fn int_fpga_w(&mut self, _index: u32, data: u32, mem_mask: u32) {
        self.int_fpga = combine_data(self.int_fpga, data, mem_mask);
    }

    /// Moves one burst for every running stream. A descriptor is four dwords:
    /// next descriptor, length, buffer address and flags. A descriptor address
    /// with bit 0 set ends the chain.
    fn dma_tick(&mut self) {

        if !self.dma_running.iter().any(|running| *running) {
            self.dma_timer.reset();
            return;
        }

        let Some(memory) = self.dma_memory.as_mut() else {
            log::warn!("king qtaro: dma running with no host memory attached");
            return;
        };

        for (i, qtaro) in self.qtaro.iter_mut().enumerate() {
            let descriptor = self.dma_descriptor_addr[i];
            if !self.dma_running[i] || descriptor.is_set(0) {
                continue;
            }

            let next = memory.read_dword(descriptor);
            let length = memory.read_dword(descriptor.wrapping_add(4));
            let buffer = memory.read_dword(descriptor.wrapping_add(8));
            let done = self.dma_descriptor_length[i];
            let burst = length.saturating_sub(done).min(DMA_BURST_BYTES);

            log::trace!("king qtaro: dma {} copy {:08x}: {:08x} bytes", i, buffer.wrapping_add(done), burst);

            for offset in done..done + burst {
                qtaro.write(memory.read_byte(buffer.wrapping_add(offset)));
            }
            self.dma_descriptor_length[i] = done + burst;

            if self.dma_descriptor_length[i] >= length {
                log::trace!("king qtaro: dma {} descriptor {:08x} -> {:08x}", i, descriptor, next);
                self.dma_descriptor_addr[i] = next;
                self.dma_descriptor_length[i] = 0;
            }
        }

        if self.dma_descriptor_addr.iter().all(|addr| addr.is_set(0)) {
            log::debug!("king qtaro: dma transfers finished");
            self.dma_running = [false; QTARO_COUNT];
        }
    }
}

impl Bus for KingQtaro {

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
            None => log::warn!("king qtaro: unmapped write {:02x} = {:08x}", address, data),
        }
    }
}

impl Timed for KingQtaro {

    fn next_deadline(&self) -> Option<Time> {
        self.dma_timer.next_fire()
    }

    fn run_timers(&mut self, now: Time) {

        if self.dma_timer.take_due(now) {
            self.dma_tick();
        }
    }
}
