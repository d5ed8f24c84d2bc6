// SPDX-License-Identifier: GPL-3.0
// k573_dio.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::VecDeque;

use bitflags::bitflags;

use super::mpeg_crypto::MpegKeys;
use super::{DigitalId, DioOutputs, MpegAudioDecoder, NetworkLink};
use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};
use crate::timer::{earliest, Clock, EventTimer, Time, Timed};
use philarcade_utility::BitField;

/// Number of firmware bits the FPGA expects before it starts running.
pub const FPGA_PROM_SIZE_BITS: u32 = 330_696;

/// Mask applied to every RAM and MPEG byte address.
const FPGA_RAM_MASK: u32 = 0x1FF_FFFE;

/// Size of the board's sample RAM, in 16-bit words.
pub const RAM_WORDS: usize = 0x1800000 / 2;

/// Power-on RAM holds alternating blocks of this many words.
const RAM_FILL_BLOCK_WORDS: usize = 0x1000 / 2;

/// Power-on value of the FPGA status register.
const FPGA_STATUS_RESET: u16 = 0x8FFF;

/// Registers below this byte address stay closed until the firmware is loaded.
const FPGA_STATUS_BASE: u32 = 0xF0;

/// Marker byte that opens and closes every network packet.
const FRAME_MARKER: u8 = 0xC0;

/// Maximum number of attached network links.
pub const NETWORK_CONNECTIONS: usize = 3;

/// Network poll rate.
const NETWORK_POLL_HZ: f64 = 300.0;

/// Line order within each output latch.
const OUTPUT_SHIFT: [u32; 4] = [0, 2, 3, 1];

bitflags! {
    /// MPEG control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MpegControl: u16 {
        /// Allows data to be decrypted. Nothing reaches the decoder without it.
        const ENABLE = 1 << 13;
        /// Allows data to be streamed to the decoder.
        const STREAMING_ENABLE = 1 << 14;
        /// Allows the frame counter to count frame syncs. Clearing it resets the counter.
        const FRAME_COUNTER_ENABLE = 1 << 15;
    }
}

bitflags! {
    /// MPEG playback status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MpegStatus: u16 {
        const DEMAND = 1 << 12;
        const IDLE = 1 << 13;
        const PLAYING = 1 << 14;
        const ENABLED = 1 << 15;
    }
}

/// The FPGA firmware the board runs. The ddrsbm firmware uses a different
/// cipher, has no timer high register and ignores keys 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioVariant {
    Standard,
    Ddrsbm,
}

/// One attached network link and its partially received packet.
struct NetworkPort {
    link: Box<dyn NetworkLink>,
    input: Vec<u8>,
}

/// Accumulates one byte of a `C0 ... C0` framed stream. Returns the packet,
/// markers included, once it closes. An empty `C0 C0` packet is corrupt: its
/// first marker is dropped and the second opens a new packet.
fn frame_byte(buffer: &mut Vec<u8>, byte: u8) -> Option<Vec<u8>> {

    if buffer.is_empty() && byte != FRAME_MARKER {
        return None;
    }

    buffer.push(byte);

    if byte != FRAME_MARKER || buffer.len() <= 1 {
        return None;
    }

    if buffer.len() == 2 {
        buffer.remove(0);
        return None;
    }

    Some(std::mem::take(buffer))
}

/// This struct models the Konami 573 digital I/O board: an FPGA that must be
/// handshaken and loaded with firmware, a RAM window, an MPEG streaming engine
/// with on-the-fly decryption and a playback timer, a small packet network, and
/// output latches.
pub struct K573Dio {

    // Virtual time source and firmware flavour.
    clock: Clock,
    variant: DioVariant,
    map: AddressMap<K573Dio>,

    // RAM window.
    ram: Vec<u16>,
    ram_addr: u32,
    last_valid_ram_read: u16,

    // FPGA handshake.
    fpga_status: u16,
    fpga_initialised: bool,
    firmware_bits_received: u32,
    fpga_pre_init: bool,

    // Output latches.
    output_data: [u16; 8],

    // MPEG streaming.
    mpeg_current_addr: u32,
    mpeg_end_addr: u32,
    mpeg_ctrl: MpegControl,
    mpeg_status: MpegStatus,
    mpeg_frame_counter: u16,
    mpeg_current_has_ended: bool,
    keys: MpegKeys,
    mp3_remaining_bytes: u32,
    mp3_data: u16,

    // MPEG playback timer.
    mpeg_timer: u32,
    mpeg_timer_base: u32,
    mpeg_timer_enabled: bool,
    mpeg_timer_frequency: u32,
    mpeg_timer_frequency_div: u32,
    mpeg_timer_last_update: Time,

    digital_id_cached: u16,

    // Network.
    network_id: u16,
    network_ports: Vec<NetworkPort>,
    network_muxed: VecDeque<u8>,
    network_output: Vec<u8>,
    network_output_queue: VecDeque<Vec<u8>>,
    network_output_waiting: usize,

    // Timers.
    stream_timer: EventTimer,
    frame_timer: EventTimer,
    network_timer: EventTimer,

    // Collaborators.
    decoder: Option<Box<dyn MpegAudioDecoder>>,
    outputs: Option<Box<dyn DioOutputs>>,
    digital_id: Option<Box<dyn DigitalId>>,
}

/// Implementation functions for the digital I/O board itself.
impl K573Dio {

    /// Creates a board running the given firmware flavour, in its power-on state.
    pub fn new(clock: Clock, variant: DioVariant) -> Self {
        let mut dio = K573Dio {

            // Setup time source and register map.
            clock,
            variant,
            map: Self::build_map(),

            // Setup RAM window.
            ram: vec![0; RAM_WORDS],
            ram_addr: 0,
            last_valid_ram_read: 0,

            // Setup FPGA handshake.
            fpga_status: FPGA_STATUS_RESET,
            fpga_initialised: false,
            firmware_bits_received: 0,
            fpga_pre_init: false,

            output_data: [0; 8],

            // Setup MPEG streaming.
            mpeg_current_addr: 0,
            mpeg_end_addr: 0,
            mpeg_ctrl: MpegControl::empty(),
            mpeg_status: MpegStatus::IDLE,
            mpeg_frame_counter: 0,
            mpeg_current_has_ended: false,
            keys: MpegKeys::new(),
            mp3_remaining_bytes: 0,
            mp3_data: 0,

            // Setup MPEG playback timer.
            mpeg_timer: 0,
            mpeg_timer_base: 0,
            mpeg_timer_enabled: true,
            mpeg_timer_frequency: 32000,
            mpeg_timer_frequency_div: 0,
            mpeg_timer_last_update: Time::ZERO,

            digital_id_cached: 0,

            // Setup network.
            network_id: 0,
            network_ports: Vec::new(),
            network_muxed: VecDeque::new(),
            network_output: Vec::new(),
            network_output_queue: VecDeque::new(),
            network_output_waiting: 0,

            // Setup timers.
            stream_timer: EventTimer::new(),
            frame_timer: EventTimer::new(),
            network_timer: EventTimer::new(),

            decoder: None,
            outputs: None,
            digital_id: None,
        };
        dio.reset();
        dio
    }

    fn build_map() -> AddressMap<K573Dio> {

        let mut map: AddressMap<K573Dio> = AddressMap::new(2);

        // Everything reads 0xffff until the firmware is running.
        map.map_read(0x00, 0xFF, K573Dio::dummy_r::<0xFFFF>);

        map.map_read(0xF0, 0xFF, K573Dio::fpga_status_r)
            .map_write(0xF6, 0xF7, K573Dio::fpga_status_w)
            .map_write(0xF8, 0xF9, K573Dio::fpga_firmware_w);

        map.map_read(0x80, 0x8F, K573Dio::dummy_r::<0x1234>)
            .map_read(0x90, 0x9F, K573Dio::dummy_r::<0x1234>)
            .map_write(0x90, 0x91, K573Dio::network_id_w);

        map.map(0xA0, 0xA1, Some(K573Dio::mpeg_current_adr_high_r), Some(K573Dio::mpeg_current_adr_high_w))
            .map(0xA2, 0xA3, Some(K573Dio::mpeg_current_adr_low_r), Some(K573Dio::mpeg_current_adr_low_w))
            .map(0xA4, 0xA5, Some(K573Dio::mpeg_ctrl_r), Some(K573Dio::mpeg_end_adr_high_w))
            .map(0xA6, 0xA7, Some(K573Dio::mpeg_ctrl_r), Some(K573Dio::mpeg_end_adr_low_w))
            .map(0xA8, 0xA9, Some(K573Dio::mpeg_frame_counter_r), Some(K573Dio::mpeg_key_1_w))
            .map_read(0xAA, 0xAB, K573Dio::mpeg_status_r)
            .map(0xAC, 0xAD, Some(K573Dio::mas_i2c_r), Some(K573Dio::mas_i2c_w))
            .map(0xAE, 0xAF, Some(K573Dio::mpeg_ctrl_r), Some(K573Dio::mpeg_ctrl_w));

        // Every register in 0xb0..0xbf peeks, only 0xb4 advances.
        map.map_read(0xB0, 0xBF, K573Dio::ram_peek_r)
            .map_write(0xB0, 0xB1, K573Dio::ram_write_adr_high_w)
            .map_write(0xB2, 0xB3, K573Dio::ram_write_adr_low_w)
            .map(0xB4, 0xB5, Some(K573Dio::ram_r), Some(K573Dio::ram_w))
            .map_write(0xB6, 0xB7, K573Dio::ram_read_adr_high_w)
            .map_write(0xB8, 0xB9, K573Dio::ram_read_adr_low_w);

        map.map(0xC0, 0xC1, Some(K573Dio::network_r), Some(K573Dio::network_w))
            .map_read(0xC2, 0xC3, K573Dio::network_output_buf_size_r)
            .map_read(0xC4, 0xC5, K573Dio::network_input_buf_size_r)
            .map_read(0xC6, 0xC7, K573Dio::dummy_r::<0x7654>)
            .map_read(0xC8, 0xC9, K573Dio::dummy_r::<0x7654>)
            .map_read(0xCA, 0xCB, K573Dio::mpeg_timer_high_r)
            .map(0xCC, 0xCD, Some(K573Dio::mpeg_timer_low_r), Some(K573Dio::mpeg_timer_low_w))
            .map_read(0xCE, 0xCF, K573Dio::mpeg_timer_diff_r);

        map.map_read(0xD0, 0xDF, K573Dio::dummy_r::<0x1234>);

        map.map_read(0xE0, 0xEF, K573Dio::digital_id_r)
            .map_write(0xE0, 0xE1, K573Dio::output_w::<1>)
            .map_write(0xE2, 0xE3, K573Dio::output_w::<0>)
            .map_write(0xE4, 0xE5, K573Dio::output_w::<3>)
            .map_write(0xE6, 0xE7, K573Dio::output_w::<7>)
            .map_write(0xEA, 0xEB, K573Dio::mpeg_key_2_w)
            .map_write(0xEC, 0xED, K573Dio::mpeg_key_3_w)
            .map_write(0xEE, 0xEF, K573Dio::digital_id_w);

        map.map_write(0xFA, 0xFB, K573Dio::output_w::<4>)
            .map_write(0xFC, 0xFD, K573Dio::output_w::<5>)
            .map_write(0xFE, 0xFF, K573Dio::output_w::<2>);

        map
    }

    pub fn attach_decoder(&mut self, decoder: Box<dyn MpegAudioDecoder>) {
        self.decoder = Some(decoder);
    }

    pub fn attach_outputs(&mut self, outputs: Box<dyn DioOutputs>) {
        self.outputs = Some(outputs);
    }

    pub fn attach_digital_id(&mut self, digital_id: Box<dyn DigitalId>) {
        self.digital_id = Some(digital_id);
    }

    /// Attaches a network link. At most three links can be attached.
    pub fn attach_network_link(&mut self, link: Box<dyn NetworkLink>) {

        if self.network_ports.len() >= NETWORK_CONNECTIONS {
            log::warn!("k573dio: only {} network links supported", NETWORK_CONNECTIONS);
            return;
        }
        self.network_ports.push(NetworkPort { link, input: Vec::new() });
    }

    pub fn is_fpga_initialised(&self) -> bool {
        self.fpga_initialised
    }

    pub fn mpeg_has_ended(&self) -> bool {
        self.mpeg_current_has_ended
    }

    pub fn mpeg_status(&self) -> MpegStatus {
        self.mpeg_status
    }

    pub fn keys(&self) -> MpegKeys {
        self.keys
    }

    pub fn ram(&self) -> &[u16] {
        &self.ram
    }

    /// Returns the board to its power-on state. The RAM pattern is restored
    /// here, and only here: reloading the firmware leaves RAM alone.
    pub fn reset(&mut self) {

        self.fpga_status = FPGA_STATUS_RESET;
        self.output_data = [0; 8];

        for (block, words) in self.ram.chunks_mut(RAM_FILL_BLOCK_WORDS).enumerate() {
            words.fill(if block & 1 == 0 { 0xFFFF } else { 0x0000 });
        }

        self.network_muxed.clear();
        self.network_output.clear();
        self.network_output_queue.clear();
        for port in self.network_ports.iter_mut() {
            port.input.clear();
        }

        self.stream_timer.reset();
        self.frame_timer.reset();

        self.reset_fpga_state();
    }

    /// Drops the FPGA back to its unprogrammed state.
    fn reset_fpga_state(&mut self) {

        self.ram_addr = 0;
        self.last_valid_ram_read = 0;

        self.fpga_status &= !(0x4000 | 0x2000);
        self.fpga_initialised = false;
        self.firmware_bits_received = 0;
        self.fpga_pre_init = false;

        self.mpeg_timer = 0;
        self.mpeg_timer_base = 0;
        self.mpeg_current_addr = 0;
        self.mpeg_end_addr = 0;

        self.keys = MpegKeys::new();

        self.network_id = 0;
        self.network_output_waiting = 0;
        self.network_timer.reset();

        self.mpeg_ctrl = MpegControl::empty();
        self.mpeg_status = MpegStatus::IDLE;
        self.mpeg_frame_counter = 0;
        self.mpeg_current_has_ended = false;
        self.mpeg_timer_enabled = true;

        self.mp3_remaining_bytes = 0;
        self.mp3_data = 0;

        self.digital_id_cached = 0;

        // Holds until the first stream reports its sample rate.
        self.mpeg_timer_frequency = 32000;
        self.mpeg_timer_frequency_div = 0;
        self.mpeg_timer_last_update = self.clock.now();
    }

    fn dummy_r<const VALUE: u16>(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        VALUE as u32
    }

    fn fpga_status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        // 0x8000 always reads set and 0x4000 never does.
        ((self.fpga_status & !0x4000) | 0x8FFF) as u32
    }

    fn fpga_status_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let data = data as u16;
        log::debug!("k573dio: fpga status write {:04x}", data);

        if !self.fpga_initialised {

            // 0x2000 and 0x8000 set the busy bit at once, 0x1000 and 0x4000 only
            // toggle it from the second write on.
            if (data & 0x2000 != 0 || data & 0x8000 != 0) && !self.fpga_pre_init {
                self.fpga_status &= !(0x2000 | 0x8000);
                self.fpga_status |= 0x1000;
                self.fpga_pre_init = true;
            }

            if data & 0x1000 != 0 || data & 0x4000 != 0 {
                if self.fpga_pre_init {
                    self.fpga_status ^= 0x1000;
                } else {
                    self.fpga_pre_init = true;
                }
            }
        } else {
            if self.fpga_status & 0x4000 != 0 && data & 0x4000 == 0 {
                log::debug!("k573dio: fpga reset");
                self.reset_fpga_state();
            }
            self.fpga_status = data;
        }
    }

    fn fpga_firmware_w(&mut self, _index: u32, _data: u32, _mem_mask: u32) {

        if self.fpga_initialised || self.fpga_status & 0x1000 == 0 {
            return;
        }

        self.firmware_bits_received += 1;

        if self.firmware_bits_received == FPGA_PROM_SIZE_BITS {
            // Any bit stream of the right length is accepted.
            self.fpga_status |= 0x2000 | 0x4000;
            self.fpga_initialised = true;

            let now = self.clock.now();
            self.mpeg_timer_last_update = now;
            let period = Time::from_hz(NETWORK_POLL_HZ);
            self.network_timer.adjust_periodic(now, period, period);

            log::info!("k573dio: fpga firmware loaded");
        }
    }

    fn digital_id_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        if let Some(chip) = self.digital_id.as_mut() {
            self.digital_id_cached = (chip.read() as u16) << 12;
        }
        self.digital_id_cached as u32
    }

    fn digital_id_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if let Some(chip) = self.digital_id.as_mut() {
            chip.write(!data.is_set(12));
        }
    }

    fn mas_i2c_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let (scl, sda) = match self.decoder.as_ref() {
            Some(decoder) => (decoder.i2c_scl_line(), decoder.i2c_sda_line()),
            None => (true, true),
        };
        ((scl as u32) << 13) | ((sda as u32) << 12)
    }

    fn mas_i2c_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if let Some(decoder) = self.decoder.as_mut() {
            decoder.i2c_scl(data.is_set(13));
            decoder.i2c_sda(data.is_set(12));
        }
    }

    fn ram_write_adr_high_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        self.ram_addr = (((data & 0xFFFF) << 16) | (self.ram_addr & 0xFFFF)) & FPGA_RAM_MASK;
    }

    fn ram_write_adr_low_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        // Offset by one word, because data writes advance before storing.
        self.ram_addr = ((self.ram_addr & 0xFFFF0000) | (data & 0xFFFF)).wrapping_sub(2) & FPGA_RAM_MASK;
    }

    fn ram_read_adr_high_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        self.ram_addr = (((data & 0xFFFF) << 16) | (self.ram_addr & 0xFFFF)) & FPGA_RAM_MASK;
        self.last_valid_ram_read = self.ram_next_value();
    }

    fn ram_read_adr_low_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        // Only read address changes refresh the peek cache.
        self.ram_addr = ((self.ram_addr & 0xFFFF0000) | (data & 0xFFFF)) & FPGA_RAM_MASK;
        self.last_valid_ram_read = self.ram_next_value();
    }

    /// Returns the word at the RAM address, or the cached word past the end of RAM.
    fn ram_next_value(&self) -> u16 {

        let index = ((self.ram_addr & FPGA_RAM_MASK) >> 1) as usize;
        self.ram.get(index).copied().unwrap_or(self.last_valid_ram_read)
    }

    fn ram_peek_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.ram_next_value() as u32
    }

    fn ram_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let value = self.ram_next_value();

        self.last_valid_ram_read = value;
        self.ram_addr = (self.ram_addr + 2) & FPGA_RAM_MASK;
        self.last_valid_ram_read = self.ram_next_value();

        value as u32
    }

    fn ram_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        // Advance first, to undo the offset applied by the write address.
        self.ram_addr = (self.ram_addr + 2) & FPGA_RAM_MASK;

        let index = ((self.ram_addr & FPGA_RAM_MASK) >> 1) as usize;
        if let Some(word) = self.ram.get_mut(index) {
            *word = data as u16;
        }
    }

    fn mpeg_current_adr_high_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.mpeg_current_addr >> 16) & 0x1FF
    }

    fn mpeg_current_adr_high_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        self.mpeg_current_addr = (((data & 0xFFFF) << 16) | (self.mpeg_current_addr & 0xFFFF)) & FPGA_RAM_MASK;
        log::trace!("k573dio: mpeg start address high {:04x} ({:08x})", data, self.mpeg_current_addr);
    }

    fn mpeg_current_adr_low_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.mpeg_current_addr & 0xFFFE
    }

    fn mpeg_current_adr_low_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let mut address = (self.mpeg_current_addr & 0xFFFF0000) | (data & 0xFFFF);

        // Round down.
        if address & 1 != 0 {
            address = (address.wrapping_sub(2) / 2) * 2;
        }

        self.mpeg_current_addr = address & FPGA_RAM_MASK;
        log::trace!("k573dio: mpeg start address low {:04x} ({:08x})", data, self.mpeg_current_addr);
    }

    fn mpeg_end_adr_high_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        self.mpeg_end_addr = (((data & 0xFFFF) << 16) | (self.mpeg_end_addr & 0xFFFF)) & FPGA_RAM_MASK;
        log::trace!("k573dio: mpeg end address high {:04x} ({:08x})", data, self.mpeg_end_addr);
    }

    fn mpeg_end_adr_low_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let mut address = (self.mpeg_end_addr & 0xFFFF0000) | (data & 0xFFFF);

        // Round up.
        if data & 1 != 0 {
            address = ((address + 2) / 2) * 2;
        }

        self.mpeg_end_addr = address & FPGA_RAM_MASK;
        log::trace!("k573dio: mpeg end address low {:04x} ({:08x})", data, self.mpeg_end_addr);
    }

    fn mpeg_key_1_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        self.keys.key1 = data as u16;
        if self.variant == DioVariant::Ddrsbm {
            self.keys.key3 = 0;
        }
    }

    fn mpeg_key_2_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if self.variant == DioVariant::Standard {
            self.keys.key2 = data as u16;
        }
    }

    fn mpeg_key_3_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if self.variant == DioVariant::Standard {
            self.keys.key3 = data as u16;
        }
    }

    fn mpeg_frame_counter_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.mpeg_frame_counter as u32
    }

    fn mpeg_status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.mpeg_status | MpegStatus::ENABLED).bits() as u32
    }

    /// Whether the stream still has data to deliver.
    fn is_streaming(&self) -> bool {

        self.mpeg_ctrl.contains(MpegControl::STREAMING_ENABLE)
            && (self.mpeg_current_addr != self.mpeg_end_addr || self.mp3_remaining_bytes != 0)
            && !self.mpeg_current_has_ended
    }

    fn mpeg_ctrl_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.is_streaming() as u32) << 12
    }

    fn mpeg_ctrl_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let old = self.mpeg_ctrl;
        let new = MpegControl::from_bits_retain(data as u16);
        let both = MpegControl::ENABLE | MpegControl::STREAMING_ENABLE;

        log::debug!("k573dio: mpeg control {:?} ({:04x})", new, data);

        if old.contains(MpegControl::FRAME_COUNTER_ENABLE) && !new.contains(MpegControl::FRAME_COUNTER_ENABLE) {
            self.mpeg_frame_counter = 0;
        }

        // Dropping either flag returns the timer to the base rate until the next frame.
        let dropped = (old.contains(MpegControl::STREAMING_ENABLE) && !new.contains(MpegControl::STREAMING_ENABLE))
            || (old.contains(MpegControl::ENABLE) && !new.contains(MpegControl::ENABLE));
        if dropped {
            self.mpeg_timer_frequency_div = 0;
        }

        // Both flags are needed to restart the timer after it is cleared.
        if new.contains(both) && !old.contains(both) {
            self.mpeg_timer = 0;
        }

        if self.mpeg_current_has_ended && dropped {
            self.mpeg_current_has_ended = false;
        }

        self.mpeg_ctrl = new;
    }

    /// Returns the playback timer, in samples at the current stream rate.
    fn mpeg_current_timer(&self) -> u32 {

        if !self.mpeg_timer_enabled {
            return self.mpeg_timer_base;
        }

        let frequency = self.mpeg_timer_frequency >> self.mpeg_timer_frequency_div;
        let elapsed = (self.clock.now() - self.mpeg_timer_last_update).as_secs_f64();
        let samples = elapsed * frequency as f64;

        (samples + self.mpeg_timer_base as f64) as u32
    }

    fn mpeg_timer_diff_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        // The first read shows the full difference, then the low half is cleared.
        let diff = self.mpeg_current_timer().wrapping_sub(self.mpeg_timer) as u16;
        self.mpeg_timer &= 0xFFFF0000;
        diff as u32
    }

    fn mpeg_timer_high_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        if self.variant == DioVariant::Ddrsbm {
            return 0x7654;
        }

        self.mpeg_timer = self.mpeg_current_timer();
        self.mpeg_timer >> 16
    }

    fn mpeg_timer_low_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        self.mpeg_timer = self.mpeg_current_timer();
        self.mpeg_timer & 0xFFFF
    }

    fn mpeg_timer_low_w(&mut self, _index: u32, _data: u32, _mem_mask: u32) {

        // Any write resets the timer.
        self.mpeg_timer = 0;
        self.mpeg_timer_base = 0;

        // The ddrsbm firmware keeps counting when reset while idle.
        if self.variant == DioVariant::Standard {
            self.mpeg_timer_enabled = self.is_streaming();
        }

        self.mpeg_timer_last_update = self.clock.now();
    }

    fn output_w<const LATCH: usize>(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        let data = data.bits(12, 4) as u16;
        let old = self.output_data[LATCH];

        for (line, shift) in OUTPUT_SHIFT.iter().enumerate() {
            let old_bit = old.is_set(*shift);
            let new_bit = data.is_set(*shift);

            if old_bit != new_bit {
                if let Some(outputs) = self.outputs.as_mut() {
                    outputs.output(4 * LATCH as u32 + line as u32, new_bit);
                }
            }
        }

        self.output_data[LATCH] = data;
    }

    fn network_id_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.network_id = data as u16;
    }

    fn network_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.network_muxed.pop_front().unwrap_or(0) as u32
    }

    fn network_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if let Some(packet) = frame_byte(&mut self.network_output, data as u8) {
            self.network_output_waiting += packet.len();
            self.network_output_queue.push_back(packet);
        }
    }

    fn network_output_buf_size_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.network_output_waiting as u32 & 0xFFFF
    }

    fn network_input_buf_size_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.network_muxed.len() as u32 & 0xFFFF
    }

    /// Streams one byte to the decoder, fetching and decrypting the next word
    /// when the previous one is used up.
    fn mpeg_data_transfer(&mut self) {

        if self.mpeg_current_addr == self.mpeg_end_addr && self.mp3_remaining_bytes == 0 {
            self.mpeg_current_has_ended = true;
            self.mpeg_ctrl.remove(MpegControl::STREAMING_ENABLE);
        }

        if !self.mpeg_status.contains(MpegStatus::DEMAND)
            || !self.mpeg_ctrl.contains(MpegControl::ENABLE | MpegControl::STREAMING_ENABLE)
            || self.mpeg_current_has_ended
        {
            return;
        }

        if self.mp3_remaining_bytes == 0 {
            let source = self.ram.get((self.mpeg_current_addr >> 1) as usize).copied().unwrap_or(0);
            let plain = match self.variant {
                DioVariant::Standard => self.keys.decrypt_default(source),
                DioVariant::Ddrsbm => self.keys.decrypt_ddrsbm(source),
            };
            self.mp3_data = plain.swap_bytes();
            self.mpeg_current_addr = self.mpeg_current_addr.wrapping_add(2);
            self.mp3_remaining_bytes = 2;
        }

        if let Some(decoder) = self.decoder.as_mut() {
            decoder.write_byte(self.mp3_data as u8);
        }
        self.mp3_data >>= 8;
        self.mp3_remaining_bytes -= 1;
    }

    fn mpeg_frame_timeout(&mut self) {

        self.mpeg_status.remove(MpegStatus::PLAYING);
        self.mpeg_status.insert(MpegStatus::IDLE);
    }

    /// Called by the decoder at each frame sync edge.
    pub fn mpeg_frame_sync(&mut self, state: bool) {

        self.mpeg_status.remove(MpegStatus::IDLE | MpegStatus::PLAYING);

        if state && self.mpeg_ctrl.contains(MpegControl::FRAME_COUNTER_ENABLE) {
            self.mpeg_status.insert(MpegStatus::PLAYING);

            let now = self.clock.now();
            if self.mpeg_frame_counter == 0 {
                self.mpeg_timer_last_update = now;
                self.mpeg_timer_enabled = true;
            }

            self.mpeg_frame_counter = self.mpeg_frame_counter.wrapping_add(1);

            let frequency = self.mpeg_timer_frequency >> self.mpeg_timer_frequency_div;
            let samples_per_frame = if frequency >= 32000 { 1152 } else { 576 };
            self.frame_timer.adjust(now, Time::from_hz(frequency as f64) * samples_per_frame);
        }
    }

    /// Called by the decoder when its demand line changes.
    pub fn set_mpeg_demand(&mut self, state: bool) {

        let previous = self.mpeg_status.contains(MpegStatus::DEMAND);
        self.mpeg_status.set(MpegStatus::DEMAND, state);

        if state && !previous {
            let period = Time::from_hz((self.mpeg_timer_frequency / 2 * 8) as f64);
            self.stream_timer.adjust_periodic(self.clock.now(), Time::ZERO, period);
        } else if !state && previous {
            self.stream_timer.reset();
        }
    }

    /// Called by the decoder when the stream's sample rate changes. The timer
    /// keeps counting from where it was.
    pub fn set_mpeg_sample_rate(&mut self, frequency: u32) {

        let old_frequency = self.mpeg_timer_frequency;
        let old_div = self.mpeg_timer_frequency_div;

        self.mpeg_timer = self.mpeg_current_timer();

        self.mpeg_timer_frequency = match frequency {
            44100 | 22050 | 11025 => 44100,
            48000 | 24000 | 12000 => 48000,
            32000 | 16000 | 8000 => 32000,
            other => {
                log::warn!("k573dio: unexpected sample rate {}", other);
                other
            },
        };

        self.mpeg_timer_frequency_div = match frequency {
            11025 | 12000 | 8000 => 2,
            22050 | 24000 | 16000 => 1,
            _ => 0,
        };

        if self.mpeg_timer_frequency != old_frequency || self.mpeg_timer_frequency_div != old_div {
            self.mpeg_timer_base = self.mpeg_timer;
            self.mpeg_timer = 0;
            self.mpeg_timer_last_update = self.clock.now();
        }
    }

    /// Moves received packets into the read queue and sends one queued packet.
    fn network_update(&mut self) {

        if !self.fpga_initialised {
            return;
        }

        for port in self.network_ports.iter_mut() {
            while let Some(byte) = port.link.take_byte() {
                let Some(packet) = frame_byte(&mut port.input, byte) else {
                    continue;
                };

                // Our own packets come back round the ring.
                if packet[1] as u16 != self.network_id {
                    self.network_muxed.extend(packet);
                }
            }
        }

        if let Some(packet) = self.network_output_queue.pop_front() {
            for port in self.network_ports.iter_mut() {
                for byte in packet.iter() {
                    port.link.send_byte(*byte);
                }
            }
            self.network_output_waiting = self.network_output_waiting.saturating_sub(packet.len());
        }
    }
}

impl Bus for K573Dio {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let address = self.map.byte_address(offset);
        if !self.fpga_initialised && address < FPGA_STATUS_BASE {
            return unmapped_read(mem_mask);
        }

        let handler = self.map.find_read(address);
        match handler {
            Some((read, index)) => read(self, index, mem_mask) & mem_mask,
            None => unmapped_read(mem_mask),
        }
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset);
        if !self.fpga_initialised && (address < FPGA_STATUS_BASE || address >= 0xFA) {
            return;
        }

        let handler = self.map.find_write(address);
        match handler {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("k573dio: unmapped write {:02x} = {:04x}", address, data),
        }
    }
}

impl Timed for K573Dio {

    fn next_deadline(&self) -> Option<Time> {
        earliest([
            self.stream_timer.next_fire(),
            self.frame_timer.next_fire(),
            self.network_timer.next_fire(),
        ])
    }

    fn run_timers(&mut self, now: Time) {

        if self.stream_timer.take_due(now) {
            self.mpeg_data_transfer();
        }
        if self.frame_timer.take_due(now) {
            self.mpeg_frame_timeout();
        }
        if self.network_timer.take_due(now) {
            self.network_update();
        }
    }
}
