// SPDX-License-Identifier: GPL-3.0
// shambros_sound.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::Mixer;
use crate::bus::{combine_data, unmapped_read, Bus};
use crate::sinks::AudioSink;
use crate::timer::{Clock, EventTimer, Time, Timed};
use philarcade_utility::BitField;

/// Number of independent voices.
pub const VOICE_COUNT: usize = 8;

/// Size of the sample RAM.
pub const SAMPLE_RAM_BYTES: usize = 0x600000;

/// Size of each sample flash bank.
pub const FLASH_BANK_BYTES: usize = 0x200000;

/// Word offsets below this address the voice registers.
const REGISTER_WORDS: usize = 0x80;

/// Output rate divider from the input clock.
const CLOCK_DIVIDER: u32 = 384;

/// Voice addresses carry this many fractional bits.
const ADDRESS_FRACTION_BITS: u32 = 12;

/// Mask for the 44-bit voice addresses.
const ADDRESS_MASK: u64 = 0xFFF_FFFF_FFFF;

/// Playback state of one voice. Addresses are fixed point with 12 fractional bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Voice {
    pub addr_cur: u64,
    pub addr_loop: u64,
    pub addr_end: u64,
    pub step: u16,
    pub vol_l: u16,
    pub vol_r: u16,
    pub is_looped: bool,
    pub enabled: bool,
}

/// Replaces the low or high 16 integer bits of a fixed point address.
fn set_address_half(address: u64, data: u16, high: bool) -> u64 {

    if high {
        (address & 0x0000_FFFF_000) | ((data as u64) << 28)
    } else {
        (address & 0xFFFF_0000_000) | ((data as u64) << ADDRESS_FRACTION_BITS)
    }
}

/// This struct models the Shamisen Brothers sound chip: eight voices playing
/// signed 8-bit samples from sample RAM or one of two flash banks, summed into
/// one stereo frame per output tick.
pub struct ShambrosSound {

    // Virtual time source and output pacing.
    clock: Clock,
    sample_timer: EventTimer,
    sample_period: Time,

    // Register shadow and voices.
    registers: [u16; REGISTER_WORDS],
    voices: [Voice; VOICE_COUNT],

    // Sample memory. Flash words are big endian, high byte at even offsets.
    ram: Vec<u8>,
    flash: [Vec<u16>; 2],

    // Where mixed frames go.
    sink: Option<Box<dyn AudioSink>>,
}

/// Implementation functions for the sound chip itself.
impl ShambrosSound {

    /// Creates a sound chip driven by the given input clock frequency.
    pub fn new(clock: Clock, clock_hz: u32) -> Self {
        let mut sound = ShambrosSound {

            // Setup time source.
            clock,
            sample_timer: EventTimer::new(),
            sample_period: Time::from_hz((clock_hz / CLOCK_DIVIDER) as f64),

            // Setup voices.
            registers: [0; REGISTER_WORDS],
            voices: [Voice::default(); VOICE_COUNT],

            // Setup sample memory.
            ram: vec![0; SAMPLE_RAM_BYTES],
            flash: [Vec::new(), Vec::new()],

            sink: None,
        };
        sound.reset();
        sound
    }

    /// Attaches the sink mixed frames are delivered to.
    pub fn attach_sink(&mut self, sink: Box<dyn AudioSink>) {
        self.sink = Some(sink);
    }

    /// Loads the contents of one flash bank, as 16-bit words.
    pub fn load_flash(&mut self, bank: usize, words: &[u16]) {

        match self.flash.get_mut(bank) {
            Some(flash) => {
                let count = words.len().min(FLASH_BANK_BYTES / 2);
                *flash = words[..count].to_vec();
            },
            None => log::warn!("shambros sound: no flash bank {}", bank),
        }
    }

    /// Copies bytes into sample RAM, clipping at the end of RAM.
    pub fn load_ram(&mut self, offset: usize, bytes: &[u8]) {

        if offset >= SAMPLE_RAM_BYTES {
            return;
        }
        let count = bytes.len().min(SAMPLE_RAM_BYTES - offset);
        self.ram[offset..offset + count].copy_from_slice(&bytes[..count]);
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    /// Returns the chip to its power-on state and restarts output.
    pub fn reset(&mut self) {

        self.registers = [0; REGISTER_WORDS];
        self.voices = [Voice::default(); VOICE_COUNT];
        self.sample_timer.adjust_periodic(self.clock.now(), self.sample_period, self.sample_period);
    }

    /// Fetches one signed sample at a byte offset.
    fn sample(&self, offset: usize) -> i8 {

        if offset < SAMPLE_RAM_BYTES {
            return self.ram[offset] as i8;
        }

        let bank = (offset - SAMPLE_RAM_BYTES) / FLASH_BANK_BYTES;
        let word = self.flash
            .get(bank)
            .and_then(|flash| flash.get(((offset - SAMPLE_RAM_BYTES) % FLASH_BANK_BYTES) / 2))
            .copied()
            .unwrap_or(0);

        if offset & 1 == 0 {
            (word >> 8) as u8 as i8
        } else {
            word as u8 as i8
        }
    }

    /// Stores a voice register and applies it to the voice it belongs to.
    fn write_register(&mut self, offset: usize, data: u16) {

        self.registers[offset] = data;
        let index = offset >> 4;
        let register = offset & 0xF;
        let voice = &mut self.voices[index];

        match register {
            1 => voice.addr_cur = set_address_half(voice.addr_cur, data, false),
            2 => {
                voice.addr_cur = set_address_half(voice.addr_cur, data & 0x7FFF, true);
                voice.is_looped = data.is_set(15);
            },
            3 => voice.step = data,
            4 => voice.addr_loop = set_address_half(voice.addr_loop, data, false),
            5 => voice.addr_loop = set_address_half(voice.addr_loop, data, true),
            6 => voice.addr_end = set_address_half(voice.addr_end, data, false),
            7 => voice.addr_end = set_address_half(voice.addr_end, data, true),
            0xB => voice.vol_l = data,
            0xC => voice.vol_r = data,
            _ => {
                log::warn!("shambros sound: unknown register usage: voice {}, register {:x}, data {:04x}",
                    index, register, data);
                return;
            },
        }

        log::trace!("shambros sound: voice {} register {:x} = {:04x}", index, register, data);
    }
}

impl Bus for ShambrosSound {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let offset = offset as usize;
        if offset < REGISTER_WORDS {
            return self.registers[offset] as u32 & mem_mask;
        }

        let address = offset * 2;
        if address + 1 >= SAMPLE_RAM_BYTES {
            return unmapped_read(mem_mask);
        }
        (((self.ram[address] as u32) << 8) | self.ram[address + 1] as u32) & mem_mask
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let offset = offset as usize;
        if offset < REGISTER_WORDS {
            let merged = combine_data(self.registers[offset] as u32, data, mem_mask);
            self.write_register(offset, merged as u16);
            return;
        }

        let address = offset * 2;
        if address + 1 >= SAMPLE_RAM_BYTES {
            log::warn!("shambros sound: write past sample RAM at {:06x}", address);
            return;
        }
        if mem_mask & 0xFF00 != 0 {
            self.ram[address] = data.bits(8, 8) as u8;
        }
        if mem_mask & 0x00FF != 0 {
            self.ram[address + 1] = data.bits(0, 8) as u8;
        }
    }
}

impl Mixer for ShambrosSound {

    fn voice_state(&self) -> u16 {

        self.voices
            .iter()
            .enumerate()
            .fold(0, |state, (index, voice)| state | ((voice.enabled as u16) << index))
    }

    fn set_voice_state(&mut self, state: u16) {

        for (index, voice) in self.voices.iter_mut().enumerate() {
            voice.enabled = state.is_set(index as u32);
        }
    }

    fn mix_frame(&mut self) -> (i16, i16) {

        let mut left: i64 = 0;
        let mut right: i64 = 0;

        for index in 0..VOICE_COUNT {
            let mut voice = self.voices[index];
            if !voice.enabled {
                continue;
            }

            if voice.addr_cur >= voice.addr_end {
                if voice.is_looped {
                    voice.addr_cur = voice.addr_loop;
                } else {
                    voice.enabled = false;
                    self.voices[index] = voice;
                    continue;
                }
            }

            let sample = self.sample((voice.addr_cur >> ADDRESS_FRACTION_BITS) as usize) as i64 * 256;
            voice.addr_cur = (voice.addr_cur + voice.step as u64) & ADDRESS_MASK;

            left += sample * voice.vol_l as i64 / 65535;
            right += sample * voice.vol_r as i64 / 65535;

            if !voice.is_looped && voice.addr_cur >= voice.addr_end {
                voice.enabled = false;
            }
            self.voices[index] = voice;
        }

        (
            left.clamp(i16::MIN as i64, i16::MAX as i64) as i16,
            right.clamp(i16::MIN as i64, i16::MAX as i64) as i16,
        )
    }
}

impl Timed for ShambrosSound {

    fn next_deadline(&self) -> Option<Time> {
        self.sample_timer.next_fire()
    }

    fn run_timers(&mut self, now: Time) {

        while self.sample_timer.take_due(now) {
            let (left, right) = self.mix_frame();
            if let Some(sink) = self.sink.as_mut() {
                sink.push_frame(left, right);
            }
        }
    }
}
