// SPDX-License-Identifier: GPL-3.0
// psx_sio1.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::VecDeque;

use super::{lanes, prescaler, SerialPort, SYSTEM_CLOCK_HZ};
use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};
use crate::sinks::SerialLine;
use crate::timer::{Clock, EventTimer, Time, Timed};
use bitflags::bitflags;
use philarcade_utility::BitField;

/// Depth of the receive FIFO.
pub const RX_FIFO_BYTES: usize = 8;

bitflags! {
    /// Port status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sio1Status: u32 {
        const TX_RDY = 1 << 0;
        const RX_RDY = 1 << 1;
        const TX_EMPTY = 1 << 2;
        const PARITY_ERR = 1 << 3;
        const OVERRUN = 1 << 4;
        const FRAMING_ERR = 1 << 5;
        const RX = 1 << 6;
        const DSR = 1 << 7;
        const CTS = 1 << 8;
        const IRQ = 1 << 9;
    }
}

bitflags! {
    /// Port control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sio1Control: u16 {
        const TX_ENA = 1 << 0;
        const DTR = 1 << 1;
        const RX_ENA = 1 << 2;
        const TX = 1 << 3;
        const IACK = 1 << 4;
        const RTS = 1 << 5;
        const RESET = 1 << 6;
        const RX_INT_MODE = 3 << 8;
        const TX_IENA = 1 << 10;
        const RX_IENA = 1 << 11;
        const DSR_IENA = 1 << 12;
    }
}

/// Returns the number of bit times in one frame for the given mode: a start
/// bit, 5 to 8 data bits, optional parity and 0 to 2 stop bits.
fn frame_bits(mode: u16) -> u32 {

    let data_bits = mode.bits(2, 2) as u32 + 5;
    let parity_bits = if mode & 0x10 != 0 { 1 } else { 0 };

    // One and a half stop bits round up.
    let stop_bits = match mode & 0xC0 {
        0x40 => 1,
        0x80 | 0xC0 => 2,
        _ => 0,
    };
    1 + data_bits + parity_bits + stop_bits
}

/// This struct models SIO1, the PlayStation's asynchronous serial port. Bytes
/// are framed according to the mode register and leave on the attached line
/// once the whole frame has been clocked out.
pub struct PsxSio1 {

    // Virtual time source and bit clock.
    clock: Clock,
    tx_timer: EventTimer,

    // Registers.
    status: Sio1Status,
    mode: u16,
    control: Sio1Control,
    baud: u16,
    br_factor: u32,
    rx_int_buf_len: usize,

    // Transmit holding and shift register, receive FIFO.
    tx_data: u8,
    tx_shift: u8,
    tx_bits: u32,
    rx_data: VecDeque<u8>,

    irq: bool,
    map: AddressMap<PsxSio1>,
    line: Option<Box<dyn SerialLine>>,
}

impl PsxSio1 {

    pub fn new(clock: Clock) -> Self {
        let mut sio = PsxSio1 {
            clock,
            tx_timer: EventTimer::new(),

            // Setup registers.
            status: Sio1Status::empty(),
            mode: 0,
            control: Sio1Control::empty(),
            baud: 0,
            br_factor: 0,
            rx_int_buf_len: 1,

            // Setup transfer state.
            tx_data: 0,
            tx_shift: 0,
            tx_bits: 0,
            rx_data: VecDeque::with_capacity(RX_FIFO_BYTES),

            irq: false,
            map: PsxSio1::build_map(),
            line: None,
        };
        sio.reset();
        sio
    }

    fn build_map() -> AddressMap<PsxSio1> {

        let mut map: AddressMap<PsxSio1> = AddressMap::new(4);
        map.map(0x0, 0x3, Some(PsxSio1::data_r), Some(PsxSio1::data_w))
            .map_read(0x4, 0x7, PsxSio1::status_r)
            .map(0x8, 0xB, Some(PsxSio1::mode_control_r), Some(PsxSio1::mode_control_w))
            .map(0xC, 0xF, Some(PsxSio1::baud_r), Some(PsxSio1::baud_w));
        map
    }

    /// Attaches the line transmitted bytes are delivered to.
    pub fn attach_line(&mut self, line: Box<dyn SerialLine>) {
        self.line = Some(line);
    }

    pub fn reset(&mut self) {

        self.tx_timer.reset();
        self.status = Sio1Status::TX_EMPTY | Sio1Status::TX_RDY | Sio1Status::CTS | Sio1Status::DSR;
        self.mode = 0;
        self.control = Sio1Control::empty();
        self.baud = 0;
        self.br_factor = 0;
        self.rx_int_buf_len = 1;
        self.tx_data = 0;
        self.tx_shift = 0;
        self.tx_bits = 0;
        self.rx_data.clear();
        self.irq = false;
    }

    pub fn status(&self) -> Sio1Status {
        self.status
    }

    /// Returns true while the RTS output is asserted.
    pub fn rts(&self) -> bool {
        self.control.contains(Sio1Control::RTS)
    }

    /// Returns true while the DTR output is asserted.
    pub fn dtr(&self) -> bool {
        self.control.contains(Sio1Control::DTR)
    }

    /// Latches the clear-to-send input.
    pub fn set_cts(&mut self, asserted: bool) {
        self.status.set(Sio1Status::CTS, asserted);
    }

    /// Accepts one byte arriving on the receive line.
    pub fn receive_byte(&mut self, byte: u8) {

        if !self.control.contains(Sio1Control::RX_ENA) {
            return;
        }

        // A full FIFO keeps its newest slot for the latest byte.
        if self.rx_data.len() >= RX_FIFO_BYTES {
            self.status.insert(Sio1Status::OVERRUN);
            if let Some(last) = self.rx_data.back_mut() {
                *last = byte;
            }
        } else {
            self.rx_data.push_back(byte);
            self.status.insert(Sio1Status::RX_RDY);
        }

        if self.control.contains(Sio1Control::RX_IENA) && self.rx_data.len() >= self.rx_int_buf_len {
            self.interrupt();
        }
    }

    fn interrupt(&mut self) {

        log::trace!("sio1: interrupt");
        self.status.insert(Sio1Status::IRQ);
        self.irq = true;
    }

    fn can_transmit(&self) -> bool {
        self.status.contains(Sio1Status::CTS) && self.control.contains(Sio1Control::TX_ENA)
    }

    fn update_baudrate(&mut self) {

        self.br_factor = prescaler(self.mode);
        log::debug!(
            "sio1: mode {:04x}, {} bit frames, reload factor {}",
            self.mode, frame_bits(self.mode), self.br_factor
        );
    }

    /// Arms the bit clock. A zero reload factor stops it.
    fn timer_adjust(&mut self) {

        if self.br_factor == 0 {
            self.tx_timer.reset();
            return;
        }

        let ticks = self.br_factor as u64 * (self.baud as u64).max(1);
        let period = Time::from_hz(SYSTEM_CLOCK_HZ) * ticks;
        self.tx_timer.adjust(self.clock.now(), period);
    }

    fn transmit_tick(&mut self) {

        if !self.can_transmit() {
            return;
        }

        if self.tx_bits > 0 {
            self.tx_bits -= 1;
            if self.tx_bits == 0 {
                log::trace!("sio1: sent {:02x}", self.tx_shift);
                let byte = self.tx_shift;
                if let Some(line) = self.line.as_mut() {
                    line.transmit(byte);
                }
            }
        }

        if self.tx_bits == 0 {
            if !self.status.contains(Sio1Status::TX_RDY) {
                let data_bits = self.mode.bits(2, 2) as u32 + 5;
                self.tx_shift = self.tx_data & (0xFF >> (8 - data_bits)) as u8;
                self.tx_bits = frame_bits(self.mode);
                self.status.remove(Sio1Status::TX_EMPTY);
                self.status.insert(Sio1Status::TX_RDY);
            } else {
                self.status.insert(Sio1Status::TX_EMPTY);
            }
        }

        if self.control.contains(Sio1Control::TX_IENA)
            && self.status.contains(Sio1Status::TX_RDY | Sio1Status::TX_EMPTY) {
            self.interrupt();
        }

        self.timer_adjust();
    }

    fn data_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let mut data = 0;
        if self.status.contains(Sio1Status::RX_RDY) {
            if let Some(byte) = self.rx_data.pop_front() {
                data = byte as u32;
            }
            if self.rx_data.is_empty() {
                self.status.remove(Sio1Status::RX_RDY);
            }
        }
        data
    }

    fn data_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        if !self.can_transmit() {
            return;
        }

        self.tx_data = data as u8;
        self.status.remove(Sio1Status::TX_RDY | Sio1Status::TX_EMPTY);
        self.timer_adjust();
    }

    fn status_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.status.bits()
    }

    fn mode_control_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        ((self.control.bits() as u32) << 16) | self.mode as u32
    }

    fn mode_control_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        let (mode, control) = lanes(data, mem_mask);
        if let Some(mode) = mode {
            self.mode = mode;
            self.update_baudrate();
            self.timer_adjust();
        }
        if let Some(control) = control {
            self.control_w(control);
        }
    }

    fn control_w(&mut self, data: u16) {

        log::debug!("sio1: control {:04x}", data);
        self.control = Sio1Control::from_bits_retain(data);
        self.rx_int_buf_len = 1 << data.bits(8, 2);

        if self.control.contains(Sio1Control::RESET) {
            self.tx_timer.reset();
            self.control = Sio1Control::empty();
            self.status &= Sio1Status::CTS | Sio1Status::DSR;
            self.mode = 0;
            self.baud = 0;
            self.br_factor = 0;
            self.rx_int_buf_len = 1;
            self.tx_data = 0;
            self.tx_bits = 0;
            self.rx_data.clear();
        }

        if self.control.contains(Sio1Control::IACK) {
            self.status.remove(
                Sio1Status::OVERRUN | Sio1Status::PARITY_ERR | Sio1Status::FRAMING_ERR | Sio1Status::IRQ
            );
            self.control.remove(Sio1Control::IACK);
            self.irq = false;
        }

        if !self.control.contains(Sio1Control::RX_ENA) {
            self.status.remove(Sio1Status::RX_RDY);
            self.rx_data.clear();
        }
    }

    fn baud_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.baud as u32) << 16
    }

    fn baud_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        if let (_, Some(baud)) = lanes(data, mem_mask) {
            log::debug!("sio1: baud {:04x}", baud);
            self.baud = baud;
            self.update_baudrate();
            self.timer_adjust();
        }
    }
}

impl SerialPort for PsxSio1 {

    fn irq(&self) -> bool {
        self.irq
    }

    fn set_dsr(&mut self, asserted: bool) {

        self.status.set(Sio1Status::DSR, asserted);
        if self.control.contains(Sio1Control::DSR_IENA) && asserted {
            self.interrupt();
        }
    }
}

impl Bus for PsxSio1 {

    fn read(&mut self, offset: u32, mem_mask: u32) -> u32 {

        let address = self.map.byte_address(offset & 3);
        let handler = self.map.find_read(address);
        match handler {
            Some((read, index)) => read(self, index, mem_mask) & mem_mask,
            None => unmapped_read(mem_mask),
        }
    }

    fn write(&mut self, offset: u32, data: u32, mem_mask: u32) {

        let address = self.map.byte_address(offset & 3);
        let handler = self.map.find_write(address);
        match handler {
            Some((write, index)) => write(self, index, data & mem_mask, mem_mask),
            None => log::warn!("sio1: write to read-only register {:x} = {:08x}", address, data),
        }
    }
}

impl Timed for PsxSio1 {

    fn next_deadline(&self) -> Option<Time> {
        self.tx_timer.next_fire()
    }

    fn run_timers(&mut self, now: Time) {

        if self.tx_timer.take_due(now) {
            self.transmit_tick();
        }
    }
}
