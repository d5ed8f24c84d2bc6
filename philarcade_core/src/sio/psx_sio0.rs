// SPDX-License-Identifier: GPL-3.0
// psx_sio0.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{lanes, prescaler, SerialPort, SyncPeripheral, SYSTEM_CLOCK_HZ};
use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};
use crate::timer::{Clock, EventTimer, Time, Timed};
use bitflags::bitflags;

bitflags! {
    /// Port status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sio0Status: u32 {
        const TX_RDY = 1 << 0;
        const RX_RDY = 1 << 1;
        const TX_EMPTY = 1 << 2;
        const OVERRUN = 1 << 4;
        const DSR = 1 << 7;
        const IRQ = 1 << 9;
    }
}

bitflags! {
    /// Port control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sio0Control: u16 {
        const TX_ENA = 1 << 0;
        const IACK = 1 << 4;
        const RESET = 1 << 6;
        const TX_IENA = 1 << 10;
        const RX_IENA = 1 << 11;
        const DSR_IENA = 1 << 12;
        const DTR = 1 << 13;
    }
}

/// This struct models SIO0, the synchronous port the PlayStation uses for
/// controllers and memory cards. Each timer tick clocks one bit each way.
pub struct PsxSio0 {

    // Virtual time source and bit clock.
    clock: Clock,
    timer: EventTimer,

    // Registers.
    status: Sio0Status,
    mode: u16,
    control: Sio0Control,
    baud: u16,

    // Shift state.
    tx_data: u8,
    rx_data: u8,
    tx_shift: u8,
    rx_shift: u8,
    rx_response: u8,
    tx_bits: u32,
    rx_bits: u32,
    txd: bool,

    irq: bool,
    map: AddressMap<PsxSio0>,
    peripheral: Option<Box<dyn SyncPeripheral>>,
}

impl PsxSio0 {

    pub fn new(clock: Clock) -> Self {
        PsxSio0 {
            clock,
            timer: EventTimer::new(),

            // Setup registers.
            status: Sio0Status::TX_EMPTY | Sio0Status::TX_RDY,
            mode: 0,
            control: Sio0Control::empty(),
            baud: 0,

            // Setup shift state.
            tx_data: 0,
            rx_data: 0,
            tx_shift: 0,
            rx_shift: 0,
            rx_response: 0xFF,
            tx_bits: 0,
            rx_bits: 0,
            txd: true,

            irq: false,
            map: PsxSio0::build_map(),
            peripheral: None,
        }
    }

    fn build_map() -> AddressMap<PsxSio0> {

        let mut map: AddressMap<PsxSio0> = AddressMap::new(4);
        map.map(0x0, 0x3, Some(PsxSio0::data_r), Some(PsxSio0::data_w))
            .map_read(0x4, 0x7, PsxSio0::status_r)
            .map(0x8, 0xB, Some(PsxSio0::mode_control_r), Some(PsxSio0::mode_control_w))
            .map(0xC, 0xF, Some(PsxSio0::baud_r), Some(PsxSio0::baud_w));
        map
    }

    /// Plugs in the controller or memory card chain.
    pub fn attach_peripheral(&mut self, peripheral: Box<dyn SyncPeripheral>) {
        self.peripheral = Some(peripheral);
    }

    pub fn status(&self) -> Sio0Status {
        self.status
    }

    /// Returns the level last driven on the transmit line.
    pub fn txd(&self) -> bool {
        self.txd
    }

    fn interrupt(&mut self) {

        log::trace!("sio0: interrupt");
        self.status.insert(Sio0Status::IRQ);
        self.irq = true;
    }

    fn set_dtr(&mut self, selected: bool) {
        if let Some(peripheral) = self.peripheral.as_mut() {
            peripheral.select(selected);
        }
    }

    /// Rearms the bit clock while there is anything left to shift.
    fn timer_adjust(&mut self) {

        if self.status.contains(Sio0Status::TX_EMPTY) && self.tx_bits == 0 {
            self.timer.reset();
            return;
        }

        let prescaler = prescaler(self.mode);
        if self.baud == 0 || prescaler == 0 {
            log::warn!("sio0: invalid baud rate ({} x {})", prescaler, self.baud);
            self.timer.reset();
            return;
        }

        let period = Time::from_hz(SYSTEM_CLOCK_HZ) * (prescaler as u64 * self.baud as u64);
        self.timer.adjust(self.clock.now(), period);
    }

    fn tick(&mut self) {

        if self.tx_bits == 0
            && self.control.contains(Sio0Control::TX_ENA)
            && !self.status.contains(Sio0Status::TX_EMPTY) {

            self.tx_bits = 8;
            self.tx_shift = self.tx_data;
            self.rx_bits = 8;
            self.rx_shift = 0;

            // A floating line reads as all ones.
            let tx_data = self.tx_data;
            self.rx_response = match self.peripheral.as_mut() {
                Some(peripheral) => peripheral.exchange(tx_data),
                None => 0xFF,
            };

            self.status.insert(Sio0Status::TX_EMPTY | Sio0Status::TX_RDY);
        }

        if self.tx_bits != 0 {
            self.txd = self.tx_shift & 1 != 0;
            self.tx_shift >>= 1;
            self.tx_bits -= 1;

            if self.tx_bits == 0 && self.control.contains(Sio0Control::TX_IENA) {
                self.interrupt();
            }
        }

        if self.rx_bits != 0 {
            self.rx_shift = (self.rx_shift >> 1) | ((self.rx_response & 1) << 7);
            self.rx_response >>= 1;
            self.rx_bits -= 1;

            if self.rx_bits == 0 {
                if self.status.contains(Sio0Status::RX_RDY) {
                    self.status.insert(Sio0Status::OVERRUN);
                } else {
                    self.rx_data = self.rx_shift;
                    self.status.insert(Sio0Status::RX_RDY);
                }

                if self.control.contains(Sio0Control::RX_IENA) {
                    self.interrupt();
                }
            }
        }

        self.timer_adjust();
    }

    fn data_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {

        let data = self.rx_data;
        self.status.remove(Sio0Status::RX_RDY);
        self.rx_data = 0xFF;
        data as u32
    }

    fn data_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        log::trace!("sio0: data {:02x}", data);
        self.tx_data = data as u8;
        self.status.remove(Sio0Status::TX_RDY | Sio0Status::TX_EMPTY);
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
            log::debug!("sio0: mode {:04x}", mode);
            self.mode = mode;
        }

        let Some(control) = control else {
            return;
        };
        log::debug!("sio0: control {:04x}", control);
        self.control = Sio0Control::from_bits_retain(control);

        if self.control.contains(Sio0Control::RESET) {
            self.status.insert(Sio0Status::TX_EMPTY | Sio0Status::TX_RDY);
            self.status.remove(Sio0Status::RX_RDY | Sio0Status::OVERRUN | Sio0Status::IRQ);
            self.irq = false;

            // Pulse DTR, attached devices reset on it.
            self.set_dtr(true);
            self.set_dtr(false);

            self.tx_bits = 0;
            self.rx_bits = 0;
            self.txd = true;
        }

        if self.control.contains(Sio0Control::IACK) {
            self.status.remove(Sio0Status::IRQ);
            self.control.remove(Sio0Control::IACK);
            self.irq = false;
        }

        let selected = self.control.contains(Sio0Control::DTR);
        self.set_dtr(selected);
    }

    fn baud_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        (self.baud as u32) << 16
    }

    fn baud_w(&mut self, _index: u32, data: u32, mem_mask: u32) {

        if let (_, Some(baud)) = lanes(data, mem_mask) {
            log::debug!("sio0: baud {:04x}", baud);
            self.baud = baud;
        }
    }
}

impl SerialPort for PsxSio0 {

    fn irq(&self) -> bool {
        self.irq
    }

    fn set_dsr(&mut self, asserted: bool) {

        if !asserted {
            self.status.remove(Sio0Status::DSR);
        } else if !self.status.contains(Sio0Status::DSR) {
            self.status.insert(Sio0Status::DSR);
            if self.control.contains(Sio0Control::DSR_IENA) {
                self.interrupt();
            }
        }
    }
}

impl Bus for PsxSio0 {

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
            None => log::warn!("sio0: write to read-only register {:x} = {:08x}", address, data),
        }
    }
}

impl Timed for PsxSio0 {

    fn next_deadline(&self) -> Option<Time> {
        self.timer.next_fire()
    }

    fn run_timers(&mut self, now: Time) {

        if self.timer.take_due(now) {
            self.tick();
        }
    }
}
