// SPDX-License-Identifier: GPL-3.0
// gu956.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use bitflags::bitflags;

use crate::bus::address_map::AddressMap;
use crate::bus::{unmapped_read, Bus};

#[cfg(test)]
mod tests;

/// Number of registers behind the network controller's address latch.
pub const NETWORK_REGISTERS: usize = 0x100;

/// Number of CPU I/O ports.
pub const PORT_COUNT: usize = 12;

/// Ports with a fixed reading: coin-in status, battery status and the network
/// controller's busy line.
const PORT_COIN_STATUS: usize = 4;
const PORT_BATTERY_STATUS: usize = 9;
const PORT_NETWORK_BUSY: usize = 11;

/// Port wired to the DIP switches and buttons.
const PORT_DIP_SWITCHES: usize = 7;

/// Port driving the LCD controller's control lines.
const PORT_LCD_CONTROL: usize = 10;

bitflags! {
    /// LCD controller control lines, as driven by port 10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LcdLines: u8 {
        /// Register select.
        const RS = 1 << 0;
        /// Read, not write.
        const RW = 1 << 1;
        /// Enable strobe.
        const E = 1 << 2;
    }
}

/// This trait receives changes on the LCD controller's control lines.
pub trait LcdPort {

    fn control(&mut self, lines: LcdLines);
}

/// This struct models the glue registers of the GU956 income system board: the
/// address/data pair of its network controller and the CPU's I/O ports. The
/// network controller's registers have no known meaning, so they are stored
/// and read back as written.
pub struct Gu956 {

    // Network controller. Offset 0 latches a register address, offset 1
    // reads or writes the latched register.
    network_address: u8,
    network: [u8; NETWORK_REGISTERS],

    // I/O ports. The switches are active low.
    dip_switches: u8,
    port_latches: [u8; PORT_COUNT],
    lcd_lines: LcdLines,
    lcd: Option<Box<dyn LcdPort>>,

    map: AddressMap<Gu956>,
}

impl Gu956 {

    pub fn new() -> Self {
        let mut board = Gu956 {
            network_address: 0,
            network: [0; NETWORK_REGISTERS],
            dip_switches: 0xFF,
            port_latches: [0; PORT_COUNT],
            lcd_lines: LcdLines::empty(),
            lcd: None,
            map: Gu956::build_map(),
        };
        board.reset();
        board
    }

    fn build_map() -> AddressMap<Gu956> {

        let mut map: AddressMap<Gu956> = AddressMap::new(1);
        map.map(0x00, 0x00, Some(Gu956::network_address_r), Some(Gu956::network_address_w))
            .map(0x01, 0x01, Some(Gu956::network_data_r), Some(Gu956::network_data_w));
        map
    }

    pub fn attach_lcd(&mut self, lcd: Box<dyn LcdPort>) {
        self.lcd = Some(lcd);
    }

    /// Clears the network registers and port latches. The switches are
    /// physical, so they keep their setting.
    pub fn reset(&mut self) {

        self.network_address = 0;
        self.network = [0; NETWORK_REGISTERS];
        self.port_latches = [0; PORT_COUNT];
        self.lcd_lines = LcdLines::empty();
    }

    /// Sets the DIP switch and button port. Cleared bits are switches turned on.
    pub fn set_dip_switches(&mut self, value: u8) {
        self.dip_switches = value;
    }

    pub fn network_register(&self, address: u8) -> u8 {
        self.network[address as usize]
    }

    pub fn lcd_lines(&self) -> LcdLines {
        self.lcd_lines
    }

    /// Returns the last value written to a port.
    pub fn port_latch(&self, port: usize) -> Option<u8> {
        self.port_latches.get(port).copied()
    }

    pub fn port_read(&mut self, port: usize) -> u8 {

        match port {
            PORT_COIN_STATUS | PORT_BATTERY_STATUS | PORT_NETWORK_BUSY => 0xFF,
            PORT_DIP_SWITCHES => self.dip_switches,
            _ => {
                log::debug!("gu956: port {} read", port);
                0
            },
        }
    }

    pub fn port_write(&mut self, port: usize, data: u8) {

        log::debug!("gu956: port {} write {:02x}", port, data);

        let Some(latch) = self.port_latches.get_mut(port) else {
            log::warn!("gu956: write to missing port {}", port);
            return;
        };
        *latch = data;

        if port == PORT_LCD_CONTROL {
            self.lcd_lines = LcdLines::from_bits_truncate(data);
            if let Some(lcd) = self.lcd.as_mut() {
                lcd.control(self.lcd_lines);
            }
        }
    }

    fn network_address_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.network_address as u32
    }

    fn network_address_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {
        self.network_address = data as u8;
    }

    fn network_data_r(&mut self, _index: u32, _mem_mask: u32) -> u32 {
        self.network[self.network_address as usize] as u32
    }

    fn network_data_w(&mut self, _index: u32, data: u32, _mem_mask: u32) {

        log::trace!("gu956: network register {:02x} = {:02x}", self.network_address, data as u8);
        self.network[self.network_address as usize] = data as u8;
    }
}

impl Bus for Gu956 {

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
            None => log::warn!("gu956: unmapped write {:02x} = {:08x}", address, data),
        }
    }
}
