// SPDX-License-Identifier: GPL-3.0
// sio.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// This module contains the controller and memory card port.
pub mod psx_sio0;

/// This module contains the asynchronous serial port.
pub mod psx_sio1;

#[cfg(test)]
mod tests;

/// Clock the baud rate dividers count, in Hz.
pub const SYSTEM_CLOCK_HZ: f64 = 33_868_800.0;

/// This trait provides an implementation-opaque way of wiring a serial port's
/// modem lines and interrupt from elsewhere in the system.
pub trait SerialPort {

    /// Implementations must return the level of the interrupt output.
    fn irq(&self) -> bool;

    /// Implementations must latch the data-set-ready input. `asserted` is the
    /// logical state, whatever the polarity of the pin.
    fn set_dsr(&mut self, asserted: bool);
}

/// This trait is a device on the synchronous controller port. It is clocked
/// one byte at a time, answering each byte the port sends.
pub trait SyncPeripheral {

    /// Must return the byte shifted back while `byte` is shifted out.
    fn exchange(&mut self, byte: u8) -> u8;

    /// Called when the port's DTR output changes, which selects the device.
    fn select(&mut self, _selected: bool) {}
}

/// Splits a 32-bit access into the 16-bit registers on its lower and upper
/// lanes. The bus is little endian, so the lower lanes are the lower address.
#[inline(always)]
pub(crate) fn lanes(data: u32, mem_mask: u32) -> (Option<u16>, Option<u16>) {
    (
        (mem_mask & 0x0000FFFF != 0).then_some(data as u16),
        (mem_mask & 0xFFFF0000 != 0).then_some((data >> 16) as u16),
    )
}

/// Returns the divider the low mode bits select. Zero stops the clock.
#[inline(always)]
pub(crate) fn prescaler(mode: u16) -> u32 {
    match mode & 3 {
        1 => 1,
        2 => 16,
        3 => 64,
        _ => 0,
    }
}
