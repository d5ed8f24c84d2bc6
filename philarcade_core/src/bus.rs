// SPDX-License-Identifier: GPL-3.0
// bus.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// This module contains the address map used by devices to route register
/// accesses to their handler functions.
pub mod address_map;

#[cfg(test)]
mod tests;

/// The value returned by an unmapped or not-yet-ready register, before lane masking.
pub const UNMAPPED_VALUE: u32 = 0xFFFFFFFF;

/// This trait provides an implementation-opaque way of accessing a memory-mapped
/// device from the bus dispatcher. Offsets are device-relative and counted in
/// units of the device's data width, while `mem_mask` selects the active byte
/// lanes of the access.
pub trait Bus {

    /// Implementations must return the value at the given offset. Reads are
    /// side-effect free unless the register is documented as pop-on-read or
    /// auto-incrementing.
    fn read(&mut self, offset: u32, mem_mask: u32) -> u32;

    /// Implementations must apply the write to the given offset, leaving lanes
    /// outside `mem_mask` untouched.
    fn write(&mut self, offset: u32, data: u32, mem_mask: u32);
}

/// Merges `data` into `old` on the lanes selected by `mem_mask`.
#[inline(always)]
pub fn combine_data(old: u32, data: u32, mem_mask: u32) -> u32 {
    (old & !mem_mask) | (data & mem_mask)
}

/// Returns the all-ones sentinel restricted to the requested lanes.
#[inline(always)]
pub fn unmapped_read(mem_mask: u32) -> u32 {
    UNMAPPED_VALUE & mem_mask
}
