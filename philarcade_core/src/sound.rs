// SPDX-License-Identifier: GPL-3.0
// sound.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// This module contains the Shamisen Brothers sample mixer. There may be
/// others in future.
pub mod shambros_sound;

#[cfg(test)]
mod tests;

/// This trait provides an implementation-opaque way of driving a sample mixer
/// from elsewhere in the system, alongside its register interface.
pub trait Mixer {

    /// Implementations must return the bitmask of currently playing voices.
    fn voice_state(&self) -> u16;

    /// Implementations must start and stop voices according to the bitmask.
    fn set_voice_state(&mut self, state: u16);

    /// Implementations must produce one stereo output frame.
    fn mix_frame(&mut self) -> (i16, i16);
}
