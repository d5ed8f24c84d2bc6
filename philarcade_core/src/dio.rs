// SPDX-License-Identifier: GPL-3.0
// dio.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// This module contains the digital I/O board itself.
pub mod k573_dio;

/// This module contains the key registers and ciphers of the MPEG data path.
pub mod mpeg_crypto;


/// This trait is the MPEG audio decoder the board streams into. Decoding itself
/// happens elsewhere; the decoder reports demand, frame sync and sample rate
/// changes back through the board's `set_mpeg_demand`, `mpeg_frame_sync` and
/// `set_mpeg_sample_rate`.
pub trait MpegAudioDecoder {

    /// Called with each decrypted stream byte, in order.
    fn write_byte(&mut self, byte: u8);

    /// Drives the decoder's i2c clock line.
    fn i2c_scl(&mut self, state: bool);

    /// Drives the decoder's i2c data line.
    fn i2c_sda(&mut self, state: bool);

    /// Returns the level of the i2c clock line as seen by the board.
    fn i2c_scl_line(&self) -> bool {
        true
    }

    /// Returns the level of the i2c data line as seen by the board.
    fn i2c_sda_line(&self) -> bool {
        true
    }
}

/// This trait receives changes on the board's output latches.
pub trait DioOutputs {

    /// Called once per changed line with the line index and its new state.
    fn output(&mut self, index: u32, state: bool);
}

/// This trait is a raw byte link to another cabinet.
pub trait NetworkLink {

    /// Returns the next received byte, if one is waiting.
    fn take_byte(&mut self) -> Option<u8>;

    fn send_byte(&mut self, byte: u8);
}

/// This trait is the one-wire silicon serial number chip on the board.
pub trait DigitalId {

    /// Returns the level of the data line.
    fn read(&mut self) -> bool;

    /// Drives the data line.
    fn write(&mut self, state: bool);
}
