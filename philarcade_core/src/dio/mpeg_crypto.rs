// SPDX-License-Identifier: GPL-3.0
// mpeg_crypto.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use philarcade_utility::{bitswap16, BitField};

/// Bit order used to derive the ddrsbm key schedule from key 1.
const DDRSBM_KEY_ORDER: [u32; 16] = [13, 11, 9, 7, 5, 3, 1, 15, 14, 12, 10, 8, 6, 4, 2, 0];

/// Bit order applied to key 3 before it is mixed into the default cipher.
const KEY3_ORDER: [u32; 16] = [7, 0, 6, 1, 5, 2, 4, 3, 3, 4, 2, 5, 1, 6, 0, 7];

/// This struct holds the three self-advancing key registers of the MPEG data
/// path, and the two ciphers that consume them. Every decrypted word advances
/// the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MpegKeys {
    pub key1: u16,
    pub key2: u16,
    pub key3: u16,
}

impl MpegKeys {

    pub fn new() -> Self {
        MpegKeys::default()
    }

    /// Decrypts one word with the cipher used by most games.
    pub fn decrypt_default(&mut self, value: u16) -> u16 {

        let m = self.key1 ^ self.key2;

        let mut v = bitswap16(value, [
            15 - m.bit(0xF) as u32,
            14 + m.bit(0xF) as u32,
            13 - m.bit(0xE) as u32,
            12 + m.bit(0xE) as u32,
            11 - m.bit(0xB) as u32,
            10 + m.bit(0xB) as u32,
            9 - m.bit(0x9) as u32,
            8 + m.bit(0x9) as u32,
            7 - m.bit(0x8) as u32,
            6 + m.bit(0x8) as u32,
            5 - m.bit(0x5) as u32,
            4 + m.bit(0x5) as u32,
            3 - m.bit(0x3) as u32,
            2 + m.bit(0x3) as u32,
            1 - m.bit(0x2) as u32,
            m.bit(0x2) as u32,
        ]);

        v ^= (m.bit(0xD) << 14)
            ^ (m.bit(0xC) << 12)
            ^ (m.bit(0xA) << 10)
            ^ (m.bit(0x7) << 8)
            ^ (m.bit(0x6) << 6)
            ^ (m.bit(0x4) << 4)
            ^ (m.bit(0x1) << 2)
            ^ m.bit(0x0);

        v ^= bitswap16(self.key3, KEY3_ORDER);

        self.key1 = (self.key1 & 0x8000) | ((self.key1 << 1) & 0x7FFE) | ((self.key1 >> 14) & 1);
        if ((self.key1 >> 15) ^ self.key1) & 1 != 0 {
            self.key2 = self.key2.rotate_left(1);
        }
        self.key3 = self.key3.wrapping_add(1);

        v
    }

    /// Decrypts one word with the cipher used by the ddrsbm board firmware.
    pub fn decrypt_ddrsbm(&mut self, data: u16) -> u16 {

        let mut key = [0u8; 16];
        let mut key_state = bitswap16(self.key1, DDRSBM_KEY_ORDER);

        for round in 0..8 {
            key[round * 2] = key_state as u8;
            key[round * 2 + 1] = (key_state >> 8) as u8;
            key_state = ((key_state & 0x8080) >> 7) | ((key_state & 0x7F7F) << 1);
        }

        let key_byte = key[(self.key3 & 15) as usize];
        let scramble_byte = key[(self.key3.wrapping_sub(1) & 15) as usize];

        let mut output = 0;
        for bit in 0..8 {
            let even_shift = bit * 2;
            let odd_shift = bit * 2 + 1;
            let mut even = data.is_set(even_shift);
            let mut odd = data.is_set(odd_shift);

            if scramble_byte.is_set(bit) {
                std::mem::swap(&mut even, &mut odd);
            }
            if even ^ key_byte.is_set(bit) {
                output |= 1 << even_shift;
            }
            if odd {
                output |= 1 << odd_shift;
            }
        }

        self.key3 = self.key3.wrapping_add(1);

        output
    }
}
