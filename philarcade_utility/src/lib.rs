// SPDX-License-Identifier: GPL-3.0
// lib.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

// This crate contains bit-twiddling helpers that are shared by all the device
// models, so that register decoding reads the same way everywhere.

/// Exists to allow us to define custom trait operations on `i32`.
type CustomInt32 = i32;

/// This trait exists to allow us to sign extend arbitrary-width fields pulled
/// out of command words and registers.
pub trait CustomInteger {

    type Output;

    /// This function should return sign-extended version of the original value, based
    /// on extension from the n-th most significant bit as specified. It can be used
    /// for arbitrary widths within the type (for example 12-bit values).
    fn sign_extend(self, from_bit: i32) -> Self::Output;
}

impl CustomInteger for CustomInt32 {

    type Output = i32;

    /// Sign extends based on the specified bit, with 31 being most significant and
    /// 0 being least significant.
    #[inline(always)]
    fn sign_extend(self, from_bit: i32) -> Self::Output {

        let bit_pattern_to_test = 0x1_i32 << from_bit;
        let extension_pattern = (0xFFFFFFFE_u32 as i32) << from_bit;

        if self & bit_pattern_to_test == 0 {
            self
        } else {
            self | extension_pattern
        }
    }
}

/// This trait provides field extraction on unsigned register values.
pub trait BitField: Sized + Copy {

    /// Returns the single bit at `position` (0 or 1).
    fn bit(self, position: u32) -> Self;

    /// Returns `width` bits starting at `position`, shifted down to bit 0.
    fn bits(self, position: u32, width: u32) -> Self;

    /// Returns true if the bit at `position` is set.
    fn is_set(self, position: u32) -> bool;
}

macro_rules! impl_bit_field {
    ($($t:ty),*) => {
        $(
            impl BitField for $t {

                #[inline(always)]
                fn bit(self, position: u32) -> Self {
                    (self >> position) & 1
                }

                #[inline(always)]
                fn bits(self, position: u32, width: u32) -> Self {
                    if width >= <$t>::BITS {
                        self >> position
                    } else {
                        (self >> position) & ((1 << width) - 1)
                    }
                }

                #[inline(always)]
                fn is_set(self, position: u32) -> bool {
                    (self >> position) & 1 != 0
                }
            }
        )*
    };
}

impl_bit_field!(u8, u16, u32, u64);

/// Rearranges the bits of a 16-bit value. `sources[0]` names the source bit
/// that lands in bit 15 of the result, `sources[15]` the one that lands in bit 0.
#[inline]
pub fn bitswap16(value: u16, sources: [u32; 16]) -> u16 {

    sources.iter().fold(0, |acc, &source| (acc << 1) | value.bit(source))
}

#[cfg(test)]
mod tests {

    use super::{bitswap16, BitField, CustomInteger};

    #[test]
    fn sign_extend_should_extend_8_bit_value_if_bit_7_is_set_for_i32() {

        let input = 0x80;
        let output = input.sign_extend(7);

        assert_eq!(output, 0xFFFFFF80_u32 as i32);
    }

    #[test]
    fn sign_extend_should_leave_8_bit_value_if_bit_7_is_unset_for_i32() {

        let input = 0x70;
        let output = input.sign_extend(7);

        assert_eq!(output, 0x70);
    }

    #[test]
    fn sign_extend_should_extend_12_bit_value_if_bit_11_is_set_for_i32() {

        let input = 0xFC0;
        let output = input.sign_extend(11);

        assert_eq!(output, -64);
    }

    #[test]
    fn bits_should_extract_field_from_middle_of_value() {

        let input = 0b1011_0110_u32;

        assert_eq!(input.bits(2, 4), 0b1101);
        assert_eq!(input.bit(0), 0);
        assert_eq!(input.bit(1), 1);
        assert!(input.is_set(7));
    }

    #[test]
    fn bits_should_allow_full_width_fields() {

        let input = 0xDEADBEEF_u32;

        assert_eq!(input.bits(0, 32), 0xDEADBEEF);
        assert_eq!(input.bits(16, 16), 0xDEAD);
    }

    #[test]
    fn bitswap16_should_keep_value_with_identity_order() {

        let identity = [15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0];

        assert_eq!(bitswap16(0x1234, identity), 0x1234);
    }

    #[test]
    fn bitswap16_should_reverse_value_with_reversed_order() {

        let reversed = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

        assert_eq!(bitswap16(0x0001, reversed), 0x8000);
        assert_eq!(bitswap16(0x00F0, reversed), 0x0F00);
    }
}
