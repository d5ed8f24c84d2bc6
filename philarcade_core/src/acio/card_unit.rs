// SPDX-License-Identifier: GPL-3.0
// card_unit.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use super::{decode_length, default_handle_message, AcioNode, NodeInfo};

/// Size of a magnetic card image.
pub const CARD_DATA_BYTES: usize = 0x80;

/// Leading bytes of a freshly created card.
const NEW_CARD_HEADER: [u8; 5] = [0x08, 0x1F, 0x7D, 0xF0, 0x56];

/// Scan codes for the 12 keypad buttons, in keypad bit order.
const KEYPAD_CODES: [u8; 12] = [
    0x69, // 1
    0x72, // 2
    0x7A, // 3
    0x6B, // 4
    0x73, // 5
    0x74, // 6
    0x6C, // 7
    0x75, // 8
    0x7D, // 9
    0x70, // 0
    0x70, // 000
    0x66, // unknown
];

/// Keypad bit that toggles card insertion.
pub const KEYPAD_CARD_TOGGLE: u32 = 1 << 12;

// Sub-commands.
const NODE_CMD_INIT: u8 = 0x00;
const NODE_CMD_CARD_INIT: u8 = 0x10;
const NODE_CMD_CARD_INIT2: u8 = 0x11;
const NODE_CMD_CARD_GET_STATUS: u8 = 0x12;
const NODE_CMD_CARD_CTRL: u8 = 0x14;
const NODE_CMD_CARD_CTRL2: u8 = 0x15;
const NODE_CMD_CARD_WRITE: u8 = 0x16;
const NODE_CMD_CARD_READ: u8 = 0x18;
const NODE_CMD_CARD_FORMAT: u8 = 0x1E;
const NODE_CMD_CARD_FORMAT2: u8 = 0x1F;
const NODE_CMD_KEYBOARD_INIT: u8 = 0x20;
const NODE_CMD_KEYBOARD_GET_STATUS: u8 = 0x24;
const NODE_CMD_KEYBOARD_READ_DATA: u8 = 0x26;
const NODE_CMD_KEYBOARD_GET_SIZE: u8 = 0x27;

/// Card status bits reported by CARD_GET_STATUS.
const CARD_STATUS_PRESENT: u8 = 2;
const CARD_STATUS_FRONT_SENSOR: u8 = 64;
const CARD_STATUS_BACK_SENSOR: u8 = 128;

/// Slot states the game requests through CARD_CTRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSlotState {
    Close,
    Open,
    Eject,
    Format,
    Read,
    Write,
    Unknown(u8),
}

impl From<u8> for CardSlotState {
    fn from(value: u8) -> Self {
        match value {
            0 => CardSlotState::Close,
            1 => CardSlotState::Open,
            2 => CardSlotState::Eject,
            3 => CardSlotState::Format,
            4 => CardSlotState::Read,
            5 => CardSlotState::Write,
            other => CardSlotState::Unknown(other),
        }
    }
}

/// This struct models the magnetic card reader/writer with its 12-key keypad.
pub struct K573CardUnit {

    // Card image and slot.
    card_data: [u8; CARD_DATA_BYTES],
    card_loaded: bool,
    card_inserted: bool,
    last_slot_state: Option<CardSlotState>,

    // Keypad state, one bit per key as in KEYPAD_CODES plus the card toggle.
    keypad: u32,
    last_input: u32,
}

/// Implementation functions for the card unit itself.
impl K573CardUnit {

    pub fn new() -> Self {
        K573CardUnit {

            // Setup card slot.
            card_data: [0; CARD_DATA_BYTES],
            card_loaded: false,
            card_inserted: false,
            last_slot_state: None,

            // Setup keypad.
            keypad: 0,
            last_input: 0,
        }
    }

    /// Loads a card image. Short images are zero-padded.
    pub fn load_card(&mut self, image: &[u8]) {

        self.card_data = [0; CARD_DATA_BYTES];
        let count = image.len().min(CARD_DATA_BYTES);
        self.card_data[..count].copy_from_slice(&image[..count]);
        self.card_loaded = true;
    }

    /// Creates a blank card and loads it.
    pub fn create_card(&mut self) -> [u8; CARD_DATA_BYTES] {

        let mut image = [0; CARD_DATA_BYTES];
        image[..NEW_CARD_HEADER.len()].copy_from_slice(&NEW_CARD_HEADER);
        self.load_card(&image);
        image
    }

    /// Removes the card image, returning its final contents for saving.
    pub fn unload_card(&mut self) -> Option<[u8; CARD_DATA_BYTES]> {

        if !self.card_loaded {
            return None;
        }
        self.card_loaded = false;
        Some(self.card_data)
    }

    /// Updates the keypad state. The card toggle bit, when it changes, decides
    /// whether a card sits in the slot.
    pub fn set_keypad(&mut self, keypad: u32) {

        if (keypad ^ self.keypad) & KEYPAD_CARD_TOGGLE != 0 {
            self.card_inserted = keypad & KEYPAD_CARD_TOGGLE != 0;
        }
        self.keypad = keypad;
    }

    pub fn set_card_inserted(&mut self, inserted: bool) {
        self.card_inserted = inserted;
    }

    pub fn card_inserted(&self) -> bool {
        self.card_inserted
    }

    pub fn last_slot_state(&self) -> Option<CardSlotState> {
        self.last_slot_state
    }

    /// Forgets key presses seen by earlier keypad reads.
    pub fn reset(&mut self) {
        self.last_input = 0;
    }

    fn read_keypad(&mut self, message: &[u8], response: &mut Vec<u8>) {

        let key_count = decode_length(message.get(5).copied().unwrap_or(0));
        let mut found = 0;

        for (index, code) in KEYPAD_CODES.iter().enumerate().take(key_count) {
            let mask = 1 << index;
            if self.keypad & mask != 0 {
                if self.last_input & mask == 0 {
                    response.push(*code);
                }
                found |= mask;
            }
        }

        if response.is_empty() {
            response.push(0);
        }

        self.last_input = found;
    }
}

impl AcioNode for K573CardUnit {

    fn node_info(&self) -> NodeInfo {
        NodeInfo::new(3, 1, 6, "ICCA")
    }

    fn handle_message(&mut self, message: &[u8], response: &mut Vec<u8>, _response_post: &mut Vec<u8>) {

        let Some(&subcmd) = message.get(3) else {
            return;
        };
        let payload_len = decode_length(message.get(4).copied().unwrap_or(0));
        let payload = message.get(5..).unwrap_or(&[]);

        match subcmd {
            NODE_CMD_INIT
            | NODE_CMD_CARD_INIT
            | NODE_CMD_CARD_INIT2
            | NODE_CMD_KEYBOARD_INIT
            | NODE_CMD_KEYBOARD_GET_STATUS
            | NODE_CMD_CARD_FORMAT
            | NODE_CMD_CARD_FORMAT2 => response.push(0),

            NODE_CMD_CARD_GET_STATUS => {
                let state = if self.card_inserted {
                    CARD_STATUS_PRESENT | CARD_STATUS_FRONT_SENSOR | CARD_STATUS_BACK_SENSOR
                } else {
                    0
                };
                response.push(state);
            },

            NODE_CMD_CARD_CTRL | NODE_CMD_CARD_CTRL2 => {
                let state = CardSlotState::from(payload.first().copied().unwrap_or(0));
                log::info!("card unit: slot state {:?}", state);
                self.last_slot_state = Some(state);
                response.push(0);
            },

            NODE_CMD_CARD_WRITE => {
                let count = payload_len.min(CARD_DATA_BYTES).min(payload.len());
                self.card_data[..count].copy_from_slice(&payload[..count]);
                response.push(0);
            },

            NODE_CMD_CARD_READ => {
                if !self.card_loaded || !self.card_inserted {
                    response.push(0xFF);
                } else {
                    response.push(0);
                    response.extend_from_slice(&self.card_data);
                }
            },

            NODE_CMD_KEYBOARD_READ_DATA => self.read_keypad(message, response),

            NODE_CMD_KEYBOARD_GET_SIZE => response.push(0),

            _ => default_handle_message(message, response),
        }
    }
}
