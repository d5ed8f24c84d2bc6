// SPDX-License-Identifier: GPL-3.0
// npu.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::VecDeque;

/// This module contains the network settings file parser.
pub mod config;

/// This module contains the sector storage the filesystems sit on.
pub mod storage;

/// This module contains the PythonFS filesystem.
pub mod pythonfs;

/// This module contains the host sockets backing the card's socket opcodes.
pub mod net;

/// This module contains the PC card register interface and its worker.
pub mod k573_npu_card;


/// Size in bytes of each FIFO ring; tail offsets wrap at this size.
pub const FIFO_BYTES: usize = 0x10000;

/// This struct is a FIFO of 16-bit words that also tracks the byte offset of
/// its tail within the ring the hardware exposes.
#[derive(Debug, Clone, Default)]
pub struct WordFifo {
    words: VecDeque<u16>,
    tail: usize,
}

impl WordFifo {

    pub fn new() -> Self {
        WordFifo {
            words: VecDeque::new(),
            tail: 0,
        }
    }

    pub fn push(&mut self, word: u16) {
        self.words.push_back(word);
        self.tail = (self.tail + 2) % FIFO_BYTES;
    }

    pub fn extend(&mut self, words: &[u16]) {
        for word in words {
            self.push(*word);
        }
    }

    pub fn pop(&mut self) -> Option<u16> {
        self.words.pop_front()
    }

    /// Returns the word `index` places from the head, if there is one.
    pub fn at(&self, index: usize) -> Option<u16> {
        self.words.get(index).copied()
    }

    /// Removes up to `count` words from the head.
    pub fn take(&mut self, count: usize) -> Vec<u16> {
        let count = count.min(self.words.len());
        self.words.drain(..count).collect()
    }

    /// Returns the queued length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.words.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the byte offset of the tail in the ring.
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Discards all queued words, leaving the tail where it was.
    pub fn drain_all(&mut self) {
        self.words.clear();
    }

    /// Empties the FIFO and rewinds it to the start of the ring.
    pub fn clear(&mut self) {
        self.words.clear();
        self.tail = 0;
    }
}

/// Packs bytes two to a word, low byte first. An odd trailing byte takes the
/// low half of a final word.
pub fn pack_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| pair[0] as u16 | (pair.get(1).copied().unwrap_or(0) as u16) << 8)
        .collect()
}
