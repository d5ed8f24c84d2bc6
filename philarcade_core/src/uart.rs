// SPDX-License-Identifier: GPL-3.0
// uart.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::VecDeque;

use crate::sinks::SerialLine;
use crate::timer::{EventTimer, Time};

/// Bit times taken by one 8N1 frame (start, eight data, stop).
const BITS_PER_FRAME: u64 = 10;

/// This struct paces queued response bytes onto a serial line at a fixed baud
/// rate, one byte per timer fire. The next fire comes one bit time after the
/// previous frame has fully left the wire.
pub struct UartTransmitter {

    // Pending bytes and pacing.
    queue: VecDeque<u8>,
    timer: EventTimer,
    bit_time: Time,
    line_free_at: Time,

    // Where transmitted bytes go.
    line: Option<Box<dyn SerialLine>>,
}

impl UartTransmitter {

    /// Creates a transmitter for the given baud rate.
    pub fn new(baud_rate: u32) -> Self {
        UartTransmitter {
            queue: VecDeque::new(),
            timer: EventTimer::new(),
            bit_time: Time::from_hz(baud_rate as f64),
            line_free_at: Time::ZERO,
            line: None,
        }
    }

    /// Attaches the line that transmitted bytes are delivered to.
    pub fn attach_line(&mut self, line: Box<dyn SerialLine>) {
        self.line = Some(line);
    }

    /// Drops everything queued and stops the timer.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.timer.reset();
        self.line_free_at = Time::ZERO;
    }

    pub fn queue(&mut self, bytes: impl IntoIterator<Item = u8>) {
        self.queue.extend(bytes);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Arms the response timer one bit time from now, replacing any pending fire.
    pub fn kick(&mut self, now: Time) {
        self.timer.adjust(now, self.bit_time);
    }

    pub fn next_deadline(&self) -> Option<Time> {
        self.timer.next_fire()
    }

    /// Services the response timer: sends one byte if the line is idle.
    pub fn run_timer(&mut self, now: Time) {

        if !self.timer.take_due(now) {
            return;
        }

        if now < self.line_free_at {
            // Still shifting the previous byte out.
            self.timer.adjust(self.line_free_at, self.bit_time);
            return;
        }

        let Some(byte) = self.queue.pop_front() else {
            return;
        };

        if let Some(line) = self.line.as_mut() {
            line.transmit(byte);
        }
        self.line_free_at = now + self.bit_time * BITS_PER_FRAME;
        self.timer.adjust(self.line_free_at, self.bit_time);
    }
}
