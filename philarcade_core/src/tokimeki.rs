// SPDX-License-Identifier: GPL-3.0
// tokimeki.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use crate::sinks::SerialLine;
use crate::timer::{Clock, Time, Timed};
use crate::uart::UartTransmitter;

#[cfg(test)]
mod tests;

/// Wire rate of the device.
pub const BAUD_RATE: u32 = 9600;

/// Length of the commands the device echoes back.
const ECHO_COMMAND_LENGTH: usize = 12;

/// Longest partial line kept. Anything past it can never match a command.
const MAX_MESSAGE_LENGTH: usize = ECHO_COMMAND_LENGTH + 4;

/// This struct models the line-oriented serial peripheral used by the Tokimeki
/// Memorial cabinets. Commands are newline-terminated; a NUL byte discards the
/// partial line.
pub struct TokimekiDevice {

    // Virtual time source.
    clock: Clock,

    // Partial command line.
    message: Vec<u8>,

    // Paces responses back onto the wire.
    transmitter: UartTransmitter,
}

impl TokimekiDevice {

    pub fn new(clock: Clock) -> Self {
        TokimekiDevice {
            clock,
            message: Vec::new(),
            transmitter: UartTransmitter::new(BAUD_RATE),
        }
    }

    pub fn attach_line(&mut self, line: Box<dyn SerialLine>) {
        self.transmitter.attach_line(line);
    }

    pub fn reset(&mut self) {
        self.message.clear();
        self.transmitter.reset();
    }

    /// Accepts one byte from the host.
    pub fn receive_byte(&mut self, byte: u8) {

        match byte {
            0x00 => self.message.clear(),
            b'\n' => {
                let command = std::mem::take(&mut self.message);
                log::debug!("tokimeki: command {:?}", String::from_utf8_lossy(&command));

                if command == b"S" {
                    self.transmitter.queue(*b"EN\n");
                } else if command.len() == ECHO_COMMAND_LENGTH {
                    self.transmitter.queue(command);
                    self.transmitter.queue([b'\n']);
                }

                self.transmitter.kick(self.clock.now());
            },
            other if self.message.len() < MAX_MESSAGE_LENGTH => self.message.push(other),
            other => log::trace!("tokimeki: dropping byte {:02x} from an overlong line", other),
        }
    }
}

impl Timed for TokimekiDevice {

    fn next_deadline(&self) -> Option<Time> {
        self.transmitter.next_deadline()
    }

    fn run_timers(&mut self, now: Time) {
        self.transmitter.run_timer(now);
    }
}
