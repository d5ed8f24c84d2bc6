// SPDX-License-Identifier: GPL-3.0
// acio.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

/// This module contains the ACIO bus host, which frames the byte stream and
/// dispatches packets to its nodes.
pub mod k573_acio;

/// This module contains the magnetic card reader and keypad node.
pub mod card_unit;

#[cfg(test)]
mod tests;

/// First byte of every packet.
pub const HEADER_BYTE: u8 = 0xAA;

/// Command byte values.
pub const SERIAL_REQ: u8 = 0xAA;
pub const SERIAL_RESP: u8 = 0xAA;
pub const NODE_REQ: u8 = 0x00;
pub const NODE_RESP: u8 = 0x01;

/// Sub-command every node understands.
pub const NODE_CMD_INIT: u8 = 0x00;

/// Identification data a node reports to the VERSION sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_type: u32,
    pub flag: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub product_name: [u8; 8],
}

impl NodeInfo {

    /// Builds node info with a product name padded with zeros to 8 bytes.
    pub fn new(node_type: u32, major: u8, minor: u8, product_name: &str) -> Self {

        let mut name = [0; 8];
        for (slot, byte) in name.iter_mut().zip(product_name.bytes()) {
            *slot = byte;
        }

        NodeInfo {
            node_type,
            flag: 0,
            major,
            minor,
            revision: 0,
            product_name: name,
        }
    }
}

/// This trait is implemented by every device that can sit on the ACIO bus. The
/// host hands a node each packet addressed to it; the node fills in its
/// response payload and, rarely, raw bytes to send after the framed response.
pub trait AcioNode {

    /// Implementations must return their identification data.
    fn node_info(&self) -> NodeInfo;

    /// Implementations must handle one complete request packet (header through
    /// checksum). An empty `response` means no reply is sent.
    fn handle_message(&mut self, message: &[u8], response: &mut Vec<u8>, _response_post: &mut Vec<u8>) {
        default_handle_message(message, response);
    }
}

/// Shared node behaviour: acknowledge INIT with status 0, ignore anything else.
pub fn default_handle_message(message: &[u8], response: &mut Vec<u8>) {

    if message.get(3) == Some(&NODE_CMD_INIT) {
        response.push(0);
    }
}

/// Decodes a packet length code into a payload byte count. Codes whose shift
/// would overflow decode to a length no packet can reach.
pub fn decode_length(code: u8) -> usize {

    if code == 0 {
        return 0;
    }
    let shift = code as u32 - 1;
    if shift >= 31 {
        return usize::MAX / 2;
    }
    (1_usize << shift) + if code & 0xF0 != 0 { 1 } else { 0 }
}

/// Encodes a payload byte count into a length code, exactly as the hardware does.
/// Only 1 and powers of two from 16 upwards survive a decode unchanged.
pub fn encode_length(size: usize) -> u8 {

    let mut bit = 0;
    while (1_usize << bit) < (size & !0x0F) {
        bit += 1;
    }
    let partial = if size != (1_usize << bit) { 0x10 } else { 0 };
    ((bit + 1) as u8) | partial
}

/// Sum of the given bytes, low 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0_u8, |sum, byte| sum.wrapping_add(*byte))
}

/// This struct is a node with nothing but the shared INIT behaviour, for
/// filling out a chain with devices whose commands are not modelled.
pub struct GenericNode {
    info: NodeInfo,
}

impl GenericNode {

    pub fn new(info: NodeInfo) -> Self {
        GenericNode { info }
    }
}

impl AcioNode for GenericNode {

    fn node_info(&self) -> NodeInfo {
        self.info
    }
}
