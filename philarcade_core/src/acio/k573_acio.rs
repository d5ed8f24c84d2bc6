// SPDX-License-Identifier: GPL-3.0
// k573_acio.rs - Copyright Phillip Potter, 2026, under GPLv3 only.

use std::collections::VecDeque;

use super::{
    checksum, decode_length, encode_length, AcioNode, HEADER_BYTE, NODE_REQ, NODE_RESP,
    SERIAL_REQ, SERIAL_RESP,
};
use crate::sinks::SerialLine;
use crate::timer::{Clock, Time, Timed};
use crate::uart::UartTransmitter;

/// Wire rate of the bus.
pub const BAUD_RATE: u32 = 38400;

/// Host sub-commands.
const CMD_NODE_COUNT: u8 = 0x01;
const CMD_VERSION: u8 = 0x02;
const CMD_EXEC: u8 = 0x03;

/// The two sync sequences, in the order they must arrive.
const SYNC_1: [u8; 4] = [0xAA, 0xAA, 0xAA, 0x55];
const SYNC_2: [u8; 4] = [0xAA, 0xAA, 0x00, 0x00];

/// Smallest buffer that can hold a packet with an empty payload.
const MIN_PACKET_BYTES: usize = 6;

/// Where the host is in its startup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Sync1,
    Ready,
}

/// This struct models the host side of the ACIO bus. It buffers bytes from the
/// game, echoes the sync sequences, answers host-level requests itself and
/// forwards node requests to its attached nodes, which are numbered from 1 in
/// the order they were added.
pub struct K573AcioHost {

    // Virtual time source.
    clock: Clock,

    // Receive buffer and protocol state.
    message: VecDeque<u8>,
    sync_state: SyncState,

    // Daisy chain, index 0 is node 1.
    nodes: Vec<Box<dyn AcioNode>>,

    // Paces responses back onto the wire.
    transmitter: UartTransmitter,
}

/// Implementation functions for the ACIO host itself.
impl K573AcioHost {

    /// Creates a host with no nodes attached.
    pub fn new(clock: Clock) -> Self {
        K573AcioHost {

            // Setup time source.
            clock,

            // Setup protocol state.
            message: VecDeque::new(),
            sync_state: SyncState::Unsynced,

            // Setup node chain.
            nodes: Vec::new(),

            // Setup response pacing.
            transmitter: UartTransmitter::new(BAUD_RATE),
        }
    }

    /// Attaches a node to the end of the chain and returns its node id. Node
    /// ids and the node count are single bytes, so the chain holds at most
    /// 255 nodes; past that the node is refused.
    pub fn add_node(&mut self, node: Box<dyn AcioNode>) -> Option<u8> {

        let Ok(node_id) = u8::try_from(self.nodes.len() + 1) else {
            log::error!("acio: chain is full, refusing node");
            return None;
        };
        self.nodes.push(node);
        Some(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Gives mutable access to an attached node, by node id.
    pub fn node_mut(&mut self, node_id: u8) -> Option<&mut (dyn AcioNode + 'static)> {

        let index = (node_id as usize).checked_sub(1)?;
        self.nodes.get_mut(index).map(|node| node.as_mut())
    }

    /// Attaches the line responses are transmitted on.
    pub fn attach_line(&mut self, line: Box<dyn SerialLine>) {
        self.transmitter.attach_line(line);
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    /// Returns the number of response bytes still waiting to go out.
    pub fn pending_response_bytes(&self) -> usize {
        self.transmitter.queue_len()
    }

    /// Returns the host to its power-on state. Attached nodes stay attached.
    pub fn reset(&mut self) {

        self.message.clear();
        self.transmitter.reset();
        self.sync_state = SyncState::Unsynced;
    }

    /// Accepts one byte from the game side of the wire.
    pub fn receive_byte(&mut self, byte: u8) {

        self.message.push_back(byte);

        while self.message.front().is_some_and(|front| *front != HEADER_BYTE) {
            self.message.pop_front();
        }

        if self.process_message() {
            self.transmitter.kick(self.clock.now());
        }
    }

    /// Handles whatever the receive buffer now holds. Returns false when the
    /// buffer was incomplete or the packet was dropped, in which case the
    /// response timer is left alone.
    fn process_message(&mut self) -> bool {

        // Header, command, node id and sub-command at minimum.
        if self.message.len() < 4 {
            return false;
        }

        let head = [self.message[0], self.message[1], self.message[2], self.message[3]];

        if head == SYNC_1 {
            self.message.drain(..4);
            self.transmitter.queue(SYNC_1);
            self.sync_state = SyncState::Sync1;
            log::debug!("acio: sync 1");
            return true;
        }

        if self.sync_state == SyncState::Sync1 && head == SYNC_2 {
            self.message.drain(..4);
            self.transmitter.queue(SYNC_2);
            self.sync_state = SyncState::Ready;
            log::debug!("acio: sync 2, bus ready");
            return true;
        }

        if self.sync_state != SyncState::Ready || self.message.len() < MIN_PACKET_BYTES {
            return true;
        }

        let payload_len = decode_length(self.message[4]);
        let packet_len = payload_len.saturating_add(MIN_PACKET_BYTES);
        if self.message.len() < packet_len {
            return false;
        }

        let packet: Vec<u8> = self.message.drain(..packet_len).collect();
        let expected = checksum(&packet[1..packet_len - 1]);
        if expected != packet[packet_len - 1] {
            log::trace!(
                "acio: checksum mismatch {:02x} vs {:02x}, dropping {:02x?}",
                packet[packet_len - 1], expected, packet
            );
            return false;
        }

        log::trace!("acio: command {:02x?}", packet);

        match packet[1] {
            SERIAL_REQ => self.handle_serial_request(&packet),
            NODE_REQ => self.handle_node_request(&packet),
            command => {
                log::warn!("acio: unknown command {:02x}", command);
                true
            },
        }
    }

    /// Answers a request addressed to the host itself.
    fn handle_serial_request(&mut self, packet: &[u8]) -> bool {

        let node_id = packet[2];
        let subcmd = packet[3];

        if !matches!(subcmd, CMD_NODE_COUNT | CMD_VERSION | CMD_EXEC) {
            log::warn!("acio: unknown host sub-command {:02x}", subcmd);
            return false;
        }

        let mut response = vec![HEADER_BYTE, SERIAL_RESP, node_id, subcmd, 0];
        if subcmd != CMD_NODE_COUNT {
            response.extend_from_slice(&packet[..MIN_PACKET_BYTES]);
        }

        match subcmd {
            CMD_NODE_COUNT => response.push(self.nodes.len() as u8),
            CMD_VERSION => {
                let info = (node_id as usize)
                    .checked_sub(1)
                    .and_then(|index| self.nodes.get(index))
                    .map(|node| node.node_info());
                match info {
                    Some(info) => {
                        response.extend_from_slice(&info.node_type.to_le_bytes());
                        response.extend_from_slice(&[info.flag, info.major, info.minor, info.revision]);
                        response.extend_from_slice(&info.product_name);
                    },
                    None => response.extend_from_slice(&[0; 16]),
                }
            },
            _ => response.push(0),
        }

        response[4] = encode_length(response.len() - 5);
        let sum = checksum(&response[1..]);
        response.push(sum);

        log::trace!("acio: response {:02x?}", response);
        self.transmitter.queue(response);
        true
    }

    /// Forwards a request to the node it names and frames the node's reply.
    fn handle_node_request(&mut self, packet: &[u8]) -> bool {

        let node_id = packet[2];
        let subcmd = packet[3];

        let mut reply = Vec::new();
        let mut reply_post = Vec::new();

        match self.node_mut(node_id) {
            Some(node) => node.handle_message(packet, &mut reply, &mut reply_post),
            None => log::debug!("acio: no node {} on the bus", node_id),
        }

        if reply.is_empty() {
            return false;
        }

        let mut response = packet.to_vec();
        response.push(HEADER_BYTE);
        let framed_from = response.len();
        response.extend_from_slice(&[NODE_RESP, node_id, subcmd, encode_length(reply.len())]);
        response.extend_from_slice(&reply);
        let sum = checksum(&response[framed_from..]);
        response.push(sum);
        response.extend_from_slice(&reply_post);

        log::trace!("acio: response {:02x?}", response);
        self.transmitter.queue(response);
        true
    }
}

impl Timed for K573AcioHost {

    fn next_deadline(&self) -> Option<Time> {
        self.transmitter.next_deadline()
    }

    fn run_timers(&mut self, now: Time) {
        self.transmitter.run_timer(now);
    }
}
